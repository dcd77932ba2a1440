//! SQLite 网关：验证基座
//!
//! 与生产网关实现同一接口，但落在内嵌 SQLite 上：导出生成与 `pg_dump
//! --inserts` 同构的 INSERT 脚本，导入直接回放脚本。验证基座与测试
//! 通过它驱动完整的 备份 → 迁移 → 校验 → 恢复 周期，无需在线 Postgres。

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::Connection;

use super::DataStoreGateway;
use crate::error::{OpsError, Result};

/// 内嵌 SQLite 数据存储网关
pub struct SqliteGateway {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> OpsError {
    OpsError::Database(e.to_string())
}

/// 渲染为 SQL 字面量（INSERT 脚本用）
fn sql_literal(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(r) => r.to_string(),
        ValueRef::Text(t) => {
            let text = String::from_utf8_lossy(t);
            format!("'{}'", text.replace('\'', "''"))
        }
        ValueRef::Blob(b) => format!("X'{}'", hex::encode(b)),
    }
}

/// 渲染为纯文本（标量查询结果用）
fn plain_text(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(r) => r.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => hex::encode(b),
    }
}

impl SqliteGateway {
    /// 打开（或创建）文件型数据库
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// 内存数据库（单测用）
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| OpsError::Database("connection lock poisoned".to_string()))
    }

    /// 生成单表数据的 INSERT 脚本
    fn dump_table(conn: &Connection, table: &str) -> Result<String> {
        let mut stmt = conn
            .prepare(&format!("SELECT * FROM {}", table))
            .map_err(db_err)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut script = format!("-- data-only dump of table {}\n", table);
        let mut rows = stmt.query([]).map_err(db_err)?;
        while let Some(row) = rows.next().map_err(db_err)? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(sql_literal(row.get_ref(i).map_err(db_err)?));
            }
            script.push_str(&format!(
                "INSERT INTO {} ({}) VALUES ({});\n",
                table,
                columns.join(", "),
                values.join(", ")
            ));
        }
        Ok(script)
    }

    fn user_tables(conn: &Connection) -> Result<Vec<(String, String)>> {
        let mut stmt = conn
            .prepare(
                "SELECT name, sql FROM sqlite_master \
                 WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )
            .map_err(db_err)?;
        let mut rows = stmt.query([]).map_err(db_err)?;
        let mut tables = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            let name: String = row.get(0).map_err(db_err)?;
            let sql: Option<String> = row.get(1).map_err(db_err)?;
            if let Some(sql) = sql {
                tables.push((name, sql));
            }
        }
        Ok(tables)
    }
}

#[async_trait]
impl DataStoreGateway for SqliteGateway {
    async fn export_table(&self, table: &str, output: &Path) -> Result<()> {
        let conn = self.lock()?;
        let script = Self::dump_table(&conn, table)?;
        std::fs::write(output, script)?;
        Ok(())
    }

    async fn import_table(&self, _table: &str, dump: &Path) -> Result<()> {
        let script = std::fs::read_to_string(dump)?;
        let conn = self.lock()?;
        conn.execute_batch(&script).map_err(db_err)?;
        Ok(())
    }

    async fn truncate_table(&self, table: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(&format!("DELETE FROM {}", table), [])
            .map_err(db_err)?;
        Ok(())
    }

    async fn run_scalar_query(&self, sql: &str) -> Result<String> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let mut rows = stmt.query([]).map_err(db_err)?;
        match rows.next().map_err(db_err)? {
            Some(row) => Ok(plain_text(row.get_ref(0).map_err(db_err)?)),
            None => Ok(String::new()),
        }
    }

    async fn run_rows_query(&self, sql: &str) -> Result<Vec<Vec<String>>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let column_count = stmt.column_count();
        let mut rows = stmt.query([]).map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            let mut cols = Vec::with_capacity(column_count);
            for i in 0..column_count {
                cols.push(plain_text(row.get_ref(i).map_err(db_err)?));
            }
            out.push(cols);
        }
        Ok(out)
    }

    async fn run_sql(&self, sql: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(sql).map_err(db_err)?;
        Ok(())
    }

    async fn full_export(&self, output: &Path) -> Result<()> {
        let conn = self.lock()?;
        let mut script = String::from("-- full database dump\n");
        for (name, create_sql) in Self::user_tables(&conn)? {
            script.push_str(&create_sql);
            script.push_str(";\n");
            script.push_str(&Self::dump_table(&conn, &name)?);
        }
        std::fs::write(output, script)?;
        Ok(())
    }

    async fn full_import(&self, dump: &Path) -> Result<()> {
        let script = std::fs::read_to_string(dump)?;
        let conn = self.lock()?;
        conn.execute_batch(&script).map_err(db_err)?;
        Ok(())
    }

    async fn snapshot_tables(&self, namespace: &str, tables: &[String]) -> Result<()> {
        let conn = self.lock()?;
        for table in tables {
            // SQLite 无 schema 概念，用前缀表固化
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {}_{} AS SELECT * FROM {};",
                namespace, table, table
            ))
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                [table],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seeded_gateway() -> SqliteGateway {
        let gateway = SqliteGateway::open_in_memory().unwrap();
        let conn = gateway.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id TEXT PRIMARY KEY, email TEXT, tier TEXT);
             INSERT INTO users VALUES ('u1', 'a@example.com', NULL);
             INSERT INTO users VALUES ('u2', 'b''quote@example.com', 'VVIP');",
        )
        .unwrap();
        drop(conn);
        gateway
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let gateway = seeded_gateway();
        let dir = TempDir::new().unwrap();
        let dump = dir.path().join("users.sql");

        gateway.export_table("users", &dump).await.unwrap();
        gateway.truncate_table("users").await.unwrap();
        assert_eq!(
            gateway
                .run_scalar_query("SELECT COUNT(*) FROM users")
                .await
                .unwrap(),
            "0"
        );

        gateway.import_table("users", &dump).await.unwrap();
        assert_eq!(
            gateway
                .run_scalar_query("SELECT COUNT(*) FROM users")
                .await
                .unwrap(),
            "2"
        );
        // 单引号转义经导出/回放后保持原值
        let email = gateway
            .run_scalar_query("SELECT email FROM users WHERE id='u2'")
            .await
            .unwrap();
        assert_eq!(email, "b'quote@example.com");
    }

    #[tokio::test]
    async fn test_scalar_query_null_and_empty() {
        let gateway = seeded_gateway();
        let null_tier = gateway
            .run_scalar_query("SELECT tier FROM users WHERE id='u1'")
            .await
            .unwrap();
        assert_eq!(null_tier, "");

        let no_rows = gateway
            .run_scalar_query("SELECT id FROM users WHERE id='missing'")
            .await
            .unwrap();
        assert_eq!(no_rows, "");
    }

    #[tokio::test]
    async fn test_rows_query_shapes_columns() {
        let gateway = seeded_gateway();
        let rows = gateway
            .run_rows_query("SELECT id, tier FROM users ORDER BY id")
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec!["u1".to_string(), String::new()]);
        assert_eq!(rows[1], vec!["u2".to_string(), "VVIP".to_string()]);
    }

    #[tokio::test]
    async fn test_snapshot_tables_creates_prefixed_copy() {
        let gateway = seeded_gateway();
        gateway
            .snapshot_tables("restore_safety_20260830", &["users".to_string()])
            .await
            .unwrap();
        assert!(gateway
            .table_exists("restore_safety_20260830_users")
            .await
            .unwrap());
        assert_eq!(
            gateway
                .run_scalar_query("SELECT COUNT(*) FROM restore_safety_20260830_users")
                .await
                .unwrap(),
            "2"
        );
    }

    #[tokio::test]
    async fn test_full_export_contains_schema_and_data() {
        let gateway = seeded_gateway();
        let dir = TempDir::new().unwrap();
        let dump = dir.path().join("full_backup.sql");
        gateway.full_export(&dump).await.unwrap();

        let content = std::fs::read_to_string(&dump).unwrap();
        assert!(content.contains("CREATE TABLE users"));
        assert!(content.contains("INSERT INTO users"));
    }
}
