//! Postgres 网关：外呼 `pg_dump` / `psql`
//!
//! 每个方法对应一次原生工具调用，进程退出码非零即视为工具调用错误，
//! stderr 原样带回供运维排查。命令通过参数向量传递，不经 shell 拼接。

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

use super::DataStoreGateway;
use crate::error::{OpsError, Result};

/// Postgres 数据存储网关
pub struct PsqlGateway {
    database_url: String,
}

impl PsqlGateway {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// 执行外部命令，失败时带回 stderr
    async fn run_command(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| OpsError::tool(program, format!("failed to spawn: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OpsError::tool(
                program,
                format!("exit status {:?}: {}", output.status.code(), stderr.trim()),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn psql(&self, extra: &[&str]) -> Result<String> {
        let mut args = vec![self.database_url.as_str(), "-v", "ON_ERROR_STOP=1"];
        args.extend_from_slice(extra);
        self.run_command("psql", &args).await
    }
}

#[async_trait]
impl DataStoreGateway for PsqlGateway {
    async fn export_table(&self, table: &str, output: &Path) -> Result<()> {
        let target = format!("public.{}", table);
        let out = output.to_string_lossy();
        self.run_command(
            "pg_dump",
            &[
                self.database_url.as_str(),
                "-t",
                &target,
                "--data-only",
                "--inserts",
                "-f",
                &out,
            ],
        )
        .await?;
        Ok(())
    }

    async fn import_table(&self, _table: &str, dump: &Path) -> Result<()> {
        let file = dump.to_string_lossy();
        self.psql(&["-f", &file]).await?;
        Ok(())
    }

    async fn truncate_table(&self, table: &str) -> Result<()> {
        let sql = format!("TRUNCATE TABLE public.{} CASCADE;", table);
        self.psql(&["-c", &sql]).await?;
        Ok(())
    }

    async fn run_scalar_query(&self, sql: &str) -> Result<String> {
        let stdout = self.psql(&["-t", "-c", sql]).await?;
        Ok(stdout.trim().to_string())
    }

    async fn run_rows_query(&self, sql: &str) -> Result<Vec<Vec<String>>> {
        // -A 去对齐, -F'|' 字段分隔, -t 只输出数据行
        let stdout = self.psql(&["-t", "-A", "-F", "|", "-c", sql]).await?;
        Ok(stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| line.split('|').map(|col| col.to_string()).collect())
            .collect())
    }

    async fn run_sql(&self, sql: &str) -> Result<()> {
        self.psql(&["-c", sql]).await?;
        Ok(())
    }

    async fn full_export(&self, output: &Path) -> Result<()> {
        let out = output.to_string_lossy();
        self.run_command("pg_dump", &[self.database_url.as_str(), "-f", &out])
            .await?;
        Ok(())
    }

    async fn full_import(&self, dump: &Path) -> Result<()> {
        let file = dump.to_string_lossy();
        self.psql(&["-f", &file]).await?;
        Ok(())
    }

    async fn snapshot_tables(&self, namespace: &str, tables: &[String]) -> Result<()> {
        let mut sql = format!("CREATE SCHEMA IF NOT EXISTS {};\n", namespace);
        for table in tables {
            sql.push_str(&format!(
                "CREATE TABLE IF NOT EXISTS {}.{} AS SELECT * FROM public.{};\n",
                namespace, table, table
            ));
        }
        self.psql(&["-c", &sql]).await?;
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_name = '{}'",
            table
        );
        let count = self.run_scalar_query(&sql).await?;
        Ok(count.trim() != "0" && !count.trim().is_empty())
    }
}
