//! # Restore Manager (恢复管理器)
//!
//! 从指定（或最新）快照执行破坏性恢复：
//!
//! 1. 定位快照：未指定时取 `^\d{14}$` 目录中字典序最大者
//! 2. 默认先重算产物校验和并与清单比对，不匹配则在任何破坏性动作前中止
//! 3. 先对在线数据做安全快照（脚本落盘 + 通过网关固化到独立命名空间）
//! 4. 按清单声明顺序逐表 truncate（级联）后回放导出文件；
//!    外键依赖顺序由运维人员在 `CRITICAL_TABLES` 中保证，本模块不做推断
//! 5. 回读各表行数并记录；空表是合法状态，但计数查询本身必须成功
//!
//! 任一表恢复失败即致命并终止序列；已恢复的表不自动回退，
//! 第 3 步的安全快照是人工介入时的恢复路径。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use crate::checksum::BackupManifest;
use crate::config::OpsConfig;
use crate::error::{OpsError, Result};
use crate::gateway::DataStoreGateway;

/// 一次成功恢复的摘要
#[derive(Debug)]
pub struct RestoreSummary {
    /// 被恢复的快照标识
    pub timestamp: String,
    pub tables_restored: Vec<String>,
    /// 恢复后回读的各表行数
    pub row_counts: BTreeMap<String, u64>,
    /// 安全快照命名空间
    pub safety_namespace: String,
    pub duration_secs: u64,
}

/// 恢复管理器
pub struct RestoreManager {
    config: OpsConfig,
    gateway: Arc<dyn DataStoreGateway>,
    verify_before_restore: bool,
}

impl RestoreManager {
    pub fn new(config: OpsConfig, gateway: Arc<dyn DataStoreGateway>) -> Self {
        Self {
            config,
            gateway,
            verify_before_restore: true,
        }
    }

    /// 关闭恢复前校验（仅限产物已被人工确认的场景）
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify_before_restore = verify;
        self
    }

    /// 执行恢复流程
    pub async fn restore(&self, timestamp: Option<&str>) -> Result<RestoreSummary> {
        let start = Instant::now();
        tracing::info!("🚀 [Restore] 开始数据库恢复流程");

        // Step 1: 定位快照
        let timestamp = match timestamp {
            Some(ts) => ts.to_string(),
            None => self.find_latest_snapshot()?,
        };
        let snapshot_dir = self.config.backup_dir.join(&timestamp);
        if !snapshot_dir.is_dir() {
            return Err(OpsError::Integrity(format!(
                "Snapshot directory not found: {}",
                snapshot_dir.display()
            )));
        }
        tracing::info!("📅 [Restore] 恢复快照: {}", timestamp);

        let manifest = BackupManifest::load(&snapshot_dir)?;

        // Step 2: 破坏性动作前的完整性校验
        if self.verify_before_restore {
            tracing::info!("🔍 [Restore] 恢复前验证备份完整性...");
            manifest.verify_artifacts(&snapshot_dir)?;
        } else {
            tracing::warn!("⚠️ [Restore] 已跳过恢复前完整性校验");
        }

        // Step 3: 在线数据安全快照
        let safety_namespace = self.create_safety_snapshot(&manifest).await?;

        // Step 4: 按清单顺序逐表恢复
        tracing::info!("📦 [Restore] 开始恢复关键表...");
        let mut tables_restored = Vec::new();
        for table in &manifest.tables {
            let artifact = BackupManifest::table_artifact(&snapshot_dir, table);
            if !artifact.is_file() {
                return Err(OpsError::Integrity(format!(
                    "Backup artifact missing for table '{}': {}",
                    table,
                    artifact.display()
                )));
            }
            self.gateway.truncate_table(table).await?;
            self.gateway.import_table(table, &artifact).await?;
            tracing::info!("✅ [Restore] 已恢复表: {}", table);
            tables_restored.push(table.clone());
        }

        // Step 5: 行数回读（空表合法，计数查询必须成功）
        tracing::info!("🔍 [Restore] 验证恢复结果...");
        let mut row_counts = BTreeMap::new();
        for table in &manifest.tables {
            let raw = self
                .gateway
                .run_scalar_query(&format!("SELECT COUNT(*) FROM {}", table))
                .await?;
            let count: u64 = raw.trim().parse().map_err(|_| {
                OpsError::Integrity(format!(
                    "Row count query for table '{}' returned non-numeric value '{}'",
                    table, raw
                ))
            })?;
            tracing::info!("✅ [Restore] 表 {}: {} 条记录", table, count);
            row_counts.insert(table.clone(), count);
        }

        let duration_secs = start.elapsed().as_secs();
        tracing::info!(
            "✅ [Restore] 数据库恢复完成, 耗时 {}s, 恢复表: {}",
            duration_secs,
            tables_restored.join(", ")
        );

        Ok(RestoreSummary {
            timestamp,
            tables_restored,
            row_counts,
            safety_namespace,
            duration_secs,
        })
    }

    /// 列出备份根目录下的合法快照并取字典序最大者
    fn find_latest_snapshot(&self) -> Result<String> {
        let entries = std::fs::read_dir(&self.config.backup_dir).map_err(|e| {
            OpsError::Integrity(format!(
                "Failed to list backup directory {}: {}",
                self.config.backup_dir.display(),
                e
            ))
        })?;

        let mut snapshots: Vec<String> = entries
            .filter_map(|entry| match entry {
                Ok(e) => Some(e),
                Err(err) => {
                    tracing::warn!("[Restore] 跳过无法读取的目录项: {}", err);
                    None
                }
            })
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| is_snapshot_id(name))
            .collect();

        snapshots.sort();
        let latest = snapshots
            .pop()
            .ok_or_else(|| OpsError::Integrity("No backups found".to_string()))?;

        tracing::info!(
            "📂 [Restore] 找到 {} 个快照, 使用最新: {}",
            snapshots.len() + 1,
            latest
        );
        Ok(latest)
    }

    /// 破坏性恢复前固化在线数据
    ///
    /// 安全脚本先落盘（产物必须先于第一条破坏性语句存在且非空），
    /// 随后通过网关真正执行固化，保证恢复本身可被撤销。
    async fn create_safety_snapshot(&self, manifest: &BackupManifest) -> Result<String> {
        tracing::info!("🔒 [Restore] 创建恢复前安全快照...");
        let safety_ts = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let namespace = format!("restore_safety_{}", safety_ts);

        let mut sql = format!("CREATE SCHEMA IF NOT EXISTS {};\n", namespace);
        for table in &manifest.tables {
            sql.push_str(&format!(
                "CREATE TABLE IF NOT EXISTS {}.{} AS SELECT * FROM public.{};\n",
                namespace, table, table
            ));
        }
        let script_path = self
            .config
            .backup_dir
            .join(format!("safety_{}.sql", safety_ts));
        std::fs::write(&script_path, &sql)?;

        self.gateway
            .snapshot_tables(&namespace, &manifest.tables)
            .await?;
        tracing::info!("✅ [Restore] 安全快照命名空间: {}", namespace);
        Ok(namespace)
    }

}

/// 快照目录名：恰好 14 位数字
pub fn is_snapshot_id(name: &str) -> bool {
    name.len() == 14 && name.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupManager;
    use crate::gateway::SqliteGateway;
    use tempfile::TempDir;

    fn test_config(backup_dir: &std::path::Path) -> OpsConfig {
        let dir = backup_dir.display().to_string();
        OpsConfig::from_lookup(|key| match key {
            "DATABASE_URL" => Some("sqlite://test".to_string()),
            "BACKUP_DIR" => Some(dir.clone()),
            "CRITICAL_TABLES" => Some("users,codes,registrations".to_string()),
            _ => None,
        })
        .unwrap()
    }

    async fn seeded_gateway() -> Arc<SqliteGateway> {
        let gateway = Arc::new(SqliteGateway::open_in_memory().unwrap());
        gateway
            .run_sql(
                "CREATE TABLE users (id TEXT PRIMARY KEY, tier TEXT);
                 CREATE TABLE codes (id TEXT PRIMARY KEY, type TEXT);
                 CREATE TABLE registrations (id TEXT PRIMARY KEY, user_id TEXT);
                 INSERT INTO users VALUES ('u1', 'VVIP');
                 INSERT INTO users VALUES ('u2', NULL);
                 INSERT INTO registrations VALUES ('r1', 'u1');",
            )
            .await
            .unwrap();
        gateway
    }

    #[test]
    fn test_snapshot_id_pattern() {
        assert!(is_snapshot_id("20260830143015"));
        assert!(!is_snapshot_id("2026083014301"));
        assert!(!is_snapshot_id("20260830T43015"));
        assert!(!is_snapshot_id("latest"));
    }

    #[tokio::test]
    async fn test_restore_round_trip_preserves_rows() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let gateway = seeded_gateway().await;

        let backup = BackupManager::new(config.clone(), gateway.clone());
        let summary = backup.create_backup().await.unwrap();

        // 备份后蹂躏在线数据
        gateway
            .run_sql("DELETE FROM users; INSERT INTO users VALUES ('intruder', 'FREE');")
            .await
            .unwrap();

        let restore = RestoreManager::new(config, gateway.clone());
        let result = restore.restore(Some(&summary.timestamp)).await.unwrap();

        assert_eq!(result.row_counts["users"], 2);
        assert_eq!(result.row_counts["codes"], 0); // 空表是合法状态
        assert_eq!(result.row_counts["registrations"], 1);
        let intruders = gateway
            .run_scalar_query("SELECT COUNT(*) FROM users WHERE id='intruder'")
            .await
            .unwrap();
        assert_eq!(intruders, "0");
    }

    #[tokio::test]
    async fn test_latest_snapshot_resolution_is_lexicographic() {
        let dir = TempDir::new().unwrap();
        for name in ["20260101000000", "20260830120000", "20250101000000", "junk"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        let gateway = seeded_gateway().await;
        let restore = RestoreManager::new(test_config(dir.path()), gateway);
        assert_eq!(restore.find_latest_snapshot().unwrap(), "20260830120000");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_blocks_destruction() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let gateway = seeded_gateway().await;

        let backup = BackupManager::new(config.clone(), gateway.clone());
        let summary = backup.create_backup().await.unwrap();

        // 篡改产物
        std::fs::write(summary.snapshot_dir.join("users.sql"), "-- tampered\n").unwrap();

        let restore = RestoreManager::new(config, gateway.clone());
        let err = restore.restore(Some(&summary.timestamp)).await.unwrap_err();
        assert!(matches!(err, OpsError::Integrity(_)));

        // 在线数据必须原封未动
        let count = gateway
            .run_scalar_query("SELECT COUNT(*) FROM users")
            .await
            .unwrap();
        assert_eq!(count, "2");
    }

    #[tokio::test]
    async fn test_safety_snapshot_exists_before_restore_completes() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let gateway = seeded_gateway().await;

        let backup = BackupManager::new(config.clone(), gateway.clone());
        let summary = backup.create_backup().await.unwrap();

        let restore = RestoreManager::new(config.clone(), gateway.clone());
        let result = restore.restore(Some(&summary.timestamp)).await.unwrap();

        // 安全快照产物存在且非空
        let scripts: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("safety_")
            })
            .collect();
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].metadata().unwrap().len() > 0);

        // 安全命名空间里的固化表真实存在，保留恢复前的数据
        let safety_users = format!("{}_users", result.safety_namespace);
        assert!(gateway.table_exists(&safety_users).await.unwrap());
    }

    #[tokio::test]
    async fn test_no_snapshots_is_an_error() {
        let dir = TempDir::new().unwrap();
        let gateway = seeded_gateway().await;
        let restore = RestoreManager::new(test_config(dir.path()), gateway);
        let err = restore.restore(None).await.unwrap_err();
        assert!(matches!(err, OpsError::Integrity(_)));
    }
}
