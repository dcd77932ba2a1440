//! # Backup Manager (备份管理器)
//!
//! 产出一次带时间戳、带校验和的快照：
//!
//! 1. 创建时间戳命名的输出目录（秒级 14 位标识，字典序可排）
//! 2. 写出 schema 固化脚本（副产物，不自动执行，防止后续导出失败时数据全失）
//! 3. 逐个关键表导出数据并计算 SHA256
//! 4. 全库导出
//! 5. 写入备份清单
//! 6. 立即重算校验和与清单比对，任一不匹配整个操作判失败
//!
//! 任一表导出失败即中止并上抛底层工具错误；
//! 已产出的部分产物保留在磁盘供取证，不做静默清理。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use crate::checksum::{calculate_file_hash, BackupManifest};
use crate::config::OpsConfig;
use crate::error::Result;
use crate::gateway::DataStoreGateway;

/// 一次成功备份的摘要
#[derive(Debug)]
pub struct BackupSummary {
    /// 快照标识（14 位时间戳）
    pub timestamp: String,
    /// 快照目录
    pub snapshot_dir: PathBuf,
    pub tables: Vec<String>,
    pub checksums: BTreeMap<String, String>,
    pub duration_secs: u64,
}

/// 备份管理器
pub struct BackupManager {
    config: OpsConfig,
    gateway: Arc<dyn DataStoreGateway>,
}

impl BackupManager {
    pub fn new(config: OpsConfig, gateway: Arc<dyn DataStoreGateway>) -> Self {
        Self { config, gateway }
    }

    /// 生成秒级时间戳标识，如 `20260830143015`
    pub fn make_timestamp() -> String {
        Utc::now().format("%Y%m%d%H%M%S").to_string()
    }

    /// 执行完整备份流程
    pub async fn create_backup(&self) -> Result<BackupSummary> {
        let start = Instant::now();
        let timestamp = Self::make_timestamp();
        let snapshot_dir = self.config.backup_dir.join(&timestamp);

        tracing::info!("🚀 [Backup] 开始数据库备份流程");
        tracing::info!("📅 [Backup] 快照标识: {}", timestamp);

        // Step 1: 快照目录
        std::fs::create_dir_all(&snapshot_dir)?;

        // Step 2: schema 固化脚本（只写盘，不执行）
        self.write_schema_script(&timestamp, &snapshot_dir)?;

        // Step 3: 逐表导出 + 校验和
        tracing::info!("📦 [Backup] 开始备份关键表...");
        let mut checksums = BTreeMap::new();
        for table in &self.config.critical_tables {
            let artifact = BackupManifest::table_artifact(&snapshot_dir, table);
            self.gateway.export_table(table, &artifact).await?;
            let checksum = calculate_file_hash(&artifact)?;
            tracing::info!(
                "✅ [Backup] 已备份表 {} (校验和 {}...)",
                table,
                &checksum[..8.min(checksum.len())]
            );
            checksums.insert(table.clone(), checksum);
        }

        // Step 4: 全库导出
        tracing::info!("💾 [Backup] 创建全库备份...");
        let full_backup = snapshot_dir.join("full_backup.sql");
        self.gateway.full_export(&full_backup).await?;
        tracing::info!("✅ [Backup] 全库备份完成: {}", full_backup.display());

        // Step 5: 清单
        let manifest = BackupManifest {
            timestamp: timestamp.clone(),
            date: Utc::now().to_rfc3339(),
            tables: self.config.critical_tables.clone(),
            checksums: checksums.clone(),
            environment: self.config.environment.clone(),
            backup_dir: self.config.backup_dir.display().to_string(),
        };
        manifest.write(&snapshot_dir)?;

        // Step 6: 立即回读验证
        tracing::info!("🔍 [Backup] 验证备份完整性...");
        let reloaded = BackupManifest::load(&snapshot_dir)?;
        reloaded.verify_artifacts(&snapshot_dir)?;

        let duration_secs = start.elapsed().as_secs();
        tracing::info!("✅ [Backup] 数据库备份完成, 耗时 {}s", duration_secs);
        tracing::info!("📁 [Backup] 备份位置: {}", snapshot_dir.display());

        Ok(BackupSummary {
            timestamp,
            snapshot_dir,
            tables: self.config.critical_tables.clone(),
            checksums,
            duration_secs,
        })
    }

    /// 写出把各关键表固化到备份命名空间的 SQL 脚本
    fn write_schema_script(&self, timestamp: &str, snapshot_dir: &std::path::Path) -> Result<()> {
        let schema_name = format!("backup_{}", timestamp);
        let mut sql = format!("CREATE SCHEMA IF NOT EXISTS {};\n", schema_name);
        for table in &self.config.critical_tables {
            sql.push_str(&format!(
                "CREATE TABLE IF NOT EXISTS {}.{} AS SELECT * FROM public.{};\n",
                schema_name, table, table
            ));
        }

        let script_path = snapshot_dir.join("create_schema.sql");
        std::fs::write(&script_path, sql)?;
        tracing::info!("📝 [Backup] schema 固化脚本: {}", script_path.display());
        Ok(())
    }
}
