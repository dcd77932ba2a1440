//! 校验和与备份清单
//!
//! - SHA256 计算：备份产物的内容完整性校验
//! - `BackupManifest`：一次快照的权威索引（表清单 + 各表校验和），
//!   写入后不可变，恢复与验证环节只读消费
//!
//! 磁盘布局（与恢复工具约定一致）：
//! ```text
//! backups/<timestamp>/
//!   create_schema.sql   # 快照期 schema 固化脚本（副产物，不自动执行）
//!   <table>.sql         # 每个关键表的数据导出
//!   full_backup.sql     # 全库导出
//!   manifest.json       # 本清单
//! ```

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{OpsError, Result};

/// manifest.json 文件名
pub const MANIFEST_FILE: &str = "manifest.json";

/// 计算文件的 SHA256 哈希（十六进制）
///
/// 8KB 缓冲区分块读取，大文件也不会占用过多内存。
pub fn calculate_file_hash(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| {
        OpsError::Integrity(format!("打开文件计算哈希失败 {}: {}", path.display(), e))
    })?;

    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer).map_err(|e| {
            OpsError::Integrity(format!("读取文件失败 {}: {}", path.display(), e))
        })?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// 计算字节数组的 SHA256 哈希（十六进制）
pub fn calculate_bytes_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// 备份清单
///
/// 不变式：`tables` 中的每张表都有对应的导出产物与 `checksums` 条目。
/// 清单一经写入即不可变。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    /// 秒级精度的 14 位时间戳标识（可按字典序排序）
    pub timestamp: String,
    /// 创建时刻（RFC 3339）
    pub date: String,
    /// 表清单，顺序即恢复顺序
    pub tables: Vec<String>,
    /// 表名 -> SHA256
    pub checksums: BTreeMap<String, String>,
    pub environment: String,
    #[serde(rename = "backupDir")]
    pub backup_dir: String,
}

impl BackupManifest {
    /// 清单文件路径
    pub fn path_in(snapshot_dir: &Path) -> PathBuf {
        snapshot_dir.join(MANIFEST_FILE)
    }

    /// 表导出产物路径
    pub fn table_artifact(snapshot_dir: &Path, table: &str) -> PathBuf {
        snapshot_dir.join(format!("{}.sql", table))
    }

    /// 写入 manifest.json（创建后只读）
    pub fn write(&self, snapshot_dir: &Path) -> Result<()> {
        let path = Self::path_in(snapshot_dir);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;
        tracing::info!("📋 [Manifest] 备份清单已写入: {}", path.display());
        Ok(())
    }

    /// 从快照目录加载清单
    pub fn load(snapshot_dir: &Path) -> Result<Self> {
        let path = Self::path_in(snapshot_dir);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            OpsError::Integrity(format!("读取备份清单失败 {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// 逐表重新计算产物校验和并与清单比对
    ///
    /// 任一不匹配即为完整性错误，阻断后续破坏性操作。
    pub fn verify_artifacts(&self, snapshot_dir: &Path) -> Result<()> {
        for table in &self.tables {
            let artifact = Self::table_artifact(snapshot_dir, table);
            let current = calculate_file_hash(&artifact)?;
            let recorded = self.checksums.get(table).ok_or_else(|| {
                OpsError::Integrity(format!("清单缺少表 '{}' 的校验和条目", table))
            })?;

            if &current != recorded {
                return Err(OpsError::Integrity(format!(
                    "Checksum mismatch for table '{}': recorded {}, recomputed {}",
                    table, recorded, current
                )));
            }
            tracing::info!("✅ [Manifest] 已验证 {} (校验和匹配)", table);
        }
        Ok(())
    }
}
