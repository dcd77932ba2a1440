//! 环境变量配置
//!
//! 所有运维工具共享同一套环境变量配置（`.env` 通过 dotenvy 加载）。
//! `DATABASE_URL` 缺失视为致命配置错误，进程拒绝启动。
//!
//! ## 环境变量一览
//!
//! | 变量 | 默认值 | 说明 |
//! |---|---|---|
//! | `DATABASE_URL` | （必填） | 数据存储连接串 |
//! | `ENVIRONMENT` | `development` | 运行环境标识，写入备份清单 |
//! | `BACKUP_DIR` | `./backups` | 快照根目录 |
//! | `MIGRATION_MODE` | `dry-run` | `dry-run` / `execute` |
//! | `ROLLBACK_ENABLED` | `false` | 迁移失败时是否派发自动回滚 |
//! | `ALERT_WEBHOOK_URL` | （无） | 告警转发端点，可选 |
//! | `HEALTH_CHECK_INTERVAL_SECS` | `60` | 健康检查间隔 |
//! | `ALERT_ERROR_RATE` | `0.02` | 错误率告警阈值 |
//! | `MIGRATION_MAX_DURATION_SECS` | `7200` | 迁移时长告警阈值 |
//! | `ROLLBACK_TRIGGER_RATE` | `0.05` | 建议回滚的严重错误率阈值 |
//! | `ROLLBACK_MAX_DURATION_SECS` | `1800` | 回滚硬性时长上限 (RTO) |
//! | `ROLLBACK_SQL_PATH` | `scripts/rollback/rollback-freemium.sql` | 数据回滚脚本 |
//! | `CRITICAL_TABLES` | `users,codes,registrations` | 关键表清单（逗号分隔，顺序即恢复顺序） |
//! | `SERVICES_STOP_COMMAND` | （无） | 回滚时停止应用服务的命令 |
//! | `SERVICES_START_COMMAND` | （无） | 回滚完成后重启服务的命令 |
//! | `DEPENDENCY_RESET_COMMAND` | （无） | 依赖重置命令 |

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{OpsError, Result};

/// 迁移执行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationMode {
    /// 只记录将要执行的语句，不产生任何写入
    DryRun,
    /// 实际执行并逐步验证
    Execute,
}

impl MigrationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationMode::DryRun => "dry-run",
            MigrationMode::Execute => "execute",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "dry-run" => Ok(MigrationMode::DryRun),
            "execute" => Ok(MigrationMode::Execute),
            other => Err(OpsError::Config(format!(
                "MIGRATION_MODE must be 'dry-run' or 'execute', got '{}'",
                other
            ))),
        }
    }
}

/// 告警阈值
#[derive(Debug, Clone)]
pub struct AlertThresholds {
    /// 错误率告警阈值
    pub error_rate: f64,
    /// 迁移时长告警阈值（秒）
    pub migration_duration_secs: u64,
    /// 建议回滚的严重错误率阈值
    pub rollback_trigger_rate: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error_rate: 0.02,
            migration_duration_secs: 7200,
            rollback_trigger_rate: 0.05,
        }
    }
}

/// 运维工具共享配置
#[derive(Debug, Clone)]
pub struct OpsConfig {
    pub database_url: String,
    pub environment: String,
    pub backup_dir: PathBuf,
    pub migration_mode: MigrationMode,
    pub rollback_enabled: bool,
    pub alert_webhook_url: Option<String>,
    pub check_interval: Duration,
    pub alert_thresholds: AlertThresholds,
    /// 回滚硬性时长上限，超出即中止整个回滚序列
    pub rollback_max_duration: Duration,
    pub rollback_sql_path: PathBuf,
    /// 关键表清单。顺序即备份/恢复顺序；外键依赖由运维人员保证
    pub critical_tables: Vec<String>,
    pub services_stop_command: Option<String>,
    pub services_start_command: Option<String>,
    pub dependency_reset_command: Option<String>,
}

impl OpsConfig {
    /// 从进程环境变量读取配置
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 从任意查找函数读取配置（测试可注入）
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                OpsError::Config("DATABASE_URL environment variable is required".to_string())
            })?;

        let migration_mode = match lookup("MIGRATION_MODE") {
            Some(raw) => MigrationMode::parse(raw.trim())?,
            None => MigrationMode::DryRun,
        };

        let critical_tables = lookup("CRITICAL_TABLES")
            .map(|raw| {
                raw.split(',')
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|tables| !tables.is_empty())
            .unwrap_or_else(|| {
                vec![
                    "users".to_string(),
                    "codes".to_string(),
                    "registrations".to_string(),
                ]
            });

        let thresholds = AlertThresholds {
            error_rate: parse_or_default(&lookup, "ALERT_ERROR_RATE", 0.02)?,
            migration_duration_secs: parse_or_default(&lookup, "MIGRATION_MAX_DURATION_SECS", 7200)?,
            rollback_trigger_rate: parse_or_default(&lookup, "ROLLBACK_TRIGGER_RATE", 0.05)?,
        };

        Ok(Self {
            database_url,
            environment: lookup("ENVIRONMENT").unwrap_or_else(|| "development".to_string()),
            backup_dir: lookup("BACKUP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("backups")),
            migration_mode,
            rollback_enabled: lookup("ROLLBACK_ENABLED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            alert_webhook_url: lookup("ALERT_WEBHOOK_URL").filter(|v| !v.trim().is_empty()),
            check_interval: Duration::from_secs(parse_or_default(
                &lookup,
                "HEALTH_CHECK_INTERVAL_SECS",
                60,
            )?),
            alert_thresholds: thresholds,
            rollback_max_duration: Duration::from_secs(parse_or_default(
                &lookup,
                "ROLLBACK_MAX_DURATION_SECS",
                1800,
            )?),
            rollback_sql_path: lookup("ROLLBACK_SQL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("scripts/rollback/rollback-freemium.sql")),
            critical_tables,
            services_stop_command: lookup("SERVICES_STOP_COMMAND"),
            services_start_command: lookup("SERVICES_START_COMMAND"),
            dependency_reset_command: lookup("DEPENDENCY_RESET_COMMAND"),
        })
    }
}

fn parse_or_default<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse::<T>().map_err(|_| {
            OpsError::Config(format!("Invalid value for {}: '{}'", key, raw.trim()))
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(map: &'a HashMap<&'a str, &'a str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn test_missing_database_url_is_fatal() {
        let map = HashMap::new();
        let err = OpsConfig::from_lookup(lookup_from(&map)).unwrap_err();
        assert!(matches!(err, OpsError::Config(_)));
    }

    #[test]
    fn test_defaults() {
        let mut map = HashMap::new();
        map.insert("DATABASE_URL", "postgres://localhost/tbat");
        let config = OpsConfig::from_lookup(lookup_from(&map)).unwrap();

        assert_eq!(config.migration_mode, MigrationMode::DryRun);
        assert!(!config.rollback_enabled);
        assert_eq!(config.check_interval, Duration::from_secs(60));
        assert_eq!(config.rollback_max_duration, Duration::from_secs(1800));
        assert_eq!(config.critical_tables, vec!["users", "codes", "registrations"]);
        assert_eq!(config.alert_thresholds.rollback_trigger_rate, 0.05);
        assert!(config.alert_webhook_url.is_none());
    }

    #[test]
    fn test_execute_mode_and_overrides() {
        let mut map = HashMap::new();
        map.insert("DATABASE_URL", "postgres://localhost/tbat");
        map.insert("MIGRATION_MODE", "execute");
        map.insert("ROLLBACK_ENABLED", "true");
        map.insert("CRITICAL_TABLES", "users, payment_transactions");
        map.insert("ROLLBACK_MAX_DURATION_SECS", "60");
        let config = OpsConfig::from_lookup(lookup_from(&map)).unwrap();

        assert_eq!(config.migration_mode, MigrationMode::Execute);
        assert!(config.rollback_enabled);
        assert_eq!(config.critical_tables, vec!["users", "payment_transactions"]);
        assert_eq!(config.rollback_max_duration, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let mut map = HashMap::new();
        map.insert("DATABASE_URL", "postgres://localhost/tbat");
        map.insert("MIGRATION_MODE", "yolo");
        let err = OpsConfig::from_lookup(lookup_from(&map)).unwrap_err();
        assert!(matches!(err, OpsError::Config(_)));
    }

    #[test]
    fn test_invalid_numeric_rejected() {
        let mut map = HashMap::new();
        map.insert("DATABASE_URL", "postgres://localhost/tbat");
        map.insert("HEALTH_CHECK_INTERVAL_SECS", "soon");
        let err = OpsConfig::from_lookup(lookup_from(&map)).unwrap_err();
        assert!(matches!(err, OpsError::Config(_)));
    }
}
