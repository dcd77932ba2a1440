//! 快照备份入口
//!
//! ```text
//! DATABASE_URL=postgres://... cargo run --bin create-backup
//! ```

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use tbat_ops::backup::BackupManager;
use tbat_ops::config::OpsConfig;
use tbat_ops::gateway::PsqlGateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = OpsConfig::from_env().context("配置加载失败")?;
    let gateway = Arc::new(PsqlGateway::new(&config.database_url));
    let manager = BackupManager::new(config, gateway);

    match manager.create_backup().await {
        Ok(summary) => {
            tracing::info!(
                "✅ 备份完成: {} ({} 张表, {:.1}s)",
                summary.snapshot_dir.display(),
                summary.tables.len(),
                summary.duration_secs
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!("❌ 备份失败: {}", e);
            std::process::exit(1);
        }
    }
}
