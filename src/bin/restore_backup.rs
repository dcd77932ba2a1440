//! 快照恢复入口
//!
//! ```text
//! cargo run --bin restore-backup              # 恢复最新快照
//! cargo run --bin restore-backup 20260830143015
//! ```

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use tbat_ops::config::OpsConfig;
use tbat_ops::gateway::PsqlGateway;
use tbat_ops::restore::RestoreManager;

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

    let timestamp = std::env::args().nth(1);

    let config = OpsConfig::from_env().context("配置加载失败")?;
    let gateway = Arc::new(PsqlGateway::new(&config.database_url));
    let manager = RestoreManager::new(config, gateway);

    match manager.restore(timestamp.as_deref()).await {
        Ok(summary) => {
            tracing::info!(
                "✅ 恢复完成: 快照 {} ({} 张表, 安全快照 {}, {:.1}s)",
                summary.timestamp,
                summary.tables_restored.len(),
                summary.safety_namespace,
                summary.duration_secs
            );
            for (table, rows) in &summary.row_counts {
                tracing::info!("   {} = {} 行", table, rows);
            }
            Ok(())
        }
        Err(e) => {
            tracing::error!("❌ 恢复失败: {}", e);
            std::process::exit(1);
        }
    }
}
