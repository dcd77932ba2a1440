//! 手动部署回滚入口
//!
//! ```text
//! cargo run --bin rollback-deployment "reason for rollback"
//! ```
//!
//! 整个序列受 `ROLLBACK_MAX_DURATION_SECS` 时间盒约束（默认 1800s）。

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use tbat_ops::config::OpsConfig;
use tbat_ops::gateway::PsqlGateway;
use tbat_ops::rollback::RollbackOrchestrator;

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

    let reason = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "manual rollback".to_string());

    let config = OpsConfig::from_env().context("配置加载失败")?;
    let gateway = Arc::new(PsqlGateway::new(&config.database_url));
    let orchestrator = RollbackOrchestrator::new(&config, gateway);

    let result = orchestrator.run(&reason).await;
    if !result.success {
        tracing::error!(
            "❌ 回滚未完成 (阶段 {:?}): {:?}",
            result.final_phase,
            result.errors
        );
        std::process::exit(1);
    }
    tracing::info!(
        "✅ 回滚完成: {} 步, {:.1}s, 时间盒内: {}",
        result.steps_completed.len(),
        result.duration_seconds,
        result.within_target
    );
    Ok(())
}
