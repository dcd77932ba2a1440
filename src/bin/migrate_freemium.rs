//! Freemium 迁移入口
//!
//! 默认 dry-run；`MIGRATION_MODE=execute` 真实执行。
//! execute 模式下若 `ROLLBACK_ENABLED=true`，迁移失败会通过监督任务
//! 自动触发一次部署回滚，主流程等待回滚结束后按结果退出。

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use tbat_ops::config::OpsConfig;
use tbat_ops::gateway::PsqlGateway;
use tbat_ops::migration::MigrationOrchestrator;
use tbat_ops::rollback::spawn_supervisor;

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

    let (rollback_tx, rollback_handle) = spawn_supervisor(&config, gateway.clone());
    let orchestrator = MigrationOrchestrator::new(config, gateway)
        .with_rollback_channel(rollback_tx);

    let result = orchestrator.execute().await;

    // 通道在编排器 drop 时关闭；若无回滚请求，监督任务立即结束
    drop(orchestrator);
    match rollback_handle.await {
        Ok(Some(rollback)) => {
            tracing::warn!(
                "🔄 回滚结果: success={} within_target={}",
                rollback.success,
                rollback.within_target
            );
        }
        Ok(None) => {}
        Err(e) => tracing::error!("❌ 回滚监督任务异常: {}", e),
    }

    if !result.success {
        tracing::error!("❌ 迁移失败: {:?}", result.errors);
        std::process::exit(1);
    }
    tracing::info!(
        "✅ 迁移成功 ({}): 升级 {} 用户 / 生成 {} 张准考证",
        result.mode.as_str(),
        result.statistics.users_upgraded,
        result.statistics.tickets_generated
    );
    Ok(())
}
