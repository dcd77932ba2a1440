//! 健康监控入口
//!
//! ```text
//! cargo run --bin monitor            # 持续监控（Ctrl-C 退出）
//! cargo run --bin monitor check      # 单轮检查，按结果退出
//! cargo run --bin monitor setup      # 生成静态监控面板
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use tbat_ops::config::OpsConfig;
use tbat_ops::gateway::PsqlGateway;
use tbat_ops::monitor::{write_dashboard, HealthMonitor, MonitorState};

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

    let command = std::env::args().nth(1).unwrap_or_default();

    if command == "setup" {
        write_dashboard(Path::new("public/monitoring-dashboard.html"))?;
        return Ok(());
    }

    let config = OpsConfig::from_env().context("配置加载失败")?;
    let gateway = Arc::new(PsqlGateway::new(&config.database_url));
    let monitor = HealthMonitor::new(config, gateway);

    match command.as_str() {
        "check" => {
            let mut state = MonitorState::new();
            let report = monitor.run_health_checks(&mut state).await;
            state.log_summary();
            if !report.healthy {
                std::process::exit(1);
            }
        }
        "" => {
            monitor.start_monitoring().await;
        }
        other => {
            tracing::error!("未知子命令: {} (可用: check / setup)", other);
            std::process::exit(1);
        }
    }
    Ok(())
}
