//! # Health Monitor (健康监控)
//!
//! 迁移后的持续健康监控：按固定间隔对数据存储跑一组健康检查，
//! 失败的检查转成分级告警（关键检查 → CRITICAL，其余 → WARNING）。
//! 关键失败率达到回滚触发阈值时追加一条"建议回滚"的 CRITICAL 告警，
//! 但监控本身绝不自动触发回滚，只给出建议。
//!
//! 告警可选转发到 webhook（尽力而为，失败只记日志），同时全部
//! 累积在进程内的 [`MonitorState`] 里，退出时输出汇总。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::config::OpsConfig;
use crate::error::Result;
use crate::gateway::DataStoreGateway;

/// 阈值比较算子
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Gt,
    Lt,
    Eq,
    Gte,
    Lte,
}

impl CompareOp {
    fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            CompareOp::Gt => value > threshold,
            CompareOp::Lt => value < threshold,
            CompareOp::Eq => (value - threshold).abs() < f64::EPSILON,
            CompareOp::Gte => value >= threshold,
            CompareOp::Lte => value <= threshold,
        }
    }
}

/// 一项健康检查：一条标量 SQL + 可选阈值断言
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub name: String,
    pub query: String,
    /// `None` 表示只要求查询成功（连通性检查）
    pub threshold: Option<f64>,
    pub operator: CompareOp,
    pub critical: bool,
}

impl HealthCheck {
    fn new(
        name: &str,
        query: &str,
        threshold: Option<f64>,
        operator: CompareOp,
        critical: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            query: query.to_string(),
            threshold,
            operator,
            critical,
        }
    }
}

/// 默认检查集（迁移后数据存储的核心不变量）
pub fn default_checks() -> Vec<HealthCheck> {
    vec![
        HealthCheck::new("Database Connection", "SELECT 1", None, CompareOp::Eq, true),
        HealthCheck::new(
            "User Count",
            "SELECT COUNT(*) FROM users",
            Some(0.0),
            CompareOp::Gt,
            true,
        ),
        HealthCheck::new(
            "VVIP Migration Status",
            "SELECT COUNT(*) FROM users WHERE tier = 'VVIP'",
            Some(0.0),
            CompareOp::Gte,
            false,
        ),
        HealthCheck::new(
            "Orphan Registrations",
            "SELECT COUNT(*) FROM registrations_v2 r \
             LEFT JOIN users u ON r.user_id = u.id WHERE u.id IS NULL",
            Some(0.0),
            CompareOp::Eq,
            true,
        ),
        HealthCheck::new(
            "Orphan Payments",
            "SELECT COUNT(*) FROM payments p \
             LEFT JOIN users u ON p.user_id = u.id WHERE u.id IS NULL",
            Some(0.0),
            CompareOp::Eq,
            true,
        ),
        HealthCheck::new(
            "Duplicate Exam Tickets",
            "SELECT COUNT(*) FROM (SELECT exam_ticket FROM registrations_v2 \
             GROUP BY exam_ticket HAVING COUNT(*) > 1) duplicates",
            Some(0.0),
            CompareOp::Eq,
            true,
        ),
        HealthCheck::new(
            "Invalid Tier Values",
            "SELECT COUNT(*) FROM users WHERE tier NOT IN ('VVIP', 'FREE')",
            Some(0.0),
            CompareOp::Eq,
            true,
        ),
    ]
}

/// 告警级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    Info,
    /// 提示性状况（不对应检查失败）
    Warning,
    /// 非关键检查失败
    Error,
    /// 关键检查失败或建议回滚
    Critical,
}

/// 一条告警
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub level: AlertLevel,
    pub check: String,
    pub message: String,
    pub value: Option<f64>,
    pub timestamp: String,
}

impl AlertEvent {
    fn new(level: AlertLevel, check: &str, message: String, value: Option<f64>) -> Self {
        Self {
            level,
            check: check.to_string(),
            message,
            value,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// 单项检查的结果
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub name: String,
    pub passed: bool,
    pub value: Option<f64>,
    pub critical: bool,
    pub error: Option<String>,
}

/// 一轮检查的汇总
#[derive(Debug, Clone)]
pub struct TickReport {
    pub healthy: bool,
    pub checks: Vec<CheckOutcome>,
    /// 关键检查失败数 / 检查总数
    pub error_rate: f64,
    pub rollback_recommended: bool,
}

/// 进程内告警累积（监控循环持有，无全局状态）
#[derive(Debug, Default)]
pub struct MonitorState {
    pub alerts: Vec<AlertEvent>,
    pub ticks: u64,
}

impl MonitorState {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, event: AlertEvent) {
        self.alerts.push(event);
    }

    pub fn count_at(&self, level: AlertLevel) -> usize {
        self.alerts.iter().filter(|a| a.level == level).count()
    }

    /// 退出时的汇总日志
    pub fn log_summary(&self) {
        tracing::info!("📊 [Monitor] 监控汇总: 共 {} 轮检查", self.ticks);
        tracing::info!(
            "📊 [Monitor] 告警: {} CRITICAL / {} ERROR / {} WARNING / {} INFO",
            self.count_at(AlertLevel::Critical),
            self.count_at(AlertLevel::Error),
            self.count_at(AlertLevel::Warning),
            self.count_at(AlertLevel::Info)
        );
    }
}

/// 由一轮检查结果推导汇总（纯函数，便于测试）
pub fn evaluate_tick(checks: Vec<CheckOutcome>, rollback_trigger_rate: f64) -> TickReport {
    let total = checks.len().max(1);
    let critical_failures = checks.iter().filter(|c| !c.passed && c.critical).count();
    let healthy = checks.iter().all(|c| c.passed);
    let error_rate = critical_failures as f64 / total as f64;
    TickReport {
        healthy,
        checks,
        error_rate,
        rollback_recommended: error_rate >= rollback_trigger_rate && critical_failures > 0,
    }
}

/// 健康监控器
pub struct HealthMonitor {
    config: OpsConfig,
    gateway: Arc<dyn DataStoreGateway>,
    checks: Vec<HealthCheck>,
    http: reqwest::Client,
}

impl HealthMonitor {
    pub fn new(config: OpsConfig, gateway: Arc<dyn DataStoreGateway>) -> Self {
        // 挂死的告警端点不能拖垮检查循环
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            config,
            gateway,
            checks: default_checks(),
            http,
        }
    }

    /// 替换检查集（测试用）
    pub fn with_checks(mut self, checks: Vec<HealthCheck>) -> Self {
        self.checks = checks;
        self
    }

    /// 跑一轮全部检查，告警写入 `state` 并尽力转发 webhook
    pub async fn run_health_checks(&self, state: &mut MonitorState) -> TickReport {
        let mut outcomes = Vec::with_capacity(self.checks.len());
        for check in &self.checks {
            outcomes.push(self.run_check(check).await);
        }

        let report = evaluate_tick(outcomes, self.config.alert_thresholds.rollback_trigger_rate);
        state.ticks += 1;

        for outcome in &report.checks {
            if outcome.passed {
                tracing::debug!("✅ [Monitor] {}: OK (值 {:?})", outcome.name, outcome.value);
                continue;
            }
            let level = if outcome.critical {
                AlertLevel::Critical
            } else {
                AlertLevel::Error
            };
            let message = match &outcome.error {
                Some(e) => format!("检查失败: {}", e),
                None => format!("阈值断言不通过 (值 {:?})", outcome.value),
            };
            tracing::error!("🚨 [Monitor] [{:?}] {}: {}", level, outcome.name, message);
            let event = AlertEvent::new(level, &outcome.name, message, outcome.value);
            self.forward(&event);
            state.record(event);
        }

        if report.rollback_recommended {
            let message = format!(
                "严重失败率 {:.1}% 已达回滚触发阈值 {:.1}%，建议回滚",
                report.error_rate * 100.0,
                self.config.alert_thresholds.rollback_trigger_rate * 100.0
            );
            tracing::error!("🚨 [Monitor] ROLLBACK RECOMMENDED: {}", message);
            let event = AlertEvent::new(
                AlertLevel::Critical,
                "Rollback Recommended",
                message,
                Some(report.error_rate),
            );
            self.forward(&event);
            state.record(event);
        }

        report
    }

    async fn run_check(&self, check: &HealthCheck) -> CheckOutcome {
        match self.gateway.run_scalar_query(&check.query).await {
            Ok(raw) => {
                let value = raw.trim().parse::<f64>().ok();
                let passed = match (check.threshold, value) {
                    (None, _) => true,
                    (Some(threshold), Some(v)) => check.operator.holds(v, threshold),
                    (Some(_), None) => false,
                };
                CheckOutcome {
                    name: check.name.clone(),
                    passed,
                    value,
                    critical: check.critical,
                    error: None,
                }
            }
            Err(e) => CheckOutcome {
                name: check.name.clone(),
                passed: false,
                value: None,
                critical: check.critical,
                error: Some(e.to_string()),
            },
        }
    }

    /// 告警转发：独立任务发送，失败只记日志，绝不阻塞检查循环
    fn forward(&self, event: &AlertEvent) {
        let Some(url) = &self.config.alert_webhook_url else {
            return;
        };
        let client = self.http.clone();
        let url = url.clone();
        let event = event.clone();
        tokio::spawn(async move {
            if let Err(e) = send_webhook(&client, &url, &event).await {
                tracing::warn!("⚠️ [Monitor] 告警转发失败: {}", e);
            }
        });
    }

    /// 监控主循环：定时跑检查，Ctrl-C 退出并输出汇总
    pub async fn start_monitoring(&self) -> MonitorState {
        let mut state = MonitorState::new();
        let mut interval = tokio::time::interval(self.config.check_interval);
        tracing::info!(
            "🚀 [Monitor] 启动健康监控 (间隔 {}s, {} 项检查)",
            self.config.check_interval.as_secs(),
            self.checks.len()
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.run_health_checks(&mut state).await;
                    if report.healthy {
                        tracing::info!("✅ [Monitor] 第 {} 轮检查全部通过", state.ticks);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("[Monitor] 收到退出信号");
                    break;
                }
            }
        }

        state.log_summary();
        state
    }
}

async fn send_webhook(client: &reqwest::Client, url: &str, event: &AlertEvent) -> Result<()> {
    let response = client
        .post(url)
        .json(event)
        .send()
        .await
        .map_err(|e| crate::error::OpsError::tool("webhook", e.to_string()))?;
    response
        .error_for_status()
        .map_err(|e| crate::error::OpsError::tool("webhook", e.to_string()))?;
    Ok(())
}

/// 生成静态监控面板（由任意静态服务器托管，自行轮询状态端点）
pub fn write_dashboard(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DASHBOARD_HTML)?;
    tracing::info!("📝 [Monitor] 监控面板: {}", path.display());
    Ok(())
}

const DASHBOARD_HTML: &str = r#"<!DOCTYPE html>
<html lang="zh">
<head>
  <meta charset="UTF-8">
  <title>TBAT Migration Monitoring</title>
  <style>
    body { font-family: sans-serif; margin: 2rem; background: #f5f5f5; }
    .card { background: #fff; border-radius: 8px; padding: 1rem 1.5rem; margin-bottom: 1rem;
            box-shadow: 0 1px 3px rgba(0,0,0,.1); }
    .metric { font-size: 2rem; font-weight: bold; }
    .ok { color: #2e7d32; } .bad { color: #c62828; }
  </style>
</head>
<body>
  <h1>TBAT Freemium Migration</h1>
  <div class="card">迁移状态: <span id="migrationStatus" class="metric">—</span></div>
  <div class="card">用户总数: <span id="totalUsers" class="metric">—</span></div>
  <div class="card">VVIP 用户: <span id="vvipUsers" class="metric">—</span></div>
  <div class="card">FREE 用户: <span id="freeUsers" class="metric">—</span></div>
  <div class="card">错误率: <span id="errorRate" class="metric">—</span></div>
  <div class="card">系统健康: <span id="systemHealth" class="metric">—</span></div>
  <script>
    async function refresh() {
      try {
        const res = await fetch('/api/monitoring/status');
        const data = await res.json();
        document.getElementById('migrationStatus').textContent = data.migrationStatus;
        document.getElementById('totalUsers').textContent = data.totalUsers;
        document.getElementById('vvipUsers').textContent = data.vvipUsers;
        document.getElementById('freeUsers').textContent = data.freeUsers;
        document.getElementById('errorRate').textContent = data.errorRate;
        const health = document.getElementById('systemHealth');
        health.textContent = data.systemHealth;
        health.className = 'metric ' + (data.systemHealth === 'HEALTHY' ? 'ok' : 'bad');
      } catch (e) {
        document.getElementById('systemHealth').textContent = 'UNREACHABLE';
      }
    }
    refresh();
    setInterval(refresh, 30000);
  </script>
</body>
</html>
"#;
