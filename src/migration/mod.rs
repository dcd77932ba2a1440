//! # Migration Orchestrator (迁移编排器)
//!
//! Freemium 迁移的编排入口。把迁移拆成有序步骤（层级升级 → 准考证生成 →
//! 权限保全 → 完整性终检），严格串行执行，任一步失败即停止后续步骤。
//!
//! 两种模式：
//! - **dry-run**：只记录将要执行的操作，不写库，是默认模式
//! - **execute**：真实写入，步骤执行后立即 `verify()` 复核
//!
//! execute 模式下失败且启用了自动回滚时，编排器向回滚监督任务发送一条
//! 回滚请求（fire-and-forget，至多一次），自身不等待回滚完成。
//! 无论成败，每次运行都落盘一份 JSON 迁移报告。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{MigrationMode, OpsConfig};
use crate::error::Result;
use crate::gateway::DataStoreGateway;
use crate::rollback::RollbackRequest;

pub mod steps;
pub mod ticket;

pub use steps::default_steps;
pub use ticket::TicketGenerator;

/// 单步执行的量化结果（计入整体统计）
#[derive(Debug, Clone, Copy, Default)]
pub struct StepOutcome {
    /// 本步升级的存量记录数
    pub records_upgraded: u64,
    /// 本步生成的派生记录数（准考证）
    pub derived_records_generated: u64,
}

/// 一个迁移步骤：执行 + 独立复核
#[async_trait]
pub trait MigrationStep: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    /// 执行步骤。dry-run 模式下只记录、不写入。
    async fn execute(
        &self,
        gateway: &dyn DataStoreGateway,
        mode: MigrationMode,
    ) -> Result<StepOutcome>;

    /// 复核步骤结果。返回 `Ok(false)` 表示复核不通过（视为该步失败）。
    async fn verify(&self, gateway: &dyn DataStoreGateway, mode: MigrationMode) -> Result<bool>;

    /// 撤销本步骤的写入（尽力而为）。默认无操作：不是每一步都可逆，
    /// 不可逆的写入交给整体部署回滚处理。
    async fn rollback(&self, _gateway: &dyn DataStoreGateway) -> Result<()> {
        Ok(())
    }
}

/// 整体迁移统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationStatistics {
    #[serde(rename = "usersUpgraded")]
    pub users_upgraded: u64,
    #[serde(rename = "ticketsGenerated")]
    pub tickets_generated: u64,
}

/// 一次迁移运行的最终结果
#[derive(Debug, Clone)]
pub struct MigrationResult {
    pub success: bool,
    pub mode: MigrationMode,
    pub steps_completed: Vec<String>,
    pub errors: Vec<String>,
    pub statistics: MigrationStatistics,
    pub duration_secs: f64,
}

#[derive(Serialize)]
struct MigrationReport<'a> {
    timestamp: String,
    mode: &'a str,
    #[serde(rename = "durationSeconds")]
    duration_seconds: f64,
    statistics: &'a MigrationStatistics,
    #[serde(rename = "stepsCompleted")]
    steps_completed: &'a [String],
    errors: &'a [String],
}

/// 迁移编排器
pub struct MigrationOrchestrator {
    config: OpsConfig,
    gateway: Arc<dyn DataStoreGateway>,
    steps: Vec<Box<dyn MigrationStep>>,
    rollback_tx: Option<mpsc::Sender<RollbackRequest>>,
    report_dir: PathBuf,
}

impl MigrationOrchestrator {
    pub fn new(config: OpsConfig, gateway: Arc<dyn DataStoreGateway>) -> Self {
        Self {
            config,
            gateway,
            steps: default_steps(),
            rollback_tx: None,
            report_dir: PathBuf::from("."),
        }
    }

    /// 替换步骤序列（测试用）
    pub fn with_steps(mut self, steps: Vec<Box<dyn MigrationStep>>) -> Self {
        self.steps = steps;
        self
    }

    /// 接入回滚监督任务的发送端
    pub fn with_rollback_channel(mut self, tx: mpsc::Sender<RollbackRequest>) -> Self {
        self.rollback_tx = Some(tx);
        self
    }

    /// 迁移报告输出目录（默认当前目录）
    pub fn with_report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.report_dir = dir.into();
        self
    }

    /// 执行整个迁移流程。本方法不返回 `Err`：所有失败都收敛进
    /// `MigrationResult`，由调用方决定进程退出码。
    pub async fn execute(&self) -> MigrationResult {
        let mode = self.config.migration_mode;
        let started = Instant::now();
        tracing::info!("🚀 [Migration] 开始 Freemium 迁移 (模式: {})", mode.as_str());

        let mut result = MigrationResult {
            success: true,
            mode,
            steps_completed: Vec::new(),
            errors: Vec::new(),
            statistics: MigrationStatistics::default(),
            duration_secs: 0.0,
        };

        for step in &self.steps {
            tracing::info!("📋 [Migration] 步骤: {} — {}", step.name(), step.description());
            match self.run_step(step.as_ref(), mode).await {
                Ok(outcome) => {
                    result.statistics.users_upgraded += outcome.records_upgraded;
                    result.statistics.tickets_generated += outcome.derived_records_generated;
                    result.steps_completed.push(step.name().to_string());
                    tracing::info!("✅ [Migration] 步骤完成: {}", step.name());
                }
                Err(message) => {
                    tracing::error!("❌ [Migration] 步骤失败: {} — {}", step.name(), message);
                    result.errors.push(format!("{}: {}", step.name(), message));
                    result.success = false;
                    if mode == MigrationMode::Execute {
                        match step.rollback(self.gateway.as_ref()).await {
                            Ok(()) => {
                                tracing::info!("↩️ [Migration] 已撤销步骤写入: {}", step.name())
                            }
                            Err(e) => tracing::warn!(
                                "⚠️ [Migration] 步骤撤销失败 {}: {}",
                                step.name(),
                                e
                            ),
                        }
                    }
                    break;
                }
            }
        }

        result.duration_secs = started.elapsed().as_secs_f64();

        if result.success {
            tracing::info!(
                "✅ [Migration] 迁移完成，耗时 {:.2}s (升级 {} 用户 / 生成 {} 张准考证)",
                result.duration_secs,
                result.statistics.users_upgraded,
                result.statistics.tickets_generated
            );
        } else if mode == MigrationMode::Execute {
            self.dispatch_rollback(&result).await;
        }

        if let Err(e) = self.write_report(&result) {
            tracing::warn!("⚠️ [Migration] 迁移报告写入失败: {}", e);
        }

        result
    }

    async fn run_step(
        &self,
        step: &dyn MigrationStep,
        mode: MigrationMode,
    ) -> std::result::Result<StepOutcome, String> {
        let outcome = step
            .execute(self.gateway.as_ref(), mode)
            .await
            .map_err(|e| e.to_string())?;
        let verified = step
            .verify(self.gateway.as_ref(), mode)
            .await
            .map_err(|e| format!("verification error: {}", e))?;
        if !verified {
            return Err("verification failed".to_string());
        }
        Ok(outcome)
    }

    /// 失败后触发自动回滚（至多一次，不阻塞当前流程）
    async fn dispatch_rollback(&self, result: &MigrationResult) {
        if !self.config.rollback_enabled {
            tracing::warn!("⚠️ [Migration] 迁移失败，自动回滚未启用，需要人工介入");
            return;
        }
        let Some(tx) = &self.rollback_tx else {
            tracing::warn!("⚠️ [Migration] 迁移失败，但未接入回滚通道");
            return;
        };
        let request = RollbackRequest::new(format!(
            "migration failed: {}",
            result.errors.join("; ")
        ));
        match tx.try_send(request) {
            Ok(()) => tracing::warn!("🔄 [Migration] 已发出自动回滚请求"),
            Err(e) => tracing::error!("❌ [Migration] 回滚请求发送失败: {}", e),
        }
    }

    fn write_report(&self, result: &MigrationResult) -> Result<()> {
        let report = MigrationReport {
            timestamp: chrono::Utc::now().to_rfc3339(),
            mode: result.mode.as_str(),
            duration_seconds: result.duration_secs,
            statistics: &result.statistics,
            steps_completed: &result.steps_completed,
            errors: &result.errors,
        };
        let path = self.report_path();
        std::fs::create_dir_all(&self.report_dir)?;
        std::fs::write(&path, serde_json::to_vec_pretty(&report)?)?;
        tracing::info!("📝 [Migration] 迁移报告: {}", path.display());
        Ok(())
    }

    fn report_path(&self) -> PathBuf {
        let name = format!(
            "migration-report-{}.json",
            chrono::Utc::now().timestamp_millis()
        );
        self.report_dir.join(name)
    }
}

/// 列出目录下的迁移报告文件（按文件名升序，即按时间升序）
pub fn list_reports(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut reports = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("migration-report-") && name.ends_with(".json") {
            reports.push(entry.path());
        }
    }
    reports.sort();
    Ok(reports)
}
