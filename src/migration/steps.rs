//! 迁移步骤定义
//!
//! 四个有序步骤（后面的步骤依赖前面的结果，严格串行）：
//!
//! 1. `UpgradeTiersStep` — 存量用户层级升级为 VVIP
//! 2. `GenerateTicketsStep` — 为存量报名生成准考证（幂等 upsert）
//! 3. `PreservePermissionsStep` — 保全既有访问权限
//! 4. `ValidateIntegrityStep` — 数据完整性终检
//!
//! dry-run 模式下各步骤只记录将要执行的语句，不产生写入；
//! `verify()` 仍会对既有状态运行（兜底检查，不是完整模拟）。

use async_trait::async_trait;

use super::{MigrationStep, StepOutcome};
use crate::config::MigrationMode;
use crate::error::{OpsError, Result};
use crate::gateway::DataStoreGateway;
use crate::migration::ticket::TicketGenerator;

/// 派生表 DDL（Postgres / SQLite 通用）
const REGISTRATIONS_V2_DDL: &str = "CREATE TABLE IF NOT EXISTS registrations_v2 (
    user_id TEXT PRIMARY KEY,
    exam_ticket TEXT NOT NULL UNIQUE,
    tier TEXT NOT NULL,
    subjects TEXT NOT NULL,
    status TEXT NOT NULL
);";

/// 存储层唯一约束冲突（按"已迁移，跳过"处理，不致命）
fn is_unique_violation(err: &OpsError) -> bool {
    let message = err.to_string();
    message.contains("UNIQUE") || message.contains("duplicate key")
}

fn sql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

async fn count_scalar(gateway: &dyn DataStoreGateway, sql: &str) -> Result<u64> {
    let raw = gateway.run_scalar_query(sql).await?;
    raw.trim().parse().map_err(|_| {
        OpsError::Integrity(format!(
            "Count query returned non-numeric value '{}' for: {}",
            raw.trim(),
            sql
        ))
    })
}

fn log_dry_run(description: &str, sql: &str) {
    tracing::info!("🔍 [DRY-RUN] 将执行: {}", description);
    let preview: String = sql.chars().take(100).collect();
    tracing::info!("   SQL 预览: {}...", preview.replace('\n', " "));
}

/// 默认步骤序列（声明顺序即执行顺序）
pub fn default_steps() -> Vec<Box<dyn MigrationStep>> {
    vec![
        Box::new(UpgradeTiersStep),
        Box::new(GenerateTicketsStep),
        Box::new(PreservePermissionsStep),
        Box::new(ValidateIntegrityStep),
    ]
}

// ============================================================================
// Step 1: 层级升级
// ============================================================================

/// 把层级为空的存量用户升级为 VVIP
pub struct UpgradeTiersStep;

const UPGRADE_SQL: &str = "UPDATE users SET tier = 'VVIP' WHERE tier IS NULL OR tier = '';";

#[async_trait]
impl MigrationStep for UpgradeTiersStep {
    fn name(&self) -> &str {
        "Migrate Existing Users"
    }

    fn description(&self) -> &str {
        "存量 BoxSet 用户升级为 VVIP 层级"
    }

    async fn execute(
        &self,
        gateway: &dyn DataStoreGateway,
        mode: MigrationMode,
    ) -> Result<StepOutcome> {
        tracing::info!("📦 [Migration] 升级存量用户到 VVIP 层级...");
        if mode == MigrationMode::DryRun {
            log_dry_run(self.description(), UPGRADE_SQL);
            return Ok(StepOutcome::default());
        }

        gateway.run_sql(UPGRADE_SQL).await?;
        let upgraded =
            count_scalar(gateway, "SELECT COUNT(*) FROM users WHERE tier = 'VVIP'").await?;
        tracing::info!("📊 [Migration] 已升级 {} 个用户到 VVIP", upgraded);
        Ok(StepOutcome {
            records_upgraded: upgraded,
            ..Default::default()
        })
    }

    async fn verify(&self, gateway: &dyn DataStoreGateway, mode: MigrationMode) -> Result<bool> {
        if mode == MigrationMode::DryRun {
            return Ok(true);
        }
        let remaining = count_scalar(
            gateway,
            "SELECT COUNT(*) FROM users WHERE tier IS NULL OR tier = ''",
        )
        .await?;
        Ok(remaining == 0)
    }
}

// ============================================================================
// Step 2: 准考证生成
// ============================================================================

/// 为存量报名生成准考证并写入派生表
///
/// 幂等语义：`ON CONFLICT (user_id) DO NOTHING`，已迁移的报名静默跳过；
/// 唯一约束冲突不视为致命错误。
pub struct GenerateTicketsStep;

#[async_trait]
impl MigrationStep for GenerateTicketsStep {
    fn name(&self) -> &str {
        "Generate Exam Tickets"
    }

    fn description(&self) -> &str {
        "为全部存量报名生成准考证"
    }

    async fn execute(
        &self,
        gateway: &dyn DataStoreGateway,
        mode: MigrationMode,
    ) -> Result<StepOutcome> {
        tracing::info!("🎫 [Migration] 为存量报名生成准考证...");
        if mode == MigrationMode::DryRun {
            log_dry_run(self.description(), REGISTRATIONS_V2_DDL);
            tracing::info!("🔍 [DRY-RUN] 将为全部报名生成准考证");
            return Ok(StepOutcome::default());
        }

        gateway.run_sql(REGISTRATIONS_V2_DDL).await?;

        // 派生表按 user_id 主键约束为每用户一张准考证：
        // 按未迁移用户去重取数，重跑时自然得到空集，计数即真实插入数
        let rows = gateway
            .run_rows_query(
                "SELECT DISTINCT r.user_id, u.tier \
                 FROM registrations r \
                 JOIN users u ON r.user_id = u.id \
                 LEFT JOIN registrations_v2 v ON v.user_id = r.user_id \
                 WHERE v.user_id IS NULL",
            )
            .await?;

        let mut generator = TicketGenerator::new();
        let mut generated = 0u64;
        for row in &rows {
            if row.len() < 2 {
                tracing::warn!("[Migration] 报名记录列数异常，跳过: {:?}", row);
                continue;
            }
            let user_id = &row[0];
            let tier = if row[1].is_empty() { "VVIP" } else { row[1].as_str() };
            let ticket = generator.generate(tier)?;

            let insert = format!(
                "INSERT INTO registrations_v2 (user_id, exam_ticket, tier, subjects, status) \
                 VALUES ({}, {}, {}, '[\"Physics\", \"Chemistry\", \"Biology\"]', 'MIGRATED') \
                 ON CONFLICT (user_id) DO NOTHING;",
                sql_quote(user_id),
                sql_quote(&ticket),
                sql_quote(tier)
            );
            match gateway.run_sql(&insert).await {
                Ok(()) => generated += 1,
                Err(err) if is_unique_violation(&err) => {
                    tracing::info!("[Migration] 用户 {} 已迁移，跳过", user_id);
                }
                Err(err) => return Err(err),
            }
        }

        tracing::info!("📊 [Migration] 已生成 {} 张准考证", generated);
        Ok(StepOutcome {
            derived_records_generated: generated,
            ..Default::default()
        })
    }

    async fn verify(&self, gateway: &dyn DataStoreGateway, mode: MigrationMode) -> Result<bool> {
        if mode == MigrationMode::DryRun {
            return Ok(true);
        }
        // 准考证不允许重复
        let duplicates = count_scalar(
            gateway,
            "SELECT COUNT(*) FROM (SELECT exam_ticket FROM registrations_v2 \
             GROUP BY exam_ticket HAVING COUNT(*) > 1) duplicates",
        )
        .await?;
        Ok(duplicates == 0)
    }

    // 派生表整体可丢弃，本步可逆
    async fn rollback(&self, gateway: &dyn DataStoreGateway) -> Result<()> {
        gateway
            .run_sql("DROP TABLE IF EXISTS registrations_v2;")
            .await
    }
}

// ============================================================================
// Step 3: 权限保全
// ============================================================================

/// 既有兑换码未标注类型的，补为 VVIP，保证老用户访问权限不丢
pub struct PreservePermissionsStep;

const PRESERVE_SQL: &str = "UPDATE codes SET type = 'VVIP' WHERE type IS NULL;";

#[async_trait]
impl MigrationStep for PreservePermissionsStep {
    fn name(&self) -> &str {
        "Preserve Permissions"
    }

    fn description(&self) -> &str {
        "保全既有访问权限"
    }

    async fn execute(
        &self,
        gateway: &dyn DataStoreGateway,
        mode: MigrationMode,
    ) -> Result<StepOutcome> {
        tracing::info!("🔒 [Migration] 保全既有访问权限...");
        if mode == MigrationMode::DryRun {
            log_dry_run(self.description(), PRESERVE_SQL);
            return Ok(StepOutcome::default());
        }
        gateway.run_sql(PRESERVE_SQL).await?;
        Ok(StepOutcome::default())
    }

    async fn verify(&self, gateway: &dyn DataStoreGateway, mode: MigrationMode) -> Result<bool> {
        if mode == MigrationMode::DryRun {
            return Ok(true);
        }
        let untyped =
            count_scalar(gateway, "SELECT COUNT(*) FROM codes WHERE type IS NULL").await?;
        Ok(untyped == 0)
    }
}

// ============================================================================
// Step 4: 完整性终检
// ============================================================================

/// 迁移后的数据完整性验证：总量可查、无孤儿报名、无重复准考证
pub struct ValidateIntegrityStep;

#[async_trait]
impl MigrationStep for ValidateIntegrityStep {
    fn name(&self) -> &str {
        "Validate Data"
    }

    fn description(&self) -> &str {
        "迁移后数据完整性验证"
    }

    async fn execute(
        &self,
        gateway: &dyn DataStoreGateway,
        mode: MigrationMode,
    ) -> Result<StepOutcome> {
        tracing::info!("🔍 [Migration] 验证数据完整性...");
        if mode == MigrationMode::DryRun {
            tracing::info!("🔍 [DRY-RUN] 将验证数据完整性");
            return Ok(StepOutcome::default());
        }

        let users = count_scalar(gateway, "SELECT COUNT(*) FROM users").await?;
        let vvip =
            count_scalar(gateway, "SELECT COUNT(*) FROM users WHERE tier = 'VVIP'").await?;
        let tickets = count_scalar(gateway, "SELECT COUNT(*) FROM registrations_v2").await?;
        tracing::info!("✅ [Migration] 用户总数: {}", users);
        tracing::info!("✅ [Migration] VVIP 用户: {}", vvip);
        tracing::info!("✅ [Migration] 准考证数: {}", tickets);
        Ok(StepOutcome::default())
    }

    async fn verify(&self, gateway: &dyn DataStoreGateway, mode: MigrationMode) -> Result<bool> {
        if mode == MigrationMode::DryRun {
            return Ok(true);
        }

        // 孤儿报名：派生表引用了不存在的用户
        let orphans = count_scalar(
            gateway,
            "SELECT COUNT(*) FROM registrations_v2 r \
             LEFT JOIN users u ON r.user_id = u.id WHERE u.id IS NULL",
        )
        .await?;
        if orphans > 0 {
            tracing::error!("❌ [Migration] 发现 {} 条孤儿报名记录", orphans);
            return Ok(false);
        }

        let duplicates = count_scalar(
            gateway,
            "SELECT COUNT(*) FROM (SELECT exam_ticket FROM registrations_v2 \
             GROUP BY exam_ticket HAVING COUNT(*) > 1) duplicates",
        )
        .await?;
        if duplicates > 0 {
            tracing::error!("❌ [Migration] 发现 {} 个重复准考证", duplicates);
            return Ok(false);
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::SqliteGateway;

    async fn seeded_gateway() -> SqliteGateway {
        let gateway = SqliteGateway::open_in_memory().unwrap();
        gateway
            .run_sql(
                "CREATE TABLE users (id TEXT PRIMARY KEY, tier TEXT);
                 CREATE TABLE codes (id TEXT PRIMARY KEY, type TEXT);
                 CREATE TABLE registrations (id TEXT PRIMARY KEY, user_id TEXT);
                 INSERT INTO users VALUES ('u1', NULL);
                 INSERT INTO users VALUES ('u2', '');
                 INSERT INTO users VALUES ('u3', 'FREE');
                 INSERT INTO codes VALUES ('c1', NULL);
                 INSERT INTO registrations VALUES ('r1', 'u1');
                 INSERT INTO registrations VALUES ('r2', 'u3');",
            )
            .await
            .unwrap();
        gateway
    }

    #[tokio::test]
    async fn test_upgrade_step_is_idempotent() {
        let gateway = seeded_gateway().await;
        let step = UpgradeTiersStep;

        let first = step
            .execute(&gateway, MigrationMode::Execute)
            .await
            .unwrap();
        assert_eq!(first.records_upgraded, 2);
        assert!(step
            .verify(&gateway, MigrationMode::Execute)
            .await
            .unwrap());

        // 再跑一遍：不产生双重升级，结果集不变
        let second = step
            .execute(&gateway, MigrationMode::Execute)
            .await
            .unwrap();
        assert_eq!(second.records_upgraded, 2);
        let free = gateway
            .run_scalar_query("SELECT COUNT(*) FROM users WHERE tier = 'FREE'")
            .await
            .unwrap();
        assert_eq!(free, "1");
    }

    #[tokio::test]
    async fn test_ticket_step_upsert_semantics() {
        let gateway = seeded_gateway().await;
        let step = GenerateTicketsStep;

        let first = step
            .execute(&gateway, MigrationMode::Execute)
            .await
            .unwrap();
        assert_eq!(first.derived_records_generated, 2);
        assert!(step
            .verify(&gateway, MigrationMode::Execute)
            .await
            .unwrap());

        // 第二次执行：冲突被 DO NOTHING 吞掉，不产生重复派生记录
        step.execute(&gateway, MigrationMode::Execute)
            .await
            .unwrap();
        let total = gateway
            .run_scalar_query("SELECT COUNT(*) FROM registrations_v2")
            .await
            .unwrap();
        assert_eq!(total, "2");
    }

    #[tokio::test]
    async fn test_dry_run_steps_write_nothing() {
        let gateway = seeded_gateway().await;
        for step in default_steps() {
            let outcome = step
                .execute(&gateway, MigrationMode::DryRun)
                .await
                .unwrap();
            assert_eq!(outcome.records_upgraded, 0);
            assert_eq!(outcome.derived_records_generated, 0);
            assert!(step.verify(&gateway, MigrationMode::DryRun).await.unwrap());
        }

        // 行数与派生表状态均未改变
        let null_tier = gateway
            .run_scalar_query("SELECT COUNT(*) FROM users WHERE tier IS NULL OR tier = ''")
            .await
            .unwrap();
        assert_eq!(null_tier, "2");
        assert!(!gateway.table_exists("registrations_v2").await.unwrap());
    }

    #[tokio::test]
    async fn test_integrity_step_flags_orphans() {
        let gateway = seeded_gateway().await;
        GenerateTicketsStep
            .execute(&gateway, MigrationMode::Execute)
            .await
            .unwrap();
        // 人为制造孤儿
        gateway
            .run_sql(
                "INSERT INTO registrations_v2 VALUES \
                 ('ghost', 'TBAT-V-AAAA-00000000', 'VVIP', '[]', 'MIGRATED');",
            )
            .await
            .unwrap();

        let ok = ValidateIntegrityStep
            .verify(&gateway, MigrationMode::Execute)
            .await
            .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_one_ticket_per_user_across_registrations() {
        let gateway = seeded_gateway().await;
        // u1 名下追加第二条报名：派生表按用户去重，仍只有一张准考证
        gateway
            .run_sql("INSERT INTO registrations VALUES ('r3', 'u1');")
            .await
            .unwrap();

        let outcome = GenerateTicketsStep
            .execute(&gateway, MigrationMode::Execute)
            .await
            .unwrap();
        assert_eq!(outcome.derived_records_generated, 2);

        let per_user = gateway
            .run_scalar_query("SELECT COUNT(*) FROM registrations_v2 WHERE user_id = 'u1'")
            .await
            .unwrap();
        assert_eq!(per_user, "1");
        let total = gateway
            .run_scalar_query("SELECT COUNT(*) FROM registrations_v2")
            .await
            .unwrap();
        assert_eq!(total, "2");
    }

    #[tokio::test]
    async fn test_ticket_step_rollback_drops_derived_table() {
        let gateway = seeded_gateway().await;
        let step = GenerateTicketsStep;
        step.execute(&gateway, MigrationMode::Execute)
            .await
            .unwrap();
        assert!(gateway.table_exists("registrations_v2").await.unwrap());

        step.rollback(&gateway).await.unwrap();
        assert!(!gateway.table_exists("registrations_v2").await.unwrap());
        // 源表不受影响
        let regs = gateway
            .run_scalar_query("SELECT COUNT(*) FROM registrations")
            .await
            .unwrap();
        assert_eq!(regs, "2");
    }

    #[test]
    fn test_unique_violation_detection() {
        let err = OpsError::Database("UNIQUE constraint failed: registrations_v2.exam_ticket".into());
        assert!(is_unique_violation(&err));
        let err = OpsError::Database("syntax error near SELECT".into());
        assert!(!is_unique_violation(&err));
    }
}
