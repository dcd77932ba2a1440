//! # TBAT Ops (运维工具集)
//!
//! TBAT 考试报名平台的迁移与灾备运维工具：
//!
//! - [`backup`] — 带校验和清单的快照备份
//! - [`restore`] — 完整性校验 + 安全快照的恢复流程
//! - [`migration`] — Freemium 迁移编排（dry-run / execute）
//! - [`rollback`] — 时间盒约束的部署回滚状态机
//! - [`monitor`] — 迁移后健康监控与分级告警
//! - [`gateway`] — 数据存储抽象（Postgres 外部工具 / SQLite 内嵌）
//!
//! 所有工具共享 [`config::OpsConfig`]（环境变量驱动），通过
//! `src/bin/` 下的五个二进制入口独立运行。

pub mod backup;
pub mod checksum;
pub mod config;
pub mod error;
pub mod gateway;
pub mod migration;
pub mod monitor;
pub mod restore;
pub mod rollback;

pub use error::{OpsError, Result};
