//! # DataStoreGateway (数据存储网关)
//!
//! 唯一的外部存储边界。备份/恢复/迁移/回滚/监控全部通过这个窄接口
//! 访问数据存储，其余代码与存储引擎无关。
//!
//! ## 实现
//!
//! - [`psql::PsqlGateway`]：生产实现，外呼 `pg_dump` / `psql` 原生工具
//! - [`sqlite::SqliteGateway`]：内嵌实现，供验证基座与测试使用
//!
//! 每次外部命令调用都是一个异步挂起点；调用方逐一等待完成，
//! 同一存储上不存在并发破坏性操作。

pub mod psql;
pub mod sqlite;

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

pub use psql::PsqlGateway;
pub use sqlite::SqliteGateway;

/// 数据存储网关
#[async_trait]
pub trait DataStoreGateway: Send + Sync {
    /// 导出单表数据（仅数据，INSERT 形式）到指定文件
    async fn export_table(&self, table: &str, output: &Path) -> Result<()>;

    /// 回放表数据导出文件
    async fn import_table(&self, table: &str, dump: &Path) -> Result<()>;

    /// 清空表（级联到依赖表）
    async fn truncate_table(&self, table: &str) -> Result<()>;

    /// 执行查询并返回首行首列的文本形式；无行时返回空串
    async fn run_scalar_query(&self, sql: &str) -> Result<String>;

    /// 执行多行查询，每行为列文本向量
    async fn run_rows_query(&self, sql: &str) -> Result<Vec<Vec<String>>>;

    /// 执行任意 SQL 语句（DDL / DML）
    async fn run_sql(&self, sql: &str) -> Result<()>;

    /// 全库导出
    async fn full_export(&self, output: &Path) -> Result<()>;

    /// 回放全库导出或任意 SQL 脚本文件
    async fn full_import(&self, dump: &Path) -> Result<()>;

    /// 将一组表固化到指定命名空间（安全快照）
    ///
    /// Postgres 下为 `CREATE SCHEMA` + `CREATE TABLE AS`；
    /// SQLite 下为 `<namespace>_<table>` 前缀表。
    async fn snapshot_tables(&self, namespace: &str, tables: &[String]) -> Result<()>;

    /// 表是否存在（回滚验证用）
    async fn table_exists(&self, table: &str) -> Result<bool>;
}
