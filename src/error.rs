//! 运维工具统一错误类型
//!
//! 错误分类与传播策略：
//! - 配置错误：启动即失败，不重试
//! - 工具调用错误：中止当前步骤及所属操作，磁盘产物保留供排查
//! - 完整性错误：校验失败，阻断后续破坏性操作
//! - 超时错误：回滚时长超限，整个序列中止

/// 运维工具错误
#[derive(Debug, thiserror::Error)]
pub enum OpsError {
    /// 配置错误（如缺少 DATABASE_URL），启动阶段致命
    #[error("Configuration error: {0}")]
    Config(String),

    /// 外部工具调用失败（pg_dump / psql 等）
    #[error("Tool invocation failed ({tool}): {message}")]
    Tool { tool: String, message: String },

    /// 完整性错误：校验和不匹配、孤儿记录、重复标识等
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// 回滚超出时长上限
    #[error("Timeout: {0}")]
    Timeout(String),

    /// 数据存储层错误
    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OpsError {
    /// 构造工具调用错误
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OpsError>;
