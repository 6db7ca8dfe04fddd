//! Agent 错误类型
//!
//! 只有 LLM 后端不可用、存储失败与会话不存在（或归属不符）会作为错误向调用方传播；
//! 工具失败、门控拦截、规划解析失败等一律软化为数据（工具结果文本 / 步骤状态 / 待审批列表）。

use thiserror::Error;

/// Agent 运行过程中向外传播的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// LLM 后端不可用或调用失败，整轮对话终止
    #[error("LLM backend unavailable: {0}")]
    LlmUnavailable(String),

    /// 会话不存在、已删除或归属不符
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}
