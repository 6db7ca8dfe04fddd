//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：chat 带可选工具声明调用对话补全，
//! 返回正文与/或请求的工具调用。超时由调用侧施加，超时视同后端失败。

use async_trait::async_trait;

use crate::memory::{Message, ToolCallRecord};
use crate::tools::ToolDefinition;

/// 单次对话补全的产出：正文与模型请求的工具调用（result 均为 None）
#[derive(Clone, Debug, Default)]
pub struct ChatOutcome {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
}

impl ChatOutcome {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }
}

/// LLM 客户端 trait：失败以 Err(String) 表达，由调用侧决定是硬错误还是降级
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ChatOutcome, String>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
