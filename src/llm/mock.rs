//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按脚本顺序回放预置的 ChatOutcome；脚本耗尽时回显最后一条 User 消息，
//! 便于在本地跑通 路由 → 规划 → 工具循环 全流程。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{ChatOutcome, LlmClient};
use crate::memory::{Message, Role, ToolCallRecord};
use crate::tools::ToolDefinition;

/// Mock 客户端：先回放脚本，再回显用户输入
#[derive(Debug, Default)]
pub struct MockLlmClient {
    scripted: Mutex<VecDeque<Result<ChatOutcome, String>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一条纯文本回复
    pub fn script_text(&self, content: impl Into<String>) {
        self.scripted
            .lock()
            .unwrap()
            .push_back(Ok(ChatOutcome::text(content)));
    }

    /// 追加一条工具调用请求
    pub fn script_tool_call(&self, name: impl Into<String>, arguments: serde_json::Value) {
        let call = ToolCallRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            arguments,
            result: None,
            is_error: false,
        };
        self.scripted.lock().unwrap().push_back(Ok(ChatOutcome {
            content: None,
            tool_calls: vec![call],
        }));
    }

    /// 追加一次后端失败
    pub fn script_error(&self, error: impl Into<String>) {
        self.scripted.lock().unwrap().push_back(Err(error.into()));
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat(
        &self,
        messages: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<ChatOutcome, String> {
        if let Some(next) = self.scripted.lock().unwrap().pop_front() {
            return next;
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .and_then(|m| m.content.as_deref())
            .unwrap_or("(no input)");

        Ok(ChatOutcome::text(format!("Echo from Mock: {last_user}")))
    }
}
