//! 会话数据模型
//!
//! Conversation 以整体为单位读写，每轮恰有一个写者；Message 一旦追加即不可变，
//! ToolCallRecord 只追加不修改。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::TaskPlan;
use crate::router::{AgentKind, RouteDecision};

/// 消息角色（与 LLM API 一致；持久化的消息只有 user / assistant / tool，
/// system 仅出现在组装给 LLM 的消息序列中）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// 一次工具调用的记录：模型请求时 result 为 None，执行后回填结果与错误标记
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// 调用 id（回传 tool 消息时用于对齐）
    pub id: String,
    /// 操作名
    pub name: String,
    /// 参数表
    pub arguments: serde_json::Value,
    /// 结果文本（可能已截断）
    pub result: Option<String>,
    pub is_error: bool,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    /// 纯工具调用的 assistant 消息可以没有正文
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    /// tool 角色消息对应的调用 id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    /// 携带工具调用的 assistant 消息（正文可为空）
    pub fn assistant_with_calls(content: Option<String>, tool_calls: Vec<ToolCallRecord>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
            created_at: Utc::now(),
        }
    }

    /// 单次工具调用的结果消息
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
            created_at: Utc::now(),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            created_at: Utc::now(),
        }
    }

    /// 正文字符数（None 视为 0），用于上下文预算估算
    pub fn content_chars(&self) -> usize {
        self.content.as_deref().map(|c| c.chars().count()).unwrap_or(0)
    }
}

/// 一段连续消息区间的压缩摘要，持久化以免重复计算
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Summary {
    pub content: String,
    /// 覆盖的消息下标区间 [from, to)
    pub covered_from: usize,
    pub covered_to: usize,
    pub created_at: DateTime<Utc>,
}

/// 一个聊天线程的完整会话
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub messages: Vec<Message>,
    /// 粘性 agent 类型：在计划未完成期间保持路由稳定
    pub agent_kind: Option<AgentKind>,
    pub active_plan: Option<TaskPlan>,
    pub summaries: Vec<Summary>,
    pub last_route: Option<RouteDecision>,
    /// 软删除标记
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            messages: Vec::new(),
            agent_kind: None,
            active_plan: None,
            summaries: Vec::new(),
            last_route: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    /// 粘性类型仅在没有进行中的计划时被路由采纳
    pub fn sticky_kind(&self) -> Option<AgentKind> {
        match &self.active_plan {
            Some(plan) if !plan.is_complete => None,
            _ => self.agent_kind,
        }
    }
}
