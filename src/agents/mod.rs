//! Base Agent：call → tool → call 循环
//!
//! 每类专用 agent 一个实例：模板化 system prompt + 可调用操作白名单 + 上下文增强。
//! 每次工具执行前询问能力门控，每次 LLM 调用前经 MemoryManager 压缩上下文。
//! 后端不可用是唯一的硬错误；单个工具失败与门控拦截都软化为带标记的工具结果，
//! 待审批则合成非错误结果并记入 pending 列表，循环继续。

mod base;
mod profiles;

pub use base::{AgentRunOutcome, AgentRunRequest, BaseAgent, ITERATION_LIMIT_MESSAGE};
pub(crate) use base::truncate_result;
pub use profiles::{document_profile, drive_profile, search_profile, AgentProfile};

use std::collections::HashMap;
use std::sync::Arc;

use crate::router::AgentKind;

/// 按类型查找 Base Agent 的注册表
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<AgentKind, Arc<BaseAgent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: BaseAgent) {
        self.agents.insert(agent.kind(), Arc::new(agent));
    }

    pub fn get(&self, kind: AgentKind) -> Option<Arc<BaseAgent>> {
        self.agents.get(&kind).cloned()
    }
}
