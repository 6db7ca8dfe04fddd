//! Nimbus - 云盘对话助手智能体核心
//!
//! 模块划分：
//! - **agents**: Base Agent 工具调用循环与专用 agent 画像（drive / document / search）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类
//! - **gateway**: 能力门控（放行 / 拦截 / 审批）与待审批注册表
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 会话数据模型、存储抽象与上下文压缩
//! - **notify**: 尽力而为的用户通知
//! - **orchestrator**: 多步计划的顺序编排
//! - **plan**: 计划/步骤状态机与 LLM 任务分解
//! - **router**: 意图路由（显式 > 模式 > 粘性 > LLM > 默认）
//! - **service**: 对话轮次的组合根
//! - **tools**: 工具调用接口、注册表缓存与身份参数注入

pub mod agents;
pub mod config;
pub mod core;
pub mod gateway;
pub mod llm;
pub mod memory;
pub mod notify;
pub mod observability;
pub mod orchestrator;
pub mod plan;
pub mod router;
pub mod service;
pub mod tools;

pub use service::{AgentService, ChatRequest, ChatResponse};
