//! 工具调用主循环

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::agents::AgentProfile;
use crate::config::AgentSection;
use crate::core::AgentError;
use crate::gateway::{ApprovalRequest, CapabilityGateway, PermissionDecision};
use crate::llm::LlmClient;
use crate::memory::{MemoryManager, Message, Summary, ToolCallRecord};
use crate::plan::TaskPlan;
use crate::router::AgentKind;
use crate::tools::{
    inject_identity, strip_identity_from_schema, validate_args, RegistryCache, ToolDefinition,
};

/// 达到单轮调用上限仍无最终回答时返回的固定消息
pub const ITERATION_LIMIT_MESSAGE: &str =
    "Reached the operation limit for this turn before finishing. The tool results so far have been recorded.";

/// 一次 agent 运行的输入
#[derive(Clone, Copy, Debug)]
pub struct AgentRunRequest<'a> {
    pub user_id: &'a str,
    pub conversation_id: &'a str,
    pub context: Option<&'a str>,
    pub summaries: &'a [Summary],
    pub active_plan: Option<&'a TaskPlan>,
}

/// 一次 agent 运行的产出
#[derive(Clone, Debug)]
pub struct AgentRunOutcome {
    pub response: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub pending_approvals: Vec<ApprovalRequest>,
}

/// 某类专用 agent 的运行时：画像 + 共享组件
pub struct BaseAgent {
    profile: AgentProfile,
    llm: Arc<dyn LlmClient>,
    registry: Arc<RegistryCache>,
    gateway: Arc<CapabilityGateway>,
    memory: MemoryManager,
    max_iterations: usize,
    tool_result_cap: usize,
}

impl BaseAgent {
    pub fn new(
        profile: AgentProfile,
        llm: Arc<dyn LlmClient>,
        registry: Arc<RegistryCache>,
        gateway: Arc<CapabilityGateway>,
        memory: MemoryManager,
        section: &AgentSection,
    ) -> Self {
        Self {
            profile,
            llm,
            registry,
            gateway,
            memory,
            max_iterations: section.max_iterations.max(1),
            tool_result_cap: section.tool_result_cap_chars,
        }
    }

    pub fn kind(&self) -> AgentKind {
        self.profile.kind
    }

    /// 对给定历史跑一轮 call → tool → call 循环。
    /// 只有 LLM 后端失败会返回 Err；工具层的一切问题都软化为工具结果。
    pub async fn run(
        &self,
        history: &[Message],
        request: AgentRunRequest<'_>,
    ) -> Result<AgentRunOutcome, AgentError> {
        let system = self.profile.enriched_prompt(request.context);
        let state =
            self.memory
                .build_memory_state(history, request.summaries, request.active_plan);
        let mut messages = self.memory.assemble_llm_messages(&system, &state);

        // 操作清单：过滤到白名单并剥除身份参数；清单拉取失败降级为无工具运行
        let definitions = match self.registry.list().await {
            Ok(definitions) => definitions,
            Err(error) => {
                tracing::warn!(%error, "tool listing failed, running without tools");
                Vec::new()
            }
        };
        let tool_defs: Vec<ToolDefinition> = definitions
            .into_iter()
            .filter(|d| self.profile.allowed_tools.contains(&d.name))
            .map(|mut d| {
                d.schema = strip_identity_from_schema(&d.schema);
                d
            })
            .collect();
        let schemas: HashMap<String, Value> = tool_defs
            .iter()
            .map(|d| (d.name.clone(), d.schema.clone()))
            .collect();

        let mut all_calls: Vec<ToolCallRecord> = Vec::new();
        let mut pending: Vec<ApprovalRequest> = Vec::new();

        for iteration in 0..self.max_iterations {
            messages = self.memory.compress_if_needed(messages);

            let outcome = self
                .llm
                .chat(&messages, &tool_defs)
                .await
                .map_err(AgentError::LlmUnavailable)?;

            if outcome.tool_calls.is_empty() {
                let response = outcome
                    .content
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or_else(|| "Done.".to_string());
                return Ok(AgentRunOutcome {
                    response,
                    tool_calls: all_calls,
                    pending_approvals: pending,
                });
            }

            tracing::debug!(
                agent = %self.profile.kind,
                iteration,
                calls = outcome.tool_calls.len(),
                "executing requested tool calls"
            );
            messages.push(Message::assistant_with_calls(
                outcome.content.clone(),
                outcome.tool_calls.clone(),
            ));

            for call in outcome.tool_calls {
                let (result, is_error) = self
                    .execute_call(&call, &schemas, &request, &mut pending)
                    .await;
                let result = truncate_result(result, self.tool_result_cap);

                all_calls.push(ToolCallRecord {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                    result: Some(result.clone()),
                    is_error,
                });
                messages.push(Message::tool(call.id.clone(), result));
            }
        }

        Ok(AgentRunOutcome {
            response: ITERATION_LIMIT_MESSAGE.to_string(),
            tool_calls: all_calls,
            pending_approvals: pending,
        })
    }

    /// 单次工具调用：白名单 → schema 校验 → 身份注入 → 门控 → 执行。
    /// 返回 (结果文本, 错误标记)；待审批是非错误结果。
    async fn execute_call(
        &self,
        call: &ToolCallRecord,
        schemas: &HashMap<String, Value>,
        request: &AgentRunRequest<'_>,
        pending: &mut Vec<ApprovalRequest>,
    ) -> (String, bool) {
        let Some(schema) = schemas.get(&call.name) else {
            // 模型幻觉出的或白名单外的操作
            return (
                format!("[BLOCKED] operation `{}` is not available to this agent", call.name),
                true,
            );
        };

        if let Err(error) = validate_args(schema, &call.arguments) {
            return (format!("[ERROR] invalid arguments: {error}"), true);
        }

        let mut arguments = call.arguments.clone();
        inject_identity(&mut arguments, request.user_id);

        // 审批请求记下所属计划步骤，解析侧据此推进正确的步骤
        let plan_step = request.active_plan.and_then(|p| p.current()).map(|s| s.id);
        let decision = self
            .gateway
            .check_tool_permission(
                self.profile.kind,
                &call.name,
                request.user_id,
                request.conversation_id,
                plan_step,
                &arguments,
            )
            .await;

        match decision {
            PermissionDecision::Blocked { reason } => (format!("[BLOCKED] {reason}"), true),
            PermissionDecision::RequiresApproval { request } => {
                let reason = request.reason.clone();
                pending.push(request);
                (format!("[APPROVAL REQUIRED] {reason}"), false)
            }
            PermissionDecision::Allowed => match self.registry.call(&call.name, arguments).await {
                Ok(output) => (output.text(), output.is_error),
                Err(error) => (format!("[ERROR] tool execution failed: {error}"), true),
            },
        }
    }
}

/// 超过字符上限的结果截断为恰好上限长度，再附注原始长度的固定后缀
pub(crate) fn truncate_result(result: String, cap: usize) -> String {
    let chars = result.chars().count();
    if chars <= cap {
        return result;
    }
    let truncated: String = result.chars().take(cap).collect();
    format!("{truncated}\n[truncated, original {chars} chars]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::agents::drive_profile;
    use crate::config::{AgentSection, MemorySection};
    use crate::llm::MockLlmClient;
    use crate::tools::{ToolInvoker, ToolOutput};

    /// 录制调用的假工具后端
    #[derive(Default)]
    struct FakeInvoker {
        calls: Mutex<Vec<(String, Value)>>,
        fail_next: Mutex<bool>,
    }

    #[async_trait]
    impl ToolInvoker for FakeInvoker {
        async fn list_tools(&self) -> Result<Vec<ToolDefinition>, String> {
            let schema = |required: &[&str]| {
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" },
                        "target": { "type": "string" },
                        "user_id": { "type": "string" }
                    },
                    "required": required
                })
            };
            Ok(vec![
                ToolDefinition {
                    name: "list_files".into(),
                    description: "List files in a folder".into(),
                    schema: schema(&["path", "user_id"]),
                },
                ToolDefinition {
                    name: "move_file".into(),
                    description: "Move a file".into(),
                    schema: schema(&["path", "target", "user_id"]),
                },
                ToolDefinition {
                    name: "delete_file".into(),
                    description: "Delete a file".into(),
                    schema: schema(&["path", "user_id"]),
                },
            ])
        }

        async fn call_tool(&self, name: &str, args: Value) -> Result<ToolOutput, String> {
            if std::mem::take(&mut *self.fail_next.lock().unwrap()) {
                return Err("backend exploded".to_string());
            }
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), args.clone()));
            Ok(ToolOutput {
                content: vec![format!("{name} ok")],
                is_error: false,
            })
        }
    }

    fn agent_with(
        llm: Arc<MockLlmClient>,
        invoker: Arc<FakeInvoker>,
    ) -> (BaseAgent, Arc<CapabilityGateway>) {
        let gateway = Arc::new(CapabilityGateway::new(900));
        let agent = BaseAgent::new(
            drive_profile(),
            llm,
            Arc::new(RegistryCache::new(invoker)),
            gateway.clone(),
            MemoryManager::new(&MemorySection::default()),
            &AgentSection::default(),
        );
        (agent, gateway)
    }

    fn request<'a>() -> AgentRunRequest<'a> {
        AgentRunRequest {
            user_id: "alice",
            conversation_id: "conv-1",
            context: None,
            summaries: &[],
            active_plan: None,
        }
    }

    #[tokio::test]
    async fn plain_answer_ends_the_loop_without_tools() {
        let llm = Arc::new(MockLlmClient::new());
        llm.script_text("You have 3 files.");
        let (agent, _) = agent_with(llm, Arc::new(FakeInvoker::default()));

        let outcome = agent.run(&[Message::user("list my files")], request()).await.unwrap();
        assert_eq!(outcome.response, "You have 3 files.");
        assert!(outcome.tool_calls.is_empty());
        assert!(outcome.pending_approvals.is_empty());
    }

    #[tokio::test]
    async fn executes_allowed_tool_and_injects_identity() {
        let llm = Arc::new(MockLlmClient::new());
        llm.script_tool_call("list_files", serde_json::json!({ "path": "/docs" }));
        llm.script_text("Found 2 PDFs.");
        let invoker = Arc::new(FakeInvoker::default());
        let (agent, _) = agent_with(llm, invoker.clone());

        let outcome = agent.run(&[Message::user("list my files")], request()).await.unwrap();
        assert_eq!(outcome.response, "Found 2 PDFs.");
        assert_eq!(outcome.tool_calls.len(), 1);
        assert!(!outcome.tool_calls[0].is_error);

        let calls = invoker.calls.lock().unwrap();
        assert_eq!(calls[0].0, "list_files");
        assert_eq!(calls[0].1["user_id"], "alice");
    }

    #[tokio::test]
    async fn dangerous_tool_pauses_for_approval_without_executing() {
        let llm = Arc::new(MockLlmClient::new());
        llm.script_tool_call("delete_file", serde_json::json!({ "path": "/old.pdf" }));
        llm.script_text("I queued the deletion for your approval.");
        let invoker = Arc::new(FakeInvoker::default());
        let (agent, gateway) = agent_with(llm, invoker.clone());

        let outcome = agent.run(&[Message::user("delete old.pdf")], request()).await.unwrap();
        assert_eq!(outcome.pending_approvals.len(), 1);
        let record = &outcome.tool_calls[0];
        assert!(record.result.as_deref().unwrap().starts_with("[APPROVAL REQUIRED]"));
        assert!(!record.is_error); // 待审批不是错误

        assert!(invoker.calls.lock().unwrap().is_empty());
        assert_eq!(gateway.pending_approvals("alice").await.len(), 1);
    }

    #[tokio::test]
    async fn tool_failures_are_soft_and_loop_continues() {
        let llm = Arc::new(MockLlmClient::new());
        llm.script_tool_call("list_files", serde_json::json!({ "path": "/docs" }));
        llm.script_text("The folder could not be read.");
        let invoker = Arc::new(FakeInvoker::default());
        *invoker.fail_next.lock().unwrap() = true;
        let (agent, _) = agent_with(llm, invoker);

        let outcome = agent.run(&[Message::user("list my files")], request()).await.unwrap();
        assert_eq!(outcome.response, "The folder could not be read.");
        let record = &outcome.tool_calls[0];
        assert!(record.is_error);
        assert!(record.result.as_deref().unwrap().contains("tool execution failed"));
    }

    #[tokio::test]
    async fn hallucinated_tools_are_blocked() {
        let llm = Arc::new(MockLlmClient::new());
        llm.script_tool_call("format_drive", serde_json::json!({}));
        llm.script_text("That operation does not exist.");
        let (agent, _) = agent_with(llm, Arc::new(FakeInvoker::default()));

        let outcome = agent.run(&[Message::user("format everything")], request()).await.unwrap();
        let record = &outcome.tool_calls[0];
        assert!(record.is_error);
        assert!(record.result.as_deref().unwrap().starts_with("[BLOCKED]"));
    }

    #[tokio::test]
    async fn iteration_cap_returns_fixed_message() {
        let llm = Arc::new(MockLlmClient::new());
        for _ in 0..AgentSection::default().max_iterations {
            llm.script_tool_call("list_files", serde_json::json!({ "path": "/docs" }));
        }
        let (agent, _) = agent_with(llm, Arc::new(FakeInvoker::default()));

        let outcome = agent.run(&[Message::user("loop forever")], request()).await.unwrap();
        assert_eq!(outcome.response, ITERATION_LIMIT_MESSAGE);
    }

    #[tokio::test]
    async fn backend_failure_is_a_hard_error() {
        let llm = Arc::new(MockLlmClient::new());
        llm.script_error("connection refused");
        let (agent, _) = agent_with(llm, Arc::new(FakeInvoker::default()));

        let result = agent.run(&[Message::user("hello")], request()).await;
        assert!(matches!(result, Err(AgentError::LlmUnavailable(_))));
    }

    #[test]
    fn truncation_is_exact_cap_plus_suffix() {
        let cap = 20_000;
        let long = "x".repeat(25_000);
        let truncated = truncate_result(long, cap);
        let suffix = "\n[truncated, original 25000 chars]";
        assert!(truncated.ends_with(suffix));
        assert_eq!(truncated.chars().count(), cap + suffix.chars().count());

        let short = "y".repeat(10);
        assert_eq!(truncate_result(short.clone(), cap), short);
    }
}
