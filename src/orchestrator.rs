//! 任务编排器
//!
//! 按计划顺序逐步执行：每步解析执行 agent（步骤指定的类型，缺省回落到本轮
//! 基础类型），合成只含本步指令与此前步骤结果摘录的消息再交给 agent 运行。
//! 局部失败不中止编排，步骤标记为 failed 后继续；出现待审批则立即暂停，
//! 被挂起的步骤回退为 pending，审批解析或下一轮对话从同一步恢复。
//! 只有 LLM 后端不可用会向上传播为硬错误。

use std::sync::Arc;

use crate::agents::{AgentRegistry, AgentRunRequest, ITERATION_LIMIT_MESSAGE};
use crate::core::AgentError;
use crate::gateway::ApprovalRequest;
use crate::memory::{Message, Summary, ToolCallRecord};
use crate::plan::{StepStatus, TaskPlan, TaskPlanTracker, TaskStep};
use crate::router::AgentKind;

/// 此前步骤结果在合成消息中的摘录字符数
const RESULT_EXCERPT_CHARS: usize = 200;
/// 步骤记录中保留的结果摘要字符数
const RESULT_DIGEST_CHARS: usize = 2_000;

/// 一次编排的输入上下文
#[derive(Clone, Copy, Debug)]
pub struct OrchestrationContext<'a> {
    pub user_id: &'a str,
    pub conversation_id: &'a str,
    pub context: Option<&'a str>,
    pub summaries: &'a [Summary],
    /// 步骤未指定 agent 类型时的回落类型
    pub base_kind: AgentKind,
}

/// 一次编排的产出：推进后的计划、面向用户的回复、全部工具调用与待审批
#[derive(Clone, Debug)]
pub struct OrchestrationOutcome {
    pub plan: TaskPlan,
    pub response: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub pending_approvals: Vec<ApprovalRequest>,
    /// 因待审批而暂停（计划未走完）
    pub paused: bool,
}

/// 任务编排器
pub struct TaskOrchestrator {
    agents: Arc<AgentRegistry>,
}

impl TaskOrchestrator {
    pub fn new(agents: Arc<AgentRegistry>) -> Self {
        Self { agents }
    }

    /// 单步且单 agent 的计划不值得编排开销，按普通单轮执行
    pub fn needs_orchestration(plan: &TaskPlan) -> bool {
        plan.steps.len() > 1 || plan.distinct_agents() > 1
    }

    /// 从计划的当前步骤开始执行到完成或暂停
    pub async fn execute_plan(
        &self,
        plan: TaskPlan,
        history: &[Message],
        ctx: OrchestrationContext<'_>,
    ) -> Result<OrchestrationOutcome, AgentError> {
        let mut plan = plan;
        let mut all_calls: Vec<ToolCallRecord> = Vec::new();
        let mut pending: Vec<ApprovalRequest> = Vec::new();
        let mut paused = false;

        while !plan.is_complete {
            let Some(step) = plan.current().cloned() else {
                break;
            };
            plan = TaskPlanTracker::start_current_step(&plan);

            let kind = step.agent.unwrap_or(ctx.base_kind);
            let Some(agent) = self.agents.get(kind) else {
                tracing::warn!(step = step.id, agent = %kind, "no agent registered for step");
                plan = TaskPlanTracker::fail_current_step(
                    &plan,
                    &format!("no {kind} agent available"),
                );
                continue;
            };

            tracing::info!(step = step.id, agent = %kind, title = %step.title, "executing plan step");
            let step_history = step_history(history, &plan, &step);
            let outcome = agent
                .run(
                    &step_history,
                    AgentRunRequest {
                        user_id: ctx.user_id,
                        conversation_id: ctx.conversation_id,
                        context: ctx.context,
                        summaries: ctx.summaries,
                        active_plan: Some(&plan),
                    },
                )
                .await?;

            all_calls.extend(outcome.tool_calls);

            // 待审批：步骤回退为 pending，整个编排暂停等用户决定
            if !outcome.pending_approvals.is_empty() {
                pending.extend(outcome.pending_approvals);
                plan = TaskPlanTracker::pause_current_step(&plan);
                paused = true;
                break;
            }

            if outcome.response == ITERATION_LIMIT_MESSAGE {
                plan = TaskPlanTracker::fail_current_step(
                    &plan,
                    "reached the operation limit for this step",
                );
            } else {
                plan = TaskPlanTracker::complete_current_step(
                    &plan,
                    &excerpt(&outcome.response, RESULT_DIGEST_CHARS),
                );
            }
        }

        let response = render_response(&plan, &pending, paused);
        Ok(OrchestrationOutcome {
            plan,
            response,
            tool_calls: all_calls,
            pending_approvals: pending,
            paused,
        })
    }
}

/// 合成本步的消息序列：会话历史 + 此前步骤结果摘录 + 只执行本步的指令
fn step_history(history: &[Message], plan: &TaskPlan, step: &TaskStep) -> Vec<Message> {
    let mut messages = history.to_vec();

    let prior: Vec<String> = plan
        .steps
        .iter()
        .filter(|s| s.id < step.id && s.status.is_terminal())
        .map(|s| {
            let body = match s.status {
                StepStatus::Failed => {
                    format!("failed: {}", s.error.as_deref().unwrap_or("unknown error"))
                }
                StepStatus::Skipped => {
                    format!("skipped: {}", s.result.as_deref().unwrap_or("no reason"))
                }
                _ => excerpt(
                    s.result.as_deref().unwrap_or("(no output)"),
                    RESULT_EXCERPT_CHARS,
                ),
            };
            format!("{}. {}: {}", s.id, s.title, body)
        })
        .collect();
    if !prior.is_empty() {
        messages.push(Message::assistant(format!(
            "Progress on the current task so far:\n{}",
            prior.join("\n")
        )));
    }

    messages.push(Message::user(format!(
        "Overall goal: {}\nCurrent step {}: {}. {}\nExecute only this step.",
        plan.goal, step.id, step.title, step.description
    )));
    messages
}

fn excerpt(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text.to_string();
    }
    let prefix: String = text.chars().take(cap).collect();
    format!("{prefix}...")
}

/// 面向用户的编排结语：暂停提示 / 最后一个成功步骤的结果 / 失败明细，
/// 末尾都带计划渲染
fn render_response(plan: &TaskPlan, pending: &[ApprovalRequest], paused: bool) -> String {
    let rendered = TaskPlanTracker::format_plan_for_user(plan);

    if paused {
        let items: Vec<String> = pending
            .iter()
            .map(|r| format!("- `{}` ({})", r.tool_name, r.reason))
            .collect();
        return format!(
            "The task is paused: the following operation(s) need your approval first.\n{}\n\n{rendered}",
            items.join("\n")
        );
    }

    let last_success = plan
        .steps
        .iter()
        .rev()
        .find(|s| s.status == StepStatus::Completed)
        .and_then(|s| s.result.as_deref());

    match last_success {
        Some(result) => format!("{result}\n\n{rendered}"),
        None => {
            let failures: Vec<String> = plan
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Failed)
                .map(|s| {
                    format!(
                        "- {}: {}",
                        s.title,
                        s.error.as_deref().unwrap_or("unknown error")
                    )
                })
                .collect();
            format!(
                "None of the steps could be completed.\n{}\n\n{rendered}",
                failures.join("\n")
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Arc;

    use crate::agents::{document_profile, drive_profile, BaseAgent};
    use crate::config::{AgentSection, MemorySection};
    use crate::gateway::CapabilityGateway;
    use crate::llm::MockLlmClient;
    use crate::memory::MemoryManager;
    use crate::tools::{RegistryCache, ToolDefinition, ToolInvoker, ToolOutput};

    struct NoToolInvoker;

    #[async_trait]
    impl ToolInvoker for NoToolInvoker {
        async fn list_tools(&self) -> Result<Vec<ToolDefinition>, String> {
            Ok(Vec::new())
        }
        async fn call_tool(&self, _name: &str, _args: Value) -> Result<ToolOutput, String> {
            Err("no tools in this test".to_string())
        }
    }

    struct DeleteOnlyInvoker;

    #[async_trait]
    impl ToolInvoker for DeleteOnlyInvoker {
        async fn list_tools(&self) -> Result<Vec<ToolDefinition>, String> {
            Ok(vec![ToolDefinition {
                name: "delete_file".into(),
                description: "Delete a file".into(),
                schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" },
                        "user_id": { "type": "string" }
                    },
                    "required": ["path", "user_id"]
                }),
            }])
        }
        async fn call_tool(&self, _name: &str, _args: Value) -> Result<ToolOutput, String> {
            panic!("must not execute before approval");
        }
    }

    fn registry_with(
        llm: Arc<MockLlmClient>,
        invoker: Arc<dyn ToolInvoker>,
        kinds: &[AgentKind],
    ) -> (Arc<AgentRegistry>, Arc<CapabilityGateway>) {
        let gateway = Arc::new(CapabilityGateway::new(900));
        let cache = Arc::new(RegistryCache::new(invoker));
        let mut registry = AgentRegistry::new();
        for kind in kinds {
            let profile = match kind {
                AgentKind::Drive => drive_profile(),
                AgentKind::Document => document_profile(),
                AgentKind::Search => crate::agents::search_profile(),
            };
            registry.register(BaseAgent::new(
                profile,
                llm.clone(),
                cache.clone(),
                gateway.clone(),
                MemoryManager::new(&MemorySection::default()),
                &AgentSection::default(),
            ));
        }
        (Arc::new(registry), gateway)
    }

    fn two_step_plan() -> TaskPlan {
        let mut first = TaskStep::new(1, "read the report", "read the quarterly report");
        first.agent = Some(AgentKind::Document);
        let mut second = TaskStep::new(2, "summarize it", "write a short summary");
        second.agent = Some(AgentKind::Document);
        TaskPlan::new("summarize the quarterly report", vec![first, second])
    }

    fn ctx(base_kind: AgentKind) -> OrchestrationContext<'static> {
        OrchestrationContext {
            user_id: "alice",
            conversation_id: "conv-1",
            context: None,
            summaries: &[],
            base_kind,
        }
    }

    #[test]
    fn single_step_single_agent_skips_orchestration() {
        let mut plan = TaskPlan::new("trivial", vec![TaskStep::new(1, "do it", "just do it")]);
        assert!(!TaskOrchestrator::needs_orchestration(&plan));

        plan.steps.push(TaskStep::new(2, "more", "and more"));
        assert!(TaskOrchestrator::needs_orchestration(&plan));
    }

    #[tokio::test]
    async fn runs_steps_in_order_and_completes_the_plan() {
        let llm = Arc::new(MockLlmClient::new());
        llm.script_text("The report covers Q2 revenue.");
        llm.script_text("Summary: revenue grew 12% in Q2.");
        let (registry, _) = registry_with(llm, Arc::new(NoToolInvoker), &[AgentKind::Document]);
        let orchestrator = TaskOrchestrator::new(registry);

        let outcome = orchestrator
            .execute_plan(two_step_plan(), &[Message::user("summarize the report")], ctx(AgentKind::Document))
            .await
            .unwrap();

        assert!(outcome.plan.is_complete);
        assert!(!outcome.paused);
        assert!(outcome.response.contains("revenue grew 12%"));
        assert!(outcome.response.contains("2/2 steps completed"));
        assert_eq!(outcome.plan.steps[0].status, StepStatus::Completed);
        assert_eq!(outcome.plan.steps[1].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn missing_agent_fails_the_step_but_not_the_plan() {
        let llm = Arc::new(MockLlmClient::new());
        llm.script_text("Summary written from what was available.");
        // 只注册 document：第一步指到 search 的计划会失败并继续
        let (registry, _) = registry_with(llm, Arc::new(NoToolInvoker), &[AgentKind::Document]);
        let orchestrator = TaskOrchestrator::new(registry);

        let mut plan = two_step_plan();
        plan.steps[0].agent = Some(AgentKind::Search);

        let outcome = orchestrator
            .execute_plan(plan, &[], ctx(AgentKind::Document))
            .await
            .unwrap();

        assert!(outcome.plan.is_complete);
        assert_eq!(outcome.plan.steps[0].status, StepStatus::Failed);
        assert_eq!(outcome.plan.steps[1].status, StepStatus::Completed);
        assert!(outcome.response.contains("1/2 steps completed, 1 failed"));
    }

    #[tokio::test]
    async fn approval_pauses_with_the_step_still_open() {
        let llm = Arc::new(MockLlmClient::new());
        llm.script_tool_call("delete_file", serde_json::json!({ "path": "/old.pdf" }));
        llm.script_text("Waiting for your approval to delete.");
        let (registry, gateway) =
            registry_with(llm, Arc::new(DeleteOnlyInvoker), &[AgentKind::Drive]);
        let orchestrator = TaskOrchestrator::new(registry);

        let mut first = TaskStep::new(1, "delete old report", "delete /old.pdf");
        first.agent = Some(AgentKind::Drive);
        let mut second = TaskStep::new(2, "confirm", "confirm the trash is clean");
        second.agent = Some(AgentKind::Drive);
        let plan = TaskPlan::new("clean up old files", vec![first, second]);

        let outcome = orchestrator
            .execute_plan(plan, &[], ctx(AgentKind::Drive))
            .await
            .unwrap();

        assert!(outcome.paused);
        assert!(!outcome.plan.is_complete);
        // 被挂起的步骤回到 pending，恢复执行时重跑
        assert_eq!(outcome.plan.steps[0].status, StepStatus::Pending);
        assert_eq!(outcome.plan.current_step, 1);
        assert_eq!(outcome.pending_approvals.len(), 1);
        assert!(outcome.response.contains("need your approval"));
        assert_eq!(gateway.pending_approvals("alice").await.len(), 1);
    }

    #[tokio::test]
    async fn all_steps_failing_yields_an_itemized_report() {
        let llm = Arc::new(MockLlmClient::new());
        // 不注册任何步骤需要的 agent
        let (registry, _) = registry_with(llm, Arc::new(NoToolInvoker), &[AgentKind::Drive]);
        let orchestrator = TaskOrchestrator::new(registry);

        let mut plan = two_step_plan();
        plan.steps[0].agent = Some(AgentKind::Search);
        plan.steps[1].agent = Some(AgentKind::Document);

        let outcome = orchestrator
            .execute_plan(plan, &[], ctx(AgentKind::Search))
            .await
            .unwrap();

        assert!(outcome.plan.is_complete);
        assert!(outcome.response.contains("None of the steps could be completed"));
        assert!(outcome.response.contains("no search agent available"));
        assert!(outcome.response.contains("no document agent available"));
    }
}
