//! Agent 服务：对话轮次的组合根
//!
//! 每轮对话的完整管线：加载会话 → 路由 → （必要时）规划 → 单 agent 运行或
//! 多步编排 → 持久化 → 通知。会话按整体读写，每轮一个写者；通知与审计是
//! 尽力而为的旁路，失败只记日志。审批解析独立于对话轮次：批准即消费即执行，
//! 同一请求不可能执行两次。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use serde::Serialize;

use crate::agents::{
    document_profile, drive_profile, search_profile, truncate_result, AgentRegistry,
    AgentRunOutcome, AgentRunRequest, BaseAgent,
};
use crate::config::{load_config, AppConfig, LlmSection};
use crate::core::AgentError;
use crate::gateway::{ApprovalRequest, ApprovalResolution, CapabilityGateway};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::memory::{Conversation, ConversationStore, MemoryManager, Message, ToolCallRecord};
use crate::notify::{NotificationEvent, Notifier, TracingNotifier};
use crate::orchestrator::{OrchestrationContext, TaskOrchestrator};
use crate::plan::{TaskPlan, TaskPlanTracker, TaskPlanner};
use crate::router::{AgentKind, AgentRouter, RouteDecision, RouteSource};
use crate::tools::{RegistryCache, ToolInvoker};

/// 一轮对话的输入
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub user_id: String,
    /// 缺省时新建会话
    pub conversation_id: Option<String>,
    pub message: String,
    /// 调用方显式指定 agent 类型，路由优先级最高
    pub agent_hint: Option<AgentKind>,
    /// 调用方上下文（当前目录、选中文件等），注入 system prompt
    pub context: Option<String>,
}

/// 一轮对话的输出
#[derive(Clone, Debug, Serialize)]
pub struct ChatResponse {
    pub conversation_id: String,
    pub agent_kind: AgentKind,
    pub message: String,
    pub route: RouteDecision,
    /// 本轮涉及的任务计划（新建或推进后的状态）
    pub plan: Option<TaskPlan>,
    pub pending_approvals: Vec<ApprovalRequest>,
}

/// 审批解析的结果。解析失败（不存在/过期/已解析）不是错误，以状态表达。
#[derive(Clone, Debug)]
pub struct ApprovalOutcome {
    pub approval_id: String,
    pub status: ApprovalResolution,
    /// 已批准且操作已执行
    pub executed: bool,
    /// 执行结果文本（可能已截断）
    pub result: Option<String>,
    /// 面向用户的状态说明
    pub message: String,
}

impl ApprovalOutcome {
    fn unexecuted(approval_id: &str, status: ApprovalResolution) -> Self {
        let message = match status {
            ApprovalResolution::Approved => "the operation was approved",
            ApprovalResolution::Rejected => "the operation was rejected and will not run",
            ApprovalResolution::Expired => "the approval expired before it was resolved",
            ApprovalResolution::NotFound => "no such pending approval",
            ApprovalResolution::AlreadyResolved => "this approval was already resolved",
        };
        Self {
            approval_id: approval_id.to_string(),
            status,
            executed: false,
            result: None,
            message: message.to_string(),
        }
    }
}

/// Agent 服务
pub struct AgentService {
    store: Arc<dyn ConversationStore>,
    llm: Arc<dyn LlmClient>,
    router: AgentRouter,
    planner: TaskPlanner,
    orchestrator: TaskOrchestrator,
    agents: Arc<AgentRegistry>,
    gateway: Arc<CapabilityGateway>,
    registry: Arc<RegistryCache>,
    memory: MemoryManager,
    notifier: Arc<dyn Notifier>,
    default_kind: AgentKind,
    tool_result_cap: usize,
}

impl AgentService {
    pub fn new(
        config: &AppConfig,
        llm: Arc<dyn LlmClient>,
        invoker: Arc<dyn ToolInvoker>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        let gateway = Arc::new(CapabilityGateway::new(config.approval.ttl_secs));
        let registry = Arc::new(RegistryCache::new(invoker));
        let memory = MemoryManager::new(&config.memory);

        let mut agents = AgentRegistry::new();
        for profile in [drive_profile(), document_profile(), search_profile()] {
            agents.register(BaseAgent::new(
                profile,
                llm.clone(),
                registry.clone(),
                gateway.clone(),
                memory.clone(),
                &config.agent,
            ));
        }
        let agents = Arc::new(agents);

        let default_kind =
            AgentKind::parse(&config.app.default_agent).unwrap_or(AgentKind::Drive);

        Self {
            store,
            llm: llm.clone(),
            router: AgentRouter::new(llm.clone(), config.router.pattern_threshold, default_kind),
            planner: TaskPlanner::new(llm, &config.planner),
            orchestrator: TaskOrchestrator::new(agents.clone()),
            agents,
            gateway,
            registry,
            memory,
            notifier: Arc::new(TracingNotifier),
            default_kind,
            tool_result_cap: config.agent.tool_result_cap_chars,
        }
    }

    /// 替换通知实现（默认只写日志）
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// 处理一轮对话
    pub async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, AgentError> {
        let mut conversation = match &request.conversation_id {
            Some(id) => self
                .store
                .load(id, &request.user_id)
                .await
                .map_err(AgentError::Storage)?
                .ok_or_else(|| AgentError::ConversationNotFound(id.clone()))?,
            None => Conversation::new(&request.user_id),
        };
        conversation.push(Message::user(&request.message));
        let context = request.context.as_deref();

        // 未完成的计划优先恢复，跳过路由与重新规划
        let resume_plan = conversation
            .active_plan
            .clone()
            .filter(|plan| !plan.is_complete);

        let (route, message, plan_after, tool_calls, pending) = match resume_plan {
            Some(plan) => {
                let base_kind = conversation.agent_kind.unwrap_or(self.default_kind);
                let route = RouteDecision {
                    kind: base_kind,
                    confidence: 0.9,
                    source: RouteSource::Conversation,
                    reason: "resuming the active task plan".to_string(),
                };
                tracing::info!(conversation = %conversation.id, goal = %plan.goal, "resuming unfinished plan");
                let outcome = self
                    .orchestrator
                    .execute_plan(
                        plan,
                        &conversation.messages,
                        self.orchestration_context(&conversation, context, base_kind),
                    )
                    .await?;
                (
                    route,
                    outcome.response,
                    Some(outcome.plan),
                    outcome.tool_calls,
                    outcome.pending_approvals,
                )
            }
            None => {
                let route = self
                    .router
                    .route(
                        &request.message,
                        request.agent_hint,
                        conversation.sticky_kind(),
                        context,
                    )
                    .await;
                tracing::info!(
                    conversation = %conversation.id,
                    agent = %route.kind,
                    source = ?route.source,
                    confidence = route.confidence,
                    "routed"
                );
                self.run_turn(&conversation, &request, route, context)
                    .await?
            }
        };

        conversation.agent_kind = Some(route.kind);
        conversation.last_route = Some(route.clone());
        if let Some(plan) = plan_after.clone() {
            conversation.active_plan = Some(plan);
        }
        conversation.push(Message::assistant_with_calls(
            Some(message.clone()),
            tool_calls,
        ));

        // 滑动窗口溢出时折叠旧消息为摘要，持久化以免重复计算
        if let Some(summary) = self
            .memory
            .fold_overflow(&conversation.messages, &conversation.summaries)
        {
            conversation.summaries.push(summary);
        }

        self.store
            .save(&conversation)
            .await
            .map_err(AgentError::Storage)?;

        for approval in &pending {
            if let Err(error) = self
                .notifier
                .notify(
                    &request.user_id,
                    NotificationEvent::ApprovalRequired { request: approval },
                )
                .await
            {
                tracing::warn!(%error, "approval notification failed");
            }
        }
        if let Some(plan) = plan_after.as_ref().filter(|p| p.is_complete) {
            let summary = plan.closing_summary.clone().unwrap_or_default();
            if let Err(error) = self
                .notifier
                .notify(
                    &request.user_id,
                    NotificationEvent::PlanFinished {
                        goal: &plan.goal,
                        summary: &summary,
                    },
                )
                .await
            {
                tracing::warn!(%error, "plan notification failed");
            }
        }

        Ok(ChatResponse {
            conversation_id: conversation.id,
            agent_kind: route.kind,
            message,
            route,
            plan: plan_after,
            pending_approvals: pending,
        })
    }

    /// 无既有计划的一轮：判断是否规划，然后单 agent 运行或编排
    async fn run_turn(
        &self,
        conversation: &Conversation,
        request: &ChatRequest,
        route: RouteDecision,
        context: Option<&str>,
    ) -> Result<TurnResult, AgentError> {
        let plan = if self.planner.should_plan_task(&request.message, context).await {
            self.planner
                .generate_task_plan(&request.message, context)
                .await
        } else {
            None
        };

        match plan {
            Some(plan) if TaskOrchestrator::needs_orchestration(&plan) => {
                let outcome = self
                    .orchestrator
                    .execute_plan(
                        plan,
                        &conversation.messages,
                        self.orchestration_context(conversation, context, route.kind),
                    )
                    .await?;
                Ok((
                    route,
                    outcome.response,
                    Some(outcome.plan),
                    outcome.tool_calls,
                    outcome.pending_approvals,
                ))
            }
            Some(plan) => {
                // 单步单 agent 的计划按普通单轮执行，事后补全状态机
                let outcome = self
                    .run_single(route.kind, conversation, context, Some(&plan))
                    .await?;
                let plan = if outcome.pending_approvals.is_empty() {
                    let started = TaskPlanTracker::start_current_step(&plan);
                    TaskPlanTracker::complete_current_step(&started, &outcome.response)
                } else {
                    // 挂起：步骤保持 pending，审批解析后推进
                    plan
                };
                Ok((
                    route,
                    outcome.response,
                    Some(plan),
                    outcome.tool_calls,
                    outcome.pending_approvals,
                ))
            }
            None => {
                let outcome = self.run_single(route.kind, conversation, context, None).await?;
                Ok((
                    route,
                    outcome.response,
                    None,
                    outcome.tool_calls,
                    outcome.pending_approvals,
                ))
            }
        }
    }

    async fn run_single(
        &self,
        kind: AgentKind,
        conversation: &Conversation,
        context: Option<&str>,
        active_plan: Option<&TaskPlan>,
    ) -> Result<AgentRunOutcome, AgentError> {
        let Some(agent) = self.agents.get(kind) else {
            return Err(AgentError::ConfigError(format!(
                "no {kind} agent registered"
            )));
        };
        agent
            .run(
                &conversation.messages,
                AgentRunRequest {
                    user_id: &conversation.user_id,
                    conversation_id: &conversation.id,
                    context,
                    summaries: &conversation.summaries,
                    active_plan,
                },
            )
            .await
    }

    fn orchestration_context<'a>(
        &self,
        conversation: &'a Conversation,
        context: Option<&'a str>,
        base_kind: AgentKind,
    ) -> OrchestrationContext<'a> {
        OrchestrationContext {
            user_id: &conversation.user_id,
            conversation_id: &conversation.id,
            context,
            summaries: &conversation.summaries,
            base_kind,
        }
    }

    /// 解析一个待审批请求。批准走 消费 → 执行 → 记录 的单向流程，
    /// 消费保证同一请求至多执行一次。
    pub async fn resolve_approval(
        &self,
        user_id: &str,
        approval_id: &str,
        approved: bool,
    ) -> Result<ApprovalOutcome, AgentError> {
        let status = self
            .gateway
            .resolve_approval(approval_id, user_id, approved)
            .await;

        match status {
            ApprovalResolution::Approved => {
                let Some(request) = self.gateway.consume_approval(approval_id).await else {
                    // 并发解析中另一个调用抢先消费
                    return Ok(ApprovalOutcome::unexecuted(
                        approval_id,
                        ApprovalResolution::NotFound,
                    ));
                };

                // 参数在挂起时已注入身份，原样执行
                let (result, is_error) = match self
                    .registry
                    .call(&request.tool_name, request.arguments.clone())
                    .await
                {
                    Ok(output) => (output.text(), output.is_error),
                    Err(error) => (format!("tool execution failed: {error}"), true),
                };
                let result = truncate_result(result, self.tool_result_cap);

                self.record_resolution(&request, Some(&result), is_error).await;
                if let Err(error) = self
                    .notifier
                    .notify(
                        user_id,
                        NotificationEvent::ApprovalResolved {
                            request: &request,
                            executed: true,
                        },
                    )
                    .await
                {
                    tracing::warn!(%error, "approval notification failed");
                }

                let message = if is_error {
                    format!("`{}` was approved but failed during execution", request.tool_name)
                } else {
                    format!("`{}` was approved and executed", request.tool_name)
                };
                Ok(ApprovalOutcome {
                    approval_id: approval_id.to_string(),
                    status: ApprovalResolution::Approved,
                    executed: true,
                    result: Some(result),
                    message,
                })
            }
            ApprovalResolution::Rejected => {
                if let Some(request) = self.gateway.consume_approval(approval_id).await {
                    self.record_resolution(&request, None, false).await;
                    if let Err(error) = self
                        .notifier
                        .notify(
                            user_id,
                            NotificationEvent::ApprovalResolved {
                                request: &request,
                                executed: false,
                            },
                        )
                        .await
                    {
                        tracing::warn!(%error, "approval notification failed");
                    }
                }
                Ok(ApprovalOutcome::unexecuted(
                    approval_id,
                    ApprovalResolution::Rejected,
                ))
            }
            other => Ok(ApprovalOutcome::unexecuted(approval_id, other)),
        }
    }

    /// 将审批结果写回会话并推进被挂起的计划步骤。执行已经发生，
    /// 这里的存储失败只记日志不回传。
    async fn record_resolution(
        &self,
        request: &ApprovalRequest,
        result: Option<&str>,
        is_error: bool,
    ) {
        let loaded = self
            .store
            .load(&request.conversation_id, &request.user_id)
            .await;
        let mut conversation = match loaded {
            Ok(Some(conversation)) => conversation,
            Ok(None) => return,
            Err(error) => {
                tracing::warn!(%error, "failed to load conversation for approval record");
                return;
            }
        };

        let note = match result {
            Some(result) if is_error => format!(
                "Approved operation `{}` failed: {result}",
                request.tool_name
            ),
            Some(result) => format!(
                "Approved operation `{}` executed: {result}",
                request.tool_name
            ),
            None => format!(
                "Operation `{}` was rejected and will not be executed.",
                request.tool_name
            ),
        };
        conversation.push(Message::assistant(note));

        // 被审批挂起的步骤留在 pending：只有属于当前步骤的审批才可能推进它，
        // 且同一步骤的全部审批都解析完之后才按最后一次的结果终结，
        // 避免一步多个审批时把后继步骤误判为已执行
        if let Some(plan) = conversation.active_plan.clone().filter(|p| !p.is_complete) {
            let belongs = request.plan_step == Some(plan.current_step);
            if belongs && plan.current().is_some_and(|s| !s.status.is_terminal()) {
                let outstanding = self
                    .gateway
                    .pending_approvals(&request.user_id)
                    .await
                    .iter()
                    .any(|r| {
                        r.conversation_id == request.conversation_id
                            && r.plan_step == request.plan_step
                    });
                if !outstanding {
                    let advanced = match result {
                        Some(result) if !is_error => {
                            TaskPlanTracker::complete_current_step(&plan, result)
                        }
                        Some(result) => TaskPlanTracker::fail_current_step(&plan, result),
                        None => TaskPlanTracker::skip_current_step(&plan, "rejected by user"),
                    };
                    conversation.active_plan = Some(advanced);
                }
            }
        }

        if let Err(error) = self.store.save(&conversation).await {
            tracing::warn!(%error, "failed to persist approval record");
        }
    }

    /// 用户当前的待审批列表
    pub async fn pending_approvals(&self, user_id: &str) -> Vec<ApprovalRequest> {
        self.gateway.pending_approvals(user_id).await
    }

    /// 用户的活跃会话列表，按更新时间倒序
    pub async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, AgentError> {
        self.store.list(user_id).await.map_err(AgentError::Storage)
    }

    pub async fn get_conversation(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Conversation, AgentError> {
        self.store
            .load(conversation_id, user_id)
            .await
            .map_err(AgentError::Storage)?
            .ok_or_else(|| AgentError::ConversationNotFound(conversation_id.to_string()))
    }

    /// 软删除：标记不可见，不物理清除
    pub async fn delete_conversation(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<(), AgentError> {
        let mut conversation = self.get_conversation(user_id, conversation_id).await?;
        conversation.is_active = false;
        self.store
            .save(&conversation)
            .await
            .map_err(AgentError::Storage)
    }

    /// 后端操作集变化后刷新工具清单缓存
    pub async fn refresh_tools(&self) {
        self.registry.invalidate().await;
    }

    /// 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }
}

type TurnResult = (
    RouteDecision,
    String,
    Option<TaskPlan>,
    Vec<ToolCallRecord>,
    Vec<ApprovalRequest>,
);

/// 按配置选择 LLM 后端：有 OPENAI_API_KEY 用 OpenAI 兼容端点，否则退回 Mock
pub fn create_llm(section: &LlmSection) -> Arc<dyn LlmClient> {
    if std::env::var("OPENAI_API_KEY").is_ok() {
        tracing::info!(model = %section.model, "using OpenAI-compatible backend");
        Arc::new(OpenAiClient::new(
            section.base_url.as_deref(),
            &section.model,
            None,
        ))
    } else {
        tracing::warn!("OPENAI_API_KEY not set, using the mock backend");
        Arc::new(MockLlmClient::new())
    }
}

/// 从配置文件与环境变量装配整个服务
pub fn bootstrap(
    config_path: Option<PathBuf>,
    invoker: Arc<dyn ToolInvoker>,
    store: Arc<dyn ConversationStore>,
) -> anyhow::Result<AgentService> {
    let config = load_config(config_path).context("loading configuration")?;
    let llm = create_llm(&config.llm);
    Ok(AgentService::new(&config, llm, invoker, store))
}
