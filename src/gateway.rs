//! 能力门控
//!
//! 按 (agent 类型, 操作, 参数) 做放行 / 拦截 / 要求审批的策略决定，并持有
//! 待审批注册表。危险分类是静态策略：不可逆或授权类操作要求审批，只读与
//! 可逆操作自动放行，部分操作对特定 agent 类型始终拦截。门控只做决定，
//! 不执行工具：审批通过后由调用方按存储的名称与参数执行，consume 保证单次。
//! 审批有效期采用固定 TTL，在解析时惰性判定。

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::router::AgentKind;

/// 审批请求状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

/// 一次被挂起、等待用户显式同意的操作
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    /// 触发审批的计划步骤 id；无计划的单轮为 None
    pub plan_step: Option<u32>,
    pub reason: String,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// 单次权限检查的结论
#[derive(Clone, Debug)]
pub enum PermissionDecision {
    Allowed,
    Blocked { reason: String },
    RequiresApproval { request: ApprovalRequest },
}

/// 审批解析结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApprovalResolution {
    Approved,
    Rejected,
    Expired,
    /// 不存在、归属不符或已被消费
    NotFound,
    /// 已解析但尚未消费，重复解析不再生效
    AlreadyResolved,
}

/// 静态危险策略。操作名集合是可替换的配置数据。
pub struct ToolPolicy {
    /// 明确要求审批的操作
    approval_exact: HashSet<String>,
    /// 按前缀判定为危险的操作（删除类、授权类）
    approval_prefixes: Vec<String>,
    /// 对特定 agent 类型始终拦截的操作
    blocked: HashMap<AgentKind, HashSet<String>>,
}

impl Default for ToolPolicy {
    fn default() -> Self {
        let approval_exact = [
            "delete_file",
            "delete_folder",
            "empty_trash",
            "share_file",
            "share_folder",
            "set_permissions",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        let approval_prefixes = ["delete_", "share_", "grant_", "revoke_", "purge_"]
            .into_iter()
            .map(String::from)
            .collect();

        let mut blocked: HashMap<AgentKind, HashSet<String>> = HashMap::new();
        // 检索类 agent 永远无权触碰破坏性与授权操作
        blocked.insert(
            AgentKind::Search,
            ["delete_file", "delete_folder", "empty_trash", "set_permissions"]
                .into_iter()
                .map(String::from)
                .collect(),
        );
        blocked.insert(
            AgentKind::Document,
            ["empty_trash", "set_permissions"]
                .into_iter()
                .map(String::from)
                .collect(),
        );

        Self {
            approval_exact,
            approval_prefixes,
            blocked,
        }
    }
}

impl ToolPolicy {
    fn is_blocked(&self, kind: AgentKind, tool: &str) -> bool {
        self.blocked
            .get(&kind)
            .map(|set| set.contains(tool))
            .unwrap_or(false)
    }

    fn requires_approval(&self, tool: &str) -> bool {
        self.approval_exact.contains(tool)
            || self.approval_prefixes.iter().any(|p| tool.starts_with(p))
    }
}

/// 能力门控：策略引擎 + 待审批注册表
pub struct CapabilityGateway {
    policy: ToolPolicy,
    approvals: Mutex<HashMap<String, ApprovalRequest>>,
    ttl: Duration,
}

impl CapabilityGateway {
    pub fn new(ttl_secs: u64) -> Self {
        Self::with_policy(ToolPolicy::default(), ttl_secs)
    }

    pub fn with_policy(policy: ToolPolicy, ttl_secs: u64) -> Self {
        Self {
            policy,
            approvals: Mutex::new(HashMap::new()),
            ttl: Duration::seconds(ttl_secs as i64),
        }
    }

    /// 每次工具执行前的权限检查；要求审批时创建并登记 pending 请求
    pub async fn check_tool_permission(
        &self,
        kind: AgentKind,
        tool_name: &str,
        user_id: &str,
        conversation_id: &str,
        plan_step: Option<u32>,
        arguments: &serde_json::Value,
    ) -> PermissionDecision {
        if self.policy.is_blocked(kind, tool_name) {
            let reason = format!("operation `{tool_name}` is not available to the {kind} agent");
            tracing::info!(tool = tool_name, agent = %kind, "tool blocked by policy");
            return PermissionDecision::Blocked { reason };
        }

        if self.policy.requires_approval(tool_name) {
            let request = ApprovalRequest {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: user_id.to_string(),
                conversation_id: conversation_id.to_string(),
                tool_name: tool_name.to_string(),
                arguments: arguments.clone(),
                plan_step,
                reason: format!("`{tool_name}` is irreversible or grants access"),
                status: ApprovalStatus::Pending,
                created_at: Utc::now(),
                resolved_at: None,
            };
            self.approvals
                .lock()
                .await
                .insert(request.id.clone(), request.clone());
            tracing::info!(tool = tool_name, approval_id = %request.id, "tool requires approval");
            return PermissionDecision::RequiresApproval { request };
        }

        PermissionDecision::Allowed
    }

    /// 解析一个待审批请求；归属不符按不存在处理，过期惰性判定
    pub async fn resolve_approval(
        &self,
        approval_id: &str,
        user_id: &str,
        approved: bool,
    ) -> ApprovalResolution {
        let mut approvals = self.approvals.lock().await;
        let Some(request) = approvals.get_mut(approval_id) else {
            return ApprovalResolution::NotFound;
        };
        if request.user_id != user_id {
            return ApprovalResolution::NotFound;
        }
        if request.status != ApprovalStatus::Pending {
            return ApprovalResolution::AlreadyResolved;
        }
        let now = Utc::now();
        if now - request.created_at > self.ttl {
            request.status = ApprovalStatus::Expired;
            request.resolved_at = Some(now);
            return ApprovalResolution::Expired;
        }

        request.resolved_at = Some(now);
        if approved {
            request.status = ApprovalStatus::Approved;
            ApprovalResolution::Approved
        } else {
            request.status = ApprovalStatus::Rejected;
            ApprovalResolution::Rejected
        }
    }

    /// 取走一个已解析的请求。单次使用：同一 id 第二次取必然拿不到，
    /// 重试解析也不会导致二次执行。pending 请求不可取走。
    pub async fn consume_approval(&self, approval_id: &str) -> Option<ApprovalRequest> {
        let mut approvals = self.approvals.lock().await;
        match approvals.get(approval_id) {
            Some(request) if request.status != ApprovalStatus::Pending => {
                approvals.remove(approval_id)
            }
            _ => None,
        }
    }

    /// 用户当前的待审批列表（只读，供通知/UI）
    pub async fn pending_approvals(&self, user_id: &str) -> Vec<ApprovalRequest> {
        let approvals = self.approvals.lock().await;
        let now = Utc::now();
        approvals
            .values()
            .filter(|r| {
                r.user_id == user_id
                    && r.status == ApprovalStatus::Pending
                    && now - r.created_at <= self.ttl
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pending_request(gateway: &CapabilityGateway) -> ApprovalRequest {
        match gateway
            .check_tool_permission(
                AgentKind::Drive,
                "delete_file",
                "alice",
                "conv-1",
                None,
                &serde_json::json!({ "path": "/old.pdf" }),
            )
            .await
        {
            PermissionDecision::RequiresApproval { request } => request,
            other => panic!("expected approval requirement, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_only_operations_are_allowed() {
        let gateway = CapabilityGateway::new(900);
        let decision = gateway
            .check_tool_permission(
                AgentKind::Drive,
                "list_files",
                "alice",
                "conv-1",
                None,
                &serde_json::json!({}),
            )
            .await;
        assert!(matches!(decision, PermissionDecision::Allowed));
    }

    #[tokio::test]
    async fn destructive_operations_are_blocked_for_search_agent() {
        let gateway = CapabilityGateway::new(900);
        let decision = gateway
            .check_tool_permission(
                AgentKind::Search,
                "delete_file",
                "alice",
                "conv-1",
                None,
                &serde_json::json!({}),
            )
            .await;
        assert!(matches!(decision, PermissionDecision::Blocked { .. }));
    }

    #[tokio::test]
    async fn approval_lifecycle_approve_then_consume_once() {
        let gateway = CapabilityGateway::new(900);
        let request = pending_request(&gateway).await;

        assert_eq!(gateway.pending_approvals("alice").await.len(), 1);
        assert_eq!(
            gateway.resolve_approval(&request.id, "alice", true).await,
            ApprovalResolution::Approved
        );

        let consumed = gateway.consume_approval(&request.id).await.unwrap();
        assert_eq!(consumed.tool_name, "delete_file");

        // 单次使用：再取拿不到，重试解析报 NotFound
        assert!(gateway.consume_approval(&request.id).await.is_none());
        assert_eq!(
            gateway.resolve_approval(&request.id, "alice", true).await,
            ApprovalResolution::NotFound
        );
    }

    #[tokio::test]
    async fn wrong_owner_and_unknown_ids_read_as_not_found() {
        let gateway = CapabilityGateway::new(900);
        let request = pending_request(&gateway).await;

        assert_eq!(
            gateway.resolve_approval(&request.id, "mallory", true).await,
            ApprovalResolution::NotFound
        );
        assert_eq!(
            gateway.resolve_approval("nonexistent", "alice", true).await,
            ApprovalResolution::NotFound
        );
        // 没有副作用：原请求仍然 pending
        assert_eq!(gateway.pending_approvals("alice").await.len(), 1);
    }

    #[tokio::test]
    async fn stale_requests_expire_lazily_without_executing() {
        let gateway = CapabilityGateway::new(0);
        let request = pending_request(&gateway).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        assert_eq!(
            gateway.resolve_approval(&request.id, "alice", true).await,
            ApprovalResolution::Expired
        );
        assert!(gateway.pending_approvals("alice").await.is_empty());
    }

    #[tokio::test]
    async fn pending_requests_cannot_be_consumed() {
        let gateway = CapabilityGateway::new(900);
        let request = pending_request(&gateway).await;
        assert!(gateway.consume_approval(&request.id).await.is_none());
        assert_eq!(gateway.pending_approvals("alice").await.len(), 1);
    }
}
