//! 用户通知
//!
//! 审批挂起、审批解析与计划完成都会产生一次通知。通知是尽力而为的旁路：
//! 发送失败只记日志，绝不让对话轮次失败。默认实现只写结构化日志，
//! 真实推送渠道由调用方实现 Notifier 注入。

use async_trait::async_trait;

use crate::gateway::ApprovalRequest;

/// 通知事件
#[derive(Clone, Debug)]
pub enum NotificationEvent<'a> {
    /// 有操作被挂起等待审批
    ApprovalRequired { request: &'a ApprovalRequest },
    /// 审批已解析；executed 表示被批准且已执行
    ApprovalResolved {
        request: &'a ApprovalRequest,
        executed: bool,
    },
    /// 多步计划走到终态
    PlanFinished { goal: &'a str, summary: &'a str },
}

/// 通知接口（外部协作者）
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: &str, event: NotificationEvent<'_>) -> Result<(), String>;
}

/// 默认实现：结构化日志即通知
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, user_id: &str, event: NotificationEvent<'_>) -> Result<(), String> {
        match event {
            NotificationEvent::ApprovalRequired { request } => {
                tracing::info!(
                    user = user_id,
                    approval_id = %request.id,
                    tool = %request.tool_name,
                    "approval required"
                );
            }
            NotificationEvent::ApprovalResolved { request, executed } => {
                tracing::info!(
                    user = user_id,
                    approval_id = %request.id,
                    tool = %request.tool_name,
                    executed,
                    "approval resolved"
                );
            }
            NotificationEvent::PlanFinished { goal, summary } => {
                tracing::info!(user = user_id, goal, summary, "plan finished");
            }
        }
        Ok(())
    }
}
