//! 计划与步骤状态机
//!
//! 步骤状态单调推进：pending → in-progress → 终态（completed / failed / skipped），
//! 永不回退；任意时刻至多一个步骤 in-progress。失败不中止计划，与完成一样
//! 推进到下一个 pending 步骤：多步任务容忍局部失败并如实呈现。
//! 所有转移函数都是纯函数，返回新的计划值。

use serde::{Deserialize, Serialize};

use crate::router::AgentKind;

/// 步骤状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// 计划中的一个原子步骤
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskStep {
    /// 从 1 起的稠密 id
    pub id: u32,
    pub title: String,
    pub description: String,
    pub status: StepStatus,
    /// 指定执行的 agent 类型，缺省回落到本轮的基础类型
    pub agent: Option<AgentKind>,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl TaskStep {
    pub fn new(id: u32, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            description: description.into(),
            status: StepStatus::Pending,
            agent: None,
            result: None,
            error: None,
        }
    }
}

/// 一次复杂请求的有序分解
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskPlan {
    pub goal: String,
    pub steps: Vec<TaskStep>,
    /// 指向第一个非终态步骤；计划完成后为陈旧值
    pub current_step: u32,
    pub is_complete: bool,
    pub closing_summary: Option<String>,
}

impl TaskPlan {
    pub fn new(goal: impl Into<String>, steps: Vec<TaskStep>) -> Self {
        Self {
            goal: goal.into(),
            steps,
            current_step: 1,
            is_complete: false,
            closing_summary: None,
        }
    }

    pub fn current(&self) -> Option<&TaskStep> {
        self.steps.iter().find(|s| s.id == self.current_step)
    }

    /// 计划涉及的不同 agent 类型数
    pub fn distinct_agents(&self) -> usize {
        let mut kinds: Vec<AgentKind> = self.steps.iter().filter_map(|s| s.agent).collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds.dedup();
        kinds.len()
    }
}

/// 纯转移函数集合
pub struct TaskPlanTracker;

impl TaskPlanTracker {
    /// 将当前步骤标记为 in-progress；当前步骤已是终态或不存在时原样返回
    pub fn start_current_step(plan: &TaskPlan) -> TaskPlan {
        let mut plan = plan.clone();
        if let Some(step) = plan.steps.iter_mut().find(|s| s.id == plan.current_step) {
            if step.status == StepStatus::Pending {
                step.status = StepStatus::InProgress;
            }
        }
        plan
    }

    /// 步骤被审批挂起时回退为 pending，恢复执行时重跑本步
    pub fn pause_current_step(plan: &TaskPlan) -> TaskPlan {
        let mut plan = plan.clone();
        if let Some(step) = plan.steps.iter_mut().find(|s| s.id == plan.current_step) {
            if step.status == StepStatus::InProgress {
                step.status = StepStatus::Pending;
            }
        }
        plan
    }

    pub fn complete_current_step(plan: &TaskPlan, result: &str) -> TaskPlan {
        Self::finish(plan, StepStatus::Completed, Some(result), None)
    }

    pub fn fail_current_step(plan: &TaskPlan, error: &str) -> TaskPlan {
        Self::finish(plan, StepStatus::Failed, None, Some(error))
    }

    pub fn skip_current_step(plan: &TaskPlan, reason: &str) -> TaskPlan {
        Self::finish(plan, StepStatus::Skipped, Some(reason), None)
    }

    /// 终结当前步骤并把 current_step 推进到下一个 pending；没有剩余则标记完成
    fn finish(
        plan: &TaskPlan,
        status: StepStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> TaskPlan {
        let mut plan = plan.clone();
        let Some(step) = plan.steps.iter_mut().find(|s| s.id == plan.current_step) else {
            return plan;
        };
        // 终态不再改写
        if step.status.is_terminal() {
            return plan;
        }
        step.status = status;
        step.result = result.map(String::from);
        step.error = error.map(String::from);

        match plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| s.id)
            .min()
        {
            Some(next) => plan.current_step = next,
            None => {
                plan.is_complete = true;
                plan.closing_summary = Some(Self::progress_summary(&plan));
            }
        }
        plan
    }

    /// 进度摘要，如 "2/4 steps completed, 1 failed"
    pub fn progress_summary(plan: &TaskPlan) -> String {
        let total = plan.steps.len();
        let completed = plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        let failed = plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .count();
        let skipped = plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Skipped)
            .count();

        let mut summary = format!("{completed}/{total} steps completed");
        if failed > 0 {
            summary.push_str(&format!(", {failed} failed"));
        }
        if skipped > 0 {
            summary.push_str(&format!(", {skipped} skipped"));
        }
        summary
    }

    /// 面向用户的计划渲染；失败步骤内联错误
    pub fn format_plan_for_user(plan: &TaskPlan) -> String {
        let mut lines = vec![format!("Goal: {}", plan.goal)];
        for step in &plan.steps {
            let marker = match step.status {
                StepStatus::Pending => "○",
                StepStatus::InProgress => "→",
                StepStatus::Completed => "✓",
                StepStatus::Failed => "✗",
                StepStatus::Skipped => "⊘",
            };
            let mut line = format!("{marker} {}. {}", step.id, step.title);
            if let Some(error) = &step.error {
                line.push_str(&format!(" ({error})"));
            }
            lines.push(line);
        }
        lines.push(Self::progress_summary(plan));
        lines.join("\n")
    }
}
