//! 任务规划：计划/步骤状态机与 LLM 任务分解

mod planner;
mod tracker;

pub use planner::TaskPlanner;
pub use tracker::{StepStatus, TaskPlan, TaskPlanTracker, TaskStep};
