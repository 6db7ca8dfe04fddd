//! 任务规划器
//!
//! should_plan_task 先走启发式：过短或模板化的单动作消息直接判否，多步文本模式
//! 命中足够多直接判是，其余交给 LLM 复杂度分类（后端失败保守判否）。
//! generate_task_plan 让 LLM 分解为至多 max_steps 个原子步骤；解析失败或零步骤
//! 一律丢弃返回 None，绝不产出半成品计划。

use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;

use crate::config::PlannerSection;
use crate::llm::{extract_json_block, LlmClient};
use crate::memory::Message;
use crate::plan::{TaskPlan, TaskStep};
use crate::router::AgentKind;

/// 任务规划器
pub struct TaskPlanner {
    llm: Arc<dyn LlmClient>,
    min_message_chars: usize,
    min_pattern_hits: usize,
    max_steps: usize,
    /// 单动作模板：明确的单步请求开头
    single_action: Regex,
    /// 多步信号模式：顺序连接词、批量量词、条件句式、序数词、逗号接动词
    multi_step: Vec<Regex>,
}

impl TaskPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, section: &PlannerSection) -> Self {
        let compile = |p: &str| Regex::new(p).expect("invalid planner pattern");
        Self {
            llm,
            min_message_chars: section.min_message_chars,
            min_pattern_hits: section.min_pattern_hits.max(1),
            max_steps: section.max_steps.clamp(1, 8),
            single_action: compile(r"(?i)^(list|show|open|display|what|who|when|how many)\b"),
            multi_step: vec![
                compile(r"(?i)\b(then|after that|afterwards|finally|next,)\b"),
                compile(r"(?i)\b(all|every|each)\b.*\b(files?|documents?|folders?|pdfs?|images?)\b"),
                compile(r"(?i)\bif\b.*\b(then|otherwise|else)\b"),
                compile(r"(?i)\b(first|second(ly)?|third|step\s+\d)\b"),
                compile(r"(?i),\s*(read|translate|summari[sz]e|move|copy|delete|share|rename|upload)\b"),
            ],
        }
    }

    /// 这条消息需要分解成多步计划吗？
    pub async fn should_plan_task(&self, message: &str, context: Option<&str>) -> bool {
        let trimmed = message.trim();

        let hits = self
            .multi_step
            .iter()
            .filter(|re| re.is_match(trimmed))
            .count();

        // 快速判否：过短或模板化单动作
        if trimmed.chars().count() < self.min_message_chars {
            return false;
        }
        if self.single_action.is_match(trimmed) && hits == 0 {
            return false;
        }

        // 快速判是：多步信号足够多
        if hits >= self.min_pattern_hits {
            return true;
        }

        // 其余交给 LLM；失败保守判否
        self.llm_complexity(trimmed, context).await.unwrap_or(false)
    }

    async fn llm_complexity(&self, message: &str, context: Option<&str>) -> Result<bool, String> {
        let context_line = context.map(|c| format!("Context: {c}\n")).unwrap_or_default();
        let prompt = format!(
            "Does this cloud-drive assistant request require multiple distinct steps \
             (different operations or different specialists) to fulfill?\n\
             {context_line}Request: {message}\n\
             Answer with exactly YES or NO."
        );
        let outcome = self.llm.chat(&[Message::system(prompt)], &[]).await?;
        let reply = outcome.content.unwrap_or_default().to_uppercase();
        Ok(reply.contains("YES"))
    }

    /// 分解为有序步骤计划；解析失败或零步骤返回 None
    pub async fn generate_task_plan(
        &self,
        message: &str,
        context: Option<&str>,
    ) -> Option<TaskPlan> {
        let context_line = context.map(|c| format!("Context: {c}\n")).unwrap_or_default();
        let prompt = format!(
            "Decompose this cloud-drive assistant request into at most {} atomic, ordered steps.\n\
             Each step is handled by one agent: drive (file/folder operations, sharing), \
             document (reading, summarizing, translating, editing), search (finding files).\n\
             {context_line}Request: {message}\n\
             Respond with JSON only:\n\
             {{\"goal\": \"...\", \"steps\": [{{\"title\": \"...\", \"description\": \"...\", \"agent\": \"drive|document|search\"}}]}}",
            self.max_steps
        );

        let outcome = match self.llm.chat(&[Message::system(prompt)], &[]).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::warn!(%error, "plan generation failed, continuing without a plan");
                return None;
            }
        };

        let content = outcome.content.unwrap_or_default();
        let block = extract_json_block(&content)?;
        let parsed: GeneratedPlan = match serde_json::from_str(&block) {
            Ok(parsed) => parsed,
            Err(error) => {
                tracing::warn!(%error, "plan JSON unparseable, discarding");
                return None;
            }
        };
        if parsed.steps.is_empty() {
            return None;
        }

        let steps = parsed
            .steps
            .into_iter()
            .take(self.max_steps)
            .enumerate()
            .map(|(i, s)| {
                let mut step = TaskStep::new(i as u32 + 1, s.title, s.description);
                step.agent = s.agent.as_deref().and_then(AgentKind::parse);
                step
            })
            .collect();

        let goal = if parsed.goal.is_empty() {
            message.to_string()
        } else {
            parsed.goal
        };
        Some(TaskPlan::new(goal, steps))
    }
}

#[derive(Deserialize)]
struct GeneratedPlan {
    #[serde(default)]
    goal: String,
    #[serde(default)]
    steps: Vec<GeneratedStep>,
}

#[derive(Deserialize)]
struct GeneratedStep {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    agent: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlannerSection;
    use crate::llm::MockLlmClient;

    fn planner(llm: Arc<MockLlmClient>) -> TaskPlanner {
        TaskPlanner::new(llm, &PlannerSection::default())
    }

    #[tokio::test]
    async fn short_single_action_is_rejected_fast() {
        let llm = Arc::new(MockLlmClient::new());
        // 不预置脚本：走到 LLM 会回显非 YES，走不到则更好
        let p = planner(llm);
        assert!(!p.should_plan_task("list my files", None).await);
        assert!(!p.should_plan_task("show me the shared folder contents", None).await);
    }

    #[tokio::test]
    async fn sequencing_language_is_accepted_fast() {
        let llm = Arc::new(MockLlmClient::new());
        let p = planner(llm);
        assert!(
            p.should_plan_task(
                "find the budget spreadsheet, read it, then translate the summary to French",
                None
            )
            .await
        );
    }

    #[tokio::test]
    async fn llm_failure_defaults_to_no_plan() {
        let llm = Arc::new(MockLlmClient::new());
        llm.script_error("backend down");
        let p = planner(llm);
        assert!(!p.should_plan_task("reorganize my workspace somehow please", None).await);
    }

    #[tokio::test]
    async fn generates_dense_ids_from_one() {
        let llm = Arc::new(MockLlmClient::new());
        llm.script_text(
            r#"{"goal": "translate the budget summary",
                "steps": [
                  {"title": "find spreadsheet", "description": "locate the budget spreadsheet", "agent": "search"},
                  {"title": "read it", "description": "extract the summary", "agent": "document"},
                  {"title": "translate", "description": "translate the summary to French", "agent": "document"}
                ]}"#,
        );
        let p = planner(llm);
        let plan = p.generate_task_plan("find, read, translate", None).await.unwrap();
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[0].id, 1);
        assert_eq!(plan.steps[2].id, 3);
        assert_eq!(plan.current_step, 1);
        assert!(!plan.is_complete);
        assert_eq!(plan.steps[0].agent, Some(AgentKind::Search));
        assert!(plan.distinct_agents() >= 2);
    }

    #[tokio::test]
    async fn unparseable_or_empty_plans_are_discarded() {
        let llm = Arc::new(MockLlmClient::new());
        llm.script_text("I would rather chat about the weather.");
        let p = planner(llm.clone());
        assert!(p.generate_task_plan("do things", None).await.is_none());

        llm.script_text(r#"{"goal": "nothing", "steps": []}"#);
        assert!(p.generate_task_plan("do things", None).await.is_none());
    }
}
