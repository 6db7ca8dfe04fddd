//! 上下文组装与压缩
//!
//! 每次 LLM 调用前由 MemoryManager 组装有界消息序列：
//! [system, 摘要上下文, 最近消息滑动窗口, 计划框架]。
//! 超出预算时先收缩较旧的工具结果（保留前缀 + 压缩标记），仍超则从最旧的
//! 非 system 消息开始丢弃；先收缩后丢弃比直接截断更能保住对话连续性。
//! 所有操作都在工作副本上进行，持久化的历史不被改写。

use crate::config::MemorySection;
use crate::memory::{Message, Role, Summary};
use crate::plan::{TaskPlan, TaskPlanTracker};

/// 收缩旧工具结果时保留的前缀字符数
const SHRINK_KEEP_CHARS: usize = 200;
/// 摘要中每条消息的摘录字符数
const SUMMARY_EXCERPT_CHARS: usize = 80;

/// 一轮对话的工作记忆视图（对持久化历史只读）
#[derive(Clone, Debug)]
pub struct MemoryState {
    pub summaries: Vec<Summary>,
    /// 未被摘要覆盖的消息（摘要覆盖区间之后的后缀）
    pub messages: Vec<Message>,
    pub active_plan: Option<TaskPlan>,
}

/// 上下文大小控制器
#[derive(Clone, Debug)]
pub struct MemoryManager {
    max_context_tokens: usize,
    chars_per_token: usize,
    recent_window: usize,
}

impl MemoryManager {
    pub fn new(section: &MemorySection) -> Self {
        Self {
            max_context_tokens: section.max_context_tokens,
            chars_per_token: section.chars_per_token.max(1),
            recent_window: section.recent_window.max(1),
        }
    }

    /// 从完整历史 + 既有摘要 + 活动计划构建工作记忆视图，不改写持久化历史
    pub fn build_memory_state(
        &self,
        messages: &[Message],
        summaries: &[Summary],
        active_plan: Option<&TaskPlan>,
    ) -> MemoryState {
        let covered = summaries.iter().map(|s| s.covered_to).max().unwrap_or(0);
        let visible = messages.get(covered.min(messages.len())..).unwrap_or(&[]);
        MemoryState {
            summaries: summaries.to_vec(),
            messages: visible.to_vec(),
            active_plan: active_plan.cloned(),
        }
    }

    /// 组装下发给 LLM 的消息序列：system + 摘要 + 最近消息 + 计划框架
    pub fn assemble_llm_messages(
        &self,
        system_prompt: &str,
        state: &MemoryState,
    ) -> Vec<Message> {
        let mut assembled = vec![Message::system(system_prompt)];

        if !state.summaries.is_empty() {
            let digest = state
                .summaries
                .iter()
                .map(|s| s.content.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            assembled.push(Message::system(format!(
                "Earlier conversation (summarized):\n{digest}"
            )));
        }

        assembled.extend(state.messages.iter().cloned());

        if let Some(plan) = &state.active_plan {
            assembled.push(Message::system(format!(
                "Active task plan:\n{}",
                TaskPlanTracker::format_plan_for_user(plan)
            )));
        }

        assembled
    }

    /// 估算 token 总量（固定字符数/token 比值）
    pub fn estimate_tokens(&self, messages: &[Message]) -> usize {
        let chars: usize = messages
            .iter()
            .map(|m| m.content_chars() + m.tool_calls.iter().map(|c| c.arguments.to_string().len()).sum::<usize>())
            .sum();
        chars / self.chars_per_token
    }

    /// 超预算时两阶段压缩；预算内为 no-op（幂等）
    pub fn compress_if_needed(&self, mut messages: Vec<Message>) -> Vec<Message> {
        if self.estimate_tokens(&messages) <= self.max_context_tokens {
            return messages;
        }

        // 阶段一：从最旧开始收缩最近 K 条之外的工具结果，降到预算内即停
        let protected_from = messages.len().saturating_sub(self.recent_window);
        for idx in 0..protected_from {
            if self.estimate_tokens(&messages) <= self.max_context_tokens {
                return messages;
            }
            let message = &mut messages[idx];
            if message.role != Role::Tool {
                continue;
            }
            let original_chars = message.content_chars();
            if original_chars <= SHRINK_KEEP_CHARS {
                continue;
            }
            let prefix: String = message
                .content
                .as_deref()
                .unwrap_or_default()
                .chars()
                .take(SHRINK_KEEP_CHARS)
                .collect();
            message.content = Some(format!(
                "{prefix} [compressed, original {original_chars} chars]"
            ));
        }
        if self.estimate_tokens(&messages) <= self.max_context_tokens {
            return messages;
        }

        // 阶段二：丢弃最旧的非 system 消息，但总量不低于 K+1 条
        while self.estimate_tokens(&messages) > self.max_context_tokens
            && messages.len() > self.recent_window + 1
        {
            let protected_from = messages.len().saturating_sub(self.recent_window);
            let Some(idx) = messages[..protected_from]
                .iter()
                .position(|m| m.role != Role::System)
            else {
                break;
            };
            tracing::debug!(dropped_role = ?messages[idx].role, "context over budget, dropping oldest message");
            messages.remove(idx);
        }

        messages
    }

    /// 滑动窗口推出旧消息且无摘要覆盖时，折叠为一条确定性的摘录式摘要。
    /// 返回 None 表示尚无需要折叠的内容。
    pub fn fold_overflow(&self, messages: &[Message], summaries: &[Summary]) -> Option<Summary> {
        let covered = summaries.iter().map(|s| s.covered_to).max().unwrap_or(0);
        let visible = messages.len().saturating_sub(covered);
        if visible <= self.recent_window * 2 {
            return None;
        }

        let fold_to = messages.len() - self.recent_window;
        let lines: Vec<String> = messages[covered..fold_to]
            .iter()
            .filter(|m| m.role != Role::Tool)
            .map(|m| {
                let role = match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                    Role::System => "system",
                };
                let excerpt: String = m
                    .content
                    .as_deref()
                    .unwrap_or("(tool calls)")
                    .chars()
                    .take(SUMMARY_EXCERPT_CHARS)
                    .collect();
                format!("- {role}: {excerpt}")
            })
            .collect();

        Some(Summary {
            content: format!("Messages {covered}..{fold_to}:\n{}", lines.join("\n")),
            covered_from: covered,
            covered_to: fold_to,
            created_at: chrono::Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemorySection;

    fn manager(max_tokens: usize, window: usize) -> MemoryManager {
        MemoryManager::new(&MemorySection {
            max_context_tokens: max_tokens,
            chars_per_token: 4,
            recent_window: window,
        })
    }

    fn long_tool_message(chars: usize) -> Message {
        Message::tool("call-1", "x".repeat(chars))
    }

    #[test]
    fn under_budget_is_untouched() {
        let m = manager(1_000, 3);
        let messages = vec![Message::system("prompt"), Message::user("hi")];
        let out = m.compress_if_needed(messages.clone());
        assert_eq!(out.len(), messages.len());
        assert_eq!(out[1].content, messages[1].content);
    }

    #[test]
    fn shrinks_old_tool_results_before_dropping() {
        let m = manager(300, 2);
        let messages = vec![
            Message::system("prompt"),
            long_tool_message(4_000),
            Message::user("recent question"),
            Message::assistant("recent answer"),
        ];
        let out = m.compress_if_needed(messages);
        assert_eq!(out.len(), 4);
        let shrunk = out[1].content.as_deref().unwrap();
        assert!(shrunk.contains("[compressed, original 4000 chars]"));
    }

    #[test]
    fn shrinking_stops_once_under_budget() {
        let m = manager(1_100, 2);
        let messages = vec![
            Message::system("prompt"),
            long_tool_message(4_000),
            long_tool_message(4_000),
            Message::user("recent question"),
            Message::assistant("recent answer"),
        ];
        let out = m.compress_if_needed(messages);
        // 收缩第一条后已在预算内，第二条保持原样
        assert!(out[1].content.as_deref().unwrap().contains("[compressed"));
        assert_eq!(out[2].content.as_deref().unwrap().chars().count(), 4_000);
    }

    #[test]
    fn drops_oldest_non_system_when_still_over() {
        let m = manager(50, 2);
        let mut messages = vec![Message::system("prompt")];
        for i in 0..10 {
            messages.push(Message::user(format!("message number {i} with some padding text")));
        }
        let out = m.compress_if_needed(messages);
        assert!(out.len() >= 3); // system + K 条窗口
        assert_eq!(out[0].role, Role::System);
    }

    #[test]
    fn compression_is_idempotent_once_under_budget() {
        let m = manager(300, 2);
        let messages = vec![
            Message::system("prompt"),
            long_tool_message(4_000),
            Message::user("q"),
            Message::assistant("a"),
        ];
        let once = m.compress_if_needed(messages);
        let twice = m.compress_if_needed(once.clone());
        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!(a.content, b.content);
        }
    }

    #[test]
    fn assembles_in_fixed_order() {
        let m = manager(1_000, 3);
        let summaries = vec![Summary {
            content: "earlier stuff".into(),
            covered_from: 0,
            covered_to: 2,
            created_at: chrono::Utc::now(),
        }];
        let messages = vec![
            Message::user("old 1"),
            Message::assistant("old 2"),
            Message::user("latest"),
        ];
        let state = m.build_memory_state(&messages, &summaries, None);
        assert_eq!(state.messages.len(), 1); // 摘要覆盖前两条

        let assembled = m.assemble_llm_messages("sys", &state);
        assert_eq!(assembled[0].role, Role::System);
        assert!(assembled[1].content.as_deref().unwrap().contains("earlier stuff"));
        assert_eq!(assembled[2].content.as_deref(), Some("latest"));
    }

    #[test]
    fn folds_overflow_into_summary() {
        let m = manager(1_000, 2);
        let mut messages = Vec::new();
        for i in 0..8 {
            messages.push(Message::user(format!("turn {i}")));
        }
        let summary = m.fold_overflow(&messages, &[]).unwrap();
        assert_eq!(summary.covered_from, 0);
        assert_eq!(summary.covered_to, 6);
        assert!(summary.content.contains("turn 0"));

        // 已覆盖后不再重复折叠
        assert!(m.fold_overflow(&messages, &[summary]).is_none());
    }
}
