//! Agent 路由
//!
//! 决定本轮对话由哪类专用 agent 接手。优先级：显式指定 > 文本模式打分 >
//! 会话粘性（无进行中计划时）> LLM 分类 > 兜底默认。模式得分足够强时允许
//! 覆盖粘性，用户可以在对话中途改道。路由对调用方永不抛错：后端失败沿
//! 降级链落到模式得分或默认类型。

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::llm::{extract_json_block, LlmClient};
use crate::memory::Message;

/// 专用 agent 类型：文件操作 / 文档处理 / 检索
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Drive,
    Document,
    Search,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Drive => "drive",
            AgentKind::Document => "document",
            AgentKind::Search => "search",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "drive" => Some(AgentKind::Drive),
            "document" => Some(AgentKind::Document),
            "search" => Some(AgentKind::Search),
            _ => None,
        }
    }

    pub fn all() -> [AgentKind; 3] {
        [AgentKind::Drive, AgentKind::Document, AgentKind::Search]
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 路由结论的来源
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteSource {
    Explicit,
    Pattern,
    Conversation,
    Llm,
    Default,
}

/// 一次路由决定
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouteDecision {
    pub kind: AgentKind,
    /// [0, 1]
    pub confidence: f64,
    pub source: RouteSource,
    pub reason: String,
}

/// 每类 agent 一组加权文本模式。这是针对特定说法调的启发式数据，
/// 可整组替换而不是改控制流。
pub struct RoutePatterns {
    sets: Vec<(AgentKind, Vec<(Regex, f64)>)>,
}

impl Default for RoutePatterns {
    fn default() -> Self {
        let compile = |patterns: &[(&str, f64)]| -> Vec<(Regex, f64)> {
            patterns
                .iter()
                .map(|(p, w)| (Regex::new(p).expect("invalid route pattern"), *w))
                .collect()
        };

        Self {
            sets: vec![
                (
                    AgentKind::Drive,
                    compile(&[
                        (r"(?i)\b(move|copy|rename|upload|delete|trash|restore)\b", 3.0),
                        (r"(?i)\blist\s+(my\s+)?(files|folders)\b", 3.0),
                        (r"(?i)\b(share|unshare|permissions?|access)\b", 2.5),
                        (r"(?i)\b(folders?|files?|archive|storage)\b", 2.0),
                        (r"(?i)\b(organi[sz]e|clean\s+up|tidy)\b", 2.0),
                    ]),
                ),
                (
                    AgentKind::Document,
                    compile(&[
                        (r"(?i)\b(summari[sz]e|summary|translate|translation)\b", 3.0),
                        (r"(?i)\b(rewrite|draft|proofread|edit\s+the)\b", 2.5),
                        (r"(?i)\b(documents?|docs?|notes?|report|spreadsheet)\b", 1.5),
                        (r"(?i)\b(extract|convert)\b", 1.5),
                    ]),
                ),
                (
                    AgentKind::Search,
                    compile(&[
                        (r"(?i)\b(find|search|look\s+for|locate)\b", 3.0),
                        (r"(?i)\bwhere\s+(is|are)\b", 3.0),
                        (r"(?i)\b(named|called|containing|matching)\b", 1.5),
                        (r"(?i)\b(recent|latest|modified|last\s+week)\b", 1.5),
                    ]),
                ),
            ],
        }
    }
}

impl RoutePatterns {
    /// 每类 agent 的模式得分（匹配到的权重求和）
    fn scores(&self, message: &str) -> Vec<(AgentKind, f64)> {
        self.sets
            .iter()
            .map(|(kind, patterns)| {
                let score = patterns
                    .iter()
                    .filter(|(re, _)| re.is_match(message))
                    .map(|(_, w)| w)
                    .sum();
                (*kind, score)
            })
            .collect()
    }
}

/// Agent 路由器
pub struct AgentRouter {
    llm: Arc<dyn LlmClient>,
    patterns: RoutePatterns,
    /// 模式得分置信度达到该阈值才直接采纳
    pattern_threshold: f64,
    default_kind: AgentKind,
}

impl AgentRouter {
    pub fn new(llm: Arc<dyn LlmClient>, pattern_threshold: f64, default_kind: AgentKind) -> Self {
        Self {
            llm,
            patterns: RoutePatterns::default(),
            pattern_threshold,
            default_kind,
        }
    }

    pub fn with_patterns(mut self, patterns: RoutePatterns) -> Self {
        self.patterns = patterns;
        self
    }

    /// 路由一轮对话；永不向调用方返回错误
    pub async fn route(
        &self,
        message: &str,
        hint: Option<AgentKind>,
        sticky: Option<AgentKind>,
        context: Option<&str>,
    ) -> RouteDecision {
        // 1. 调用方显式指定永远优先
        if let Some(kind) = hint {
            return RouteDecision {
                kind,
                confidence: 1.0,
                source: RouteSource::Explicit,
                reason: "explicit agent hint from caller".to_string(),
            };
        }

        // 2. 模式打分：强文本信号可覆盖粘性，用户能在对话中途改道
        let (best_kind, top, confidence) = self.pattern_confidence(message);
        if top > 0.0 && confidence >= self.pattern_threshold {
            return RouteDecision {
                kind: best_kind,
                confidence,
                source: RouteSource::Pattern,
                reason: format!("pattern score {top:.1}"),
            };
        }

        // 3. 会话粘性（调用方保证仅在计划缺失或已完成时传入）
        if let Some(kind) = sticky {
            return RouteDecision {
                kind,
                confidence: 0.9,
                source: RouteSource::Conversation,
                reason: "continuing with the conversation's agent".to_string(),
            };
        }

        // 4. LLM 分类；失败沿降级链落回模式得分或默认
        match self.llm_classify(message, context).await {
            Ok(decision) => decision,
            Err(error) => {
                tracing::warn!(%error, "route classifier failed, degrading");
                if top > 0.0 {
                    RouteDecision {
                        kind: best_kind,
                        confidence: (confidence * 0.5).max(0.1),
                        source: RouteSource::Pattern,
                        reason: "classifier unavailable, best pattern score".to_string(),
                    }
                } else {
                    RouteDecision {
                        kind: self.default_kind,
                        confidence: 0.2,
                        source: RouteSource::Default,
                        reason: "no signal, hard default".to_string(),
                    }
                }
            }
        }
    }

    /// 最优类型、其得分与置信度。置信度：最高分为 0 时取 0；
    /// 第二名也非零时取 (top-second)/(top+second)；否则取 min(top/3, 1)。
    fn pattern_confidence(&self, message: &str) -> (AgentKind, f64, f64) {
        let mut scores = self.patterns.scores(message);
        scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        // 空模式表（with_patterns 可整组替换）退化为无信号
        let Some(&(best_kind, top)) = scores.first() else {
            return (self.default_kind, 0.0, 0.0);
        };
        let second = scores.get(1).map(|(_, s)| *s).unwrap_or(0.0);

        let confidence = if top == 0.0 {
            0.0
        } else if second > 0.0 {
            (top - second) / (top + second)
        } else {
            (top / 3.0).min(1.0)
        };
        (best_kind, top, confidence)
    }

    async fn llm_classify(
        &self,
        message: &str,
        context: Option<&str>,
    ) -> Result<RouteDecision, String> {
        let context_line = context
            .map(|c| format!("Context: {c}\n"))
            .unwrap_or_default();
        let prompt = format!(
            "Classify this cloud-drive assistant request into exactly one agent type.\n\
             Types: drive (file/folder operations, sharing), document (reading, summarizing, \
             translating, editing documents), search (finding files or content).\n\
             {context_line}Request: {message}\n\
             Respond with JSON only: {{\"type\": \"...\", \"confidence\": 0.0, \"reason\": \"...\"}}"
        );

        let outcome = self
            .llm
            .chat(&[Message::system(prompt)], &[])
            .await?;
        let content = outcome.content.unwrap_or_default();
        let block = extract_json_block(&content).ok_or("no JSON in classifier output")?;
        let parsed: ClassifierReply =
            serde_json::from_str(&block).map_err(|e| e.to_string())?;

        // 超出集合的类型一律拒绝
        let kind = AgentKind::parse(&parsed.kind)
            .ok_or_else(|| format!("classifier returned unknown type: {}", parsed.kind))?;

        Ok(RouteDecision {
            kind,
            confidence: parsed.confidence.clamp(0.0, 1.0),
            source: RouteSource::Llm,
            reason: parsed.reason,
        })
    }
}

#[derive(Deserialize)]
struct ClassifierReply {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reason: String,
}
