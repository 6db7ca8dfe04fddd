//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `NIMBUS__*` 覆盖（双下划线表示嵌套，如 `NIMBUS__LLM__MODEL=gpt-4o`）。
//! 路由/规划使用的文本模式是针对特定说法调的启发式，阈值等旋钮放在配置里而不是写死在控制流中。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub router: RouterSection,
    pub planner: PlannerSection,
    pub agent: AgentSection,
    pub memory: MemorySection,
    pub approval: ApprovalSection,
}

/// [app] 段：应用名与默认 agent 类型
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 兜底 agent 类型（路由全链路失败时使用）：drive / document / search
    pub default_agent: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            default_agent: "drive".to_string(),
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub model: String,
    pub base_url: Option<String>,
    /// 单次请求超时（秒），由调用侧施加
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            request_timeout_secs: 60,
        }
    }
}

/// [router] 段：模式路由阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    /// 模式得分置信度达到该值才直接采纳（否则走会话粘性 / LLM 分类）
    pub pattern_threshold: f64,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            pattern_threshold: 0.25,
        }
    }
}

/// [planner] 段：是否规划的启发式旋钮
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    /// 低于该长度的消息直接判定为单步请求
    pub min_message_chars: usize,
    /// 多步文本模式命中数达到该值即判定需要规划（不再询问 LLM）
    pub min_pattern_hits: usize,
    /// 计划步数上限
    pub max_steps: usize,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            min_message_chars: 20,
            min_pattern_hits: 2,
            max_steps: 8,
        }
    }
}

/// [agent] 段：工具调用循环
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// 单轮最多 LLM 调用次数，防止死循环
    pub max_iterations: usize,
    /// 单条工具结果字符上限，超出部分截断并标注原始长度
    pub tool_result_cap_chars: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            tool_result_cap_chars: 20_000,
        }
    }
}

/// [memory] 段：上下文预算与压缩
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// 上下文 token 硬上限，超出触发压缩
    pub max_context_tokens: usize,
    /// token 估算用的字符数/token 比值
    pub chars_per_token: usize,
    /// 滑动窗口：最近 K 条消息不参与收缩与丢弃
    pub recent_window: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            max_context_tokens: 6_000,
            chars_per_token: 4,
            recent_window: 6,
        }
    }
}

/// [approval] 段：审批有效期
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApprovalSection {
    /// 待审批请求的有效期（秒），到期后在解析时惰性判定为 expired
    pub ttl_secs: u64,
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self { ttl_secs: 900 }
    }
}

/// 从 config 目录加载配置，环境变量 NIMBUS__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 NIMBUS__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("NIMBUS")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
