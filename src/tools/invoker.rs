//! 工具调用接口与操作注册表缓存
//!
//! 后端操作（文件/文件夹 CRUD、分享、检索等）通过 ToolInvoker 以统一形式暴露：
//! list_tools 返回带 JSON Schema 的操作清单，call_tool 执行并返回文本内容。
//! 身份参数对模型永远不可见：schema 下发前剥除，调用前自动注入。
//! 每次调用输出一条结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

/// 由调用方自动注入、从不由模型提供的身份参数名
pub const IDENTITY_ARG: &str = "user_id";

/// 一个可调用操作的声明：名称、描述（供 LLM 理解）、参数 JSON Schema
#[derive(Clone, Debug)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

/// 工具调用结果：文本内容段 + 错误标记
#[derive(Clone, Debug)]
pub struct ToolOutput {
    pub content: Vec<String>,
    pub is_error: bool,
}

impl ToolOutput {
    /// 拼接全部内容段
    pub fn text(&self) -> String {
        self.content.join("\n")
    }
}

/// 工具调用接口（外部协作者）：失败以 Err(String) 表达，由调用侧软化为工具结果
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, String>;

    async fn call_tool(&self, name: &str, args: Value) -> Result<ToolOutput, String>;
}

/// 操作注册表缓存：进程内持有一份 list_tools 结果，显式 invalidate 而非隐式全局状态
pub struct RegistryCache {
    invoker: Arc<dyn ToolInvoker>,
    cached: Mutex<Option<Vec<ToolDefinition>>>,
}

impl RegistryCache {
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self {
            invoker,
            cached: Mutex::new(None),
        }
    }

    /// 返回缓存的操作清单，首次访问时向 invoker 拉取
    pub async fn list(&self) -> Result<Vec<ToolDefinition>, String> {
        let mut cached = self.cached.lock().await;
        if let Some(defs) = cached.as_ref() {
            return Ok(defs.clone());
        }
        let defs = self.invoker.list_tools().await?;
        *cached = Some(defs.clone());
        Ok(defs)
    }

    /// 清空缓存，下次 list 重新拉取（后端操作集变化时由上层调用）
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    /// 执行操作并输出审计日志；超限截断由 agent 循环负责
    pub async fn call(&self, name: &str, args: Value) -> Result<ToolOutput, String> {
        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = self.invoker.call_tool(name, args).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(out) if !out.is_error => (true, "ok"),
            Ok(_) => (false, "error"),
            Err(_) => (false, "failed"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        result
    }
}

/// 从 schema 中剥除身份参数（properties 与 required 都去掉），模型不应看到它
pub fn strip_identity_from_schema(schema: &Value) -> Value {
    let mut schema = schema.clone();
    if let Some(props) = schema
        .get_mut("properties")
        .and_then(|p| p.as_object_mut())
    {
        props.remove(IDENTITY_ARG);
    }
    if let Some(required) = schema.get_mut("required").and_then(|r| r.as_array_mut()) {
        required.retain(|v| v.as_str() != Some(IDENTITY_ARG));
    }
    schema
}

/// 向参数表注入身份参数（覆盖模型可能伪造的值）
pub fn inject_identity(args: &mut Value, user_id: &str) {
    if !args.is_object() {
        *args = serde_json::json!({});
    }
    if let Some(map) = args.as_object_mut() {
        map.insert(IDENTITY_ARG.to_string(), Value::String(user_id.to_string()));
    }
}

/// 按声明的 JSON Schema 做参数校验：必填项存在、基本类型匹配。
/// 在身份参数注入之前调用，失败软化为带错误标记的工具结果。
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(obj) = args.as_object() else {
        return Err("arguments must be a JSON object".to_string());
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|v| v.as_str()) {
            if key == IDENTITY_ARG {
                continue;
            }
            if !obj.contains_key(key) {
                return Err(format!("missing required argument: {key}"));
            }
        }
    }

    let Some(props) = schema.get("properties").and_then(|p| p.as_object()) else {
        return Ok(());
    };
    for (key, value) in obj {
        let Some(expected) = props.get(key).and_then(|p| p.get("type")).and_then(|t| t.as_str())
        else {
            continue;
        };
        let matches = match expected {
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            _ => true,
        };
        if !matches {
            return Err(format!("argument `{key}` should be of type {expected}"));
        }
    }
    Ok(())
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "recursive": { "type": "boolean" },
                "user_id": { "type": "string" }
            },
            "required": ["path", "user_id"]
        })
    }

    #[test]
    fn strips_identity_from_schema() {
        let stripped = strip_identity_from_schema(&sample_schema());
        assert!(stripped["properties"].get("user_id").is_none());
        assert_eq!(stripped["required"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn validates_required_and_types() {
        let schema = sample_schema();
        assert!(validate_args(&schema, &serde_json::json!({ "path": "/docs" })).is_ok());
        assert!(validate_args(&schema, &serde_json::json!({})).is_err());
        assert!(validate_args(&schema, &serde_json::json!({ "path": 42 })).is_err());
        assert!(validate_args(
            &schema,
            &serde_json::json!({ "path": "/docs", "recursive": "yes" })
        )
        .is_err());
    }

    #[test]
    fn injects_identity_overriding_model_value() {
        let mut args = serde_json::json!({ "path": "/docs", "user_id": "spoofed" });
        inject_identity(&mut args, "user-1");
        assert_eq!(args["user_id"], "user-1");
    }
}
