//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；
//! 工具声明以 function tool 形式下发，模型请求的 tool_calls 转回 ToolCallRecord。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionMessageToolCall, ChatCompletionMessageToolCalls,
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionTool, ChatCompletionTools,
    CreateChatCompletionRequestArgs, FunctionCall, FunctionObjectArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{ChatOutcome, LlmClient};
use crate::memory::{Message, Role, ToolCallRecord};
use crate::tools::ToolDefinition;

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 Client 与 model 名，chat 时转 Message 为 API 格式并取首条 choice
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            usage: TokenUsage::default(),
        }
    }

    fn to_openai_messages(&self, messages: &[Message]) -> Vec<ChatCompletionRequestMessage> {
        let mut wire = Vec::with_capacity(messages.len());
        for (idx, m) in messages.iter().enumerate() {
            match m.role {
                Role::System => wire.push(ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone().unwrap_or_default())
                        .build()
                        .unwrap(),
                )),
                Role::User => wire.push(ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone().unwrap_or_default())
                        .build()
                        .unwrap(),
                )),
                Role::Assistant => {
                    let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
                    if let Some(content) = &m.content {
                        builder.content(content.clone());
                    }
                    if !m.tool_calls.is_empty() {
                        builder.tool_calls(
                            m.tool_calls.iter().map(to_wire_call).collect::<Vec<_>>(),
                        );
                    }
                    wire.push(ChatCompletionRequestMessage::Assistant(
                        builder.build().unwrap(),
                    ));
                    // API 要求 tool_calls 后紧跟对应的 tool 消息。持久化历史把结果
                    // 内嵌在 ToolCallRecord 里而没有单独的 tool 消息，缺失的在这里补齐
                    let answered: std::collections::HashSet<&str> = messages[idx + 1..]
                        .iter()
                        .take_while(|n| n.role == Role::Tool)
                        .filter_map(|n| n.tool_call_id.as_deref())
                        .collect();
                    for record in &m.tool_calls {
                        if answered.contains(record.id.as_str()) {
                            continue;
                        }
                        wire.push(ChatCompletionRequestMessage::Tool(
                            ChatCompletionRequestToolMessageArgs::default()
                                .content(record.result.clone().unwrap_or_default())
                                .tool_call_id(record.id.clone())
                                .build()
                                .unwrap(),
                        ));
                    }
                }
                Role::Tool => wire.push(ChatCompletionRequestMessage::Tool(
                    ChatCompletionRequestToolMessageArgs::default()
                        .content(m.content.clone().unwrap_or_default())
                        .tool_call_id(m.tool_call_id.clone().unwrap_or_default())
                        .build()
                        .unwrap(),
                )),
            }
        }
        wire
    }

    fn to_openai_tools(&self, tools: &[ToolDefinition]) -> Vec<ChatCompletionTools> {
        tools
            .iter()
            .map(|t| {
                ChatCompletionTools::Function(ChatCompletionTool {
                    function: FunctionObjectArgs::default()
                        .name(t.name.clone())
                        .description(t.description.clone())
                        .parameters(t.schema.clone())
                        .build()
                        .unwrap(),
                })
            })
            .collect()
    }
}

fn to_wire_call(record: &ToolCallRecord) -> ChatCompletionMessageToolCalls {
    ChatCompletionMessageToolCalls::Function(ChatCompletionMessageToolCall {
        id: record.id.clone(),
        function: FunctionCall {
            name: record.name.clone(),
            arguments: record.arguments.to_string(),
        },
    })
}

fn from_wire_call(call: &ChatCompletionMessageToolCalls) -> Option<ToolCallRecord> {
    match call {
        ChatCompletionMessageToolCalls::Function(call) => {
            // 模型偶尔产出非法 JSON 参数，降级为空对象交给 schema 校验报错
            let arguments = serde_json::from_str(&call.function.arguments)
                .unwrap_or_else(|_| serde_json::json!({}));
            Some(ToolCallRecord {
                id: call.id.clone(),
                name: call.function.name.clone(),
                arguments,
                result: None,
                is_error: false,
            })
        }
        _ => None,
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ChatOutcome, String> {
        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&self.model)
            .messages(self.to_openai_messages(messages));
        if !tools.is_empty() {
            builder.tools(self.to_openai_tools(tools));
        }
        let request = builder.build().map_err(|e| e.to_string())?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| e.to_string())?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let Some(choice) = response.choices.first() else {
            return Ok(ChatOutcome::default());
        };

        let tool_calls = choice
            .message
            .tool_calls
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(from_wire_call)
            .collect();

        Ok(ChatOutcome {
            content: choice.message.content.clone(),
            tool_calls,
        })
    }
}
