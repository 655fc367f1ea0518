//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。
//! 请求/响应使用本模块自己的 serde 类型（byot），以便携带 function tools 与 tool 消息。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::Client;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::{LlmClient, LlmError, LlmReply};
use crate::memory::{Role, Turn};
use crate::tools::{ToolArgs, ToolCall, ToolSchema};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

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

// ---- 线上格式 ----

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
enum WireMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<WireToolCall>,
    },
    Tool {
        content: String,
        tool_call_id: String,
    },
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default = "function_type")]
    kind: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct WireFunctionCall {
    name: String,
    /// 参数是 JSON 字符串（OpenAI 约定）
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction<'a>,
}

#[derive(Debug, Serialize)]
struct WireFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn function_type() -> String {
    "function".to_string()
}

fn to_wire_call(call: &ToolCall) -> WireToolCall {
    WireToolCall {
        id: call.id.clone(),
        kind: function_type(),
        function: WireFunctionCall {
            name: call.name.clone(),
            arguments: Value::Object(call.arguments.clone()).to_string(),
        },
    }
}

/// 参数字符串解析失败时给空参数，由工具自己报 InvalidArguments
fn from_wire_call(call: WireToolCall) -> ToolCall {
    let arguments = if call.function.arguments.trim().is_empty() {
        ToolArgs::new()
    } else {
        match serde_json::from_str::<Value>(&call.function.arguments) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                tracing::warn!(
                    tool = %call.function.name,
                    "tool call arguments are not a JSON object, passing empty arguments"
                );
                ToolArgs::new()
            }
        }
    };
    let id = if call.id.is_empty() {
        format!("call_{}", uuid::Uuid::new_v4().simple())
    } else {
        call.id
    };
    ToolCall::new(id, call.function.name, arguments)
}

fn to_wire_messages(instruction: &str, context: &[Turn]) -> Vec<WireMessage> {
    let mut messages = Vec::with_capacity(context.len() + 1);
    if !instruction.is_empty() {
        messages.push(WireMessage::System {
            content: instruction.to_string(),
        });
    }
    for turn in context {
        messages.push(match turn.role {
            Role::User => WireMessage::User {
                content: turn.content.clone(),
            },
            Role::Assistant => WireMessage::Assistant {
                content: if turn.content.is_empty() && !turn.tool_calls.is_empty() {
                    None
                } else {
                    Some(turn.content.clone())
                },
                tool_calls: turn.tool_calls.iter().map(to_wire_call).collect(),
            },
            Role::Tool => WireMessage::Tool {
                content: turn.content.clone(),
                tool_call_id: turn.tool_call_id.clone().unwrap_or_default(),
            },
        });
    }
    messages
}

/// 第一次失败即放弃：async_openai 默认会对 5xx 指数退避重试十几分钟
fn no_retry_backoff() -> backoff::ExponentialBackoff {
    backoff::ExponentialBackoffBuilder::new()
        .with_max_elapsed_time(Some(Duration::ZERO))
        .build()
}

/// 转成 RetryPolicy 能匹配的错误文本
fn describe_error(err: OpenAIError) -> String {
    match err {
        // 5xx 的响应体不一定是 JSON，async_openai 把原始 body 放进 message，type/code 为空
        OpenAIError::ApiError(api) if api.r#type.is_none() && api.code.is_none() => {
            let body = api.message.trim();
            if body.is_empty() {
                "server error: empty response body".to_string()
            } else {
                format!("server error: {body}")
            }
        }
        other => other.to_string(),
    }
}

/// OpenAI 兼容客户端：持有 Client 与 model 名
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: Option<f32>,
    request_timeout: Duration,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
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
            client: Client::with_config(config).with_backoff(no_retry_backoff()),
            model: model.to_string(),
            temperature: None,
            request_timeout: Duration::from_secs(60),
            usage: TokenUsage::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(
        &self,
        instruction: &str,
        tools: &[ToolSchema],
        context: &[Turn],
    ) -> Result<LlmReply, LlmError> {
        let request = ChatRequest {
            model: &self.model,
            messages: to_wire_messages(instruction, context),
            tools: tools
                .iter()
                .map(|t| WireTool {
                    kind: "function",
                    function: WireFunction {
                        name: &t.name,
                        description: &t.description,
                        parameters: &t.parameters,
                    },
                })
                .collect(),
            temperature: self.temperature,
        };

        let response: ChatResponse = tokio::time::timeout(
            self.request_timeout,
            self.client.chat().create_byot(&request),
        )
        .await
        .map_err(|_| LlmError::new(format!("request timed out after {:?}", self.request_timeout)))?
        .map_err(|e| LlmError::new(describe_error(e)))?;

        // 提取 token 使用统计
        if let Some(usage) = &response.usage {
            self.usage.add(usage.prompt_tokens, usage.completion_tokens);
        }

        let Some(choice) = response.choices.into_iter().next() else {
            return Ok(LlmReply::default());
        };
        Ok(LlmReply {
            text: choice.message.content,
            tool_calls: choice
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(from_wire_call)
                .collect(),
        })
    }
}
