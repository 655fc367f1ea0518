//! Mock LLM 客户端（用于测试与无 API Key 的本地演示）
//!
//! - EchoClient：回显最后一条用户消息，不调用工具
//! - ScriptedClient：按脚本依次返回回复或错误，并记录每次收到的请求，供测试断言

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, LlmReply};
use crate::memory::{Role, Turn};
use crate::tools::{ToolArgs, ToolCall, ToolSchema};

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct EchoClient;

#[async_trait]
impl LlmClient for EchoClient {
    async fn complete(
        &self,
        _instruction: &str,
        _tools: &[ToolSchema],
        context: &[Turn],
    ) -> Result<LlmReply, LlmError> {
        let last_user = context
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.content.as_str())
            .unwrap_or("(no input)");
        Ok(LlmReply::text(format!("Echo: {}", last_user)))
    }
}

/// 一次请求的快照
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub instruction: String,
    pub tools: Vec<String>,
    pub context: Vec<Turn>,
}

/// 脚本中的一步
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Reply(LlmReply),
    Fail(String),
}

/// 脚本客户端：按顺序消费步骤；repeat 模式下最后一步无限重复
pub struct ScriptedClient {
    steps: Mutex<VecDeque<ScriptStep>>,
    last: Mutex<Option<ScriptStep>>,
    repeat_last: bool,
    calls: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedClient {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            last: Mutex::new(None),
            repeat_last: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 每次都返回同一步
    pub fn repeating(step: ScriptStep) -> Self {
        let mut client = Self::new(vec![step]);
        client.repeat_last = true;
        client
    }

    pub fn text(text: impl Into<String>) -> ScriptStep {
        ScriptStep::Reply(LlmReply::text(text))
    }

    pub fn fail(message: impl Into<String>) -> ScriptStep {
        ScriptStep::Fail(message.into())
    }

    /// 单个工具调用；参数来自 JSON 对象
    pub fn call(id: &str, name: &str, args: serde_json::Value) -> ScriptStep {
        ScriptStep::Reply(LlmReply::tool_calls(vec![tool_call(id, name, args)]))
    }

    pub fn calls(calls: Vec<ToolCall>) -> ScriptStep {
        ScriptStep::Reply(LlmReply::tool_calls(calls))
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }
}

/// 构造工具调用（非对象参数按空参数处理）
pub fn tool_call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
    let arguments = match args {
        serde_json::Value::Object(map) => map,
        _ => ToolArgs::new(),
    };
    ToolCall::new(id, name, arguments)
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn complete(
        &self,
        instruction: &str,
        tools: &[ToolSchema],
        context: &[Turn],
    ) -> Result<LlmReply, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedRequest {
                instruction: instruction.to_string(),
                tools: tools.iter().map(|t| t.name.clone()).collect(),
                context: context.to_vec(),
            });
        }

        let next = self.steps.lock().ok().and_then(|mut s| s.pop_front());
        let step = match next {
            Some(step) => {
                if self.repeat_last {
                    if let Ok(mut last) = self.last.lock() {
                        *last = Some(step.clone());
                    }
                }
                step
            }
            None if self.repeat_last => self
                .last
                .lock()
                .ok()
                .and_then(|l| l.clone())
                .ok_or_else(|| LlmError::new("script is empty"))?,
            None => return Err(LlmError::new("script exhausted")),
        };

        match step {
            ScriptStep::Reply(reply) => Ok(reply),
            ScriptStep::Fail(message) => Err(LlmError::new(message)),
        }
    }
}
