//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / 测试替身）实现 LlmClient：给定系统指令、可用工具与完整上下文，
//! 返回一条回复（文本、工具调用，或两者兼有）。后端失败只携带错误文本，由 RetryPolicy 分类。

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::Turn;
use crate::tools::{ToolCall, ToolSchema};

/// 后端回复：可选文本 + 按后端给出顺序排列的工具调用
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmReply {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl LlmReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            text: None,
            tool_calls: calls,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// 后端调用失败（传输错误、HTTP 错误、后端返回的错误体）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct LlmError {
    pub message: String,
}

impl LlmError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成；tools 为空表示本次不允许调用工具
    async fn complete(
        &self,
        instruction: &str,
        tools: &[ToolSchema],
        context: &[Turn],
    ) -> Result<LlmReply, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
