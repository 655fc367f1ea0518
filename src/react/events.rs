//! 轮次过程事件：供传输层展示进度或记录审计（阶段、工具调用、重试、结果）

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::TurnOutcome;
use crate::llm::LlmError;
use crate::tools::{ToolCall, ToolResult};

/// 单步过程事件（可序列化为 JSON）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// 本轮选定的阶段
    Stage { label: String },
    /// 工具调用完成（结果预览，避免过长）
    ToolCall {
        tool: String,
        call_id: String,
        is_error: bool,
        preview: String,
    },
    /// 后端瞬时错误，准备重试
    Retry { attempt: u32, error: String },
    /// 轮次结束
    Outcome { kind: String },
}

/// 预览最大字符数
const PREVIEW_CHARS: usize = 200;

/// 观察者：所有方法都有空实现，按需覆盖
pub trait TurnObserver: Send + Sync {
    fn on_stage(&self, _label: &str) {}

    fn on_tool_call(&self, _call: &ToolCall, _result: &ToolResult) {}

    fn on_retry(&self, _attempt: u32, _error: &LlmError) {}

    fn on_outcome(&self, _outcome: &TurnOutcome) {}
}

/// 什么都不做的观察者（默认）
#[derive(Debug, Default)]
pub struct NoopObserver;

impl TurnObserver for NoopObserver {}

/// 把事件推到 mpsc 通道；接收端已关闭时静默丢弃
pub struct ChannelObserver {
    tx: UnboundedSender<TurnEvent>,
}

impl ChannelObserver {
    pub fn new(tx: UnboundedSender<TurnEvent>) -> Self {
        Self { tx }
    }

    fn send(&self, ev: TurnEvent) {
        let _ = self.tx.send(ev);
    }
}

impl TurnObserver for ChannelObserver {
    fn on_stage(&self, label: &str) {
        self.send(TurnEvent::Stage {
            label: label.to_string(),
        });
    }

    fn on_tool_call(&self, call: &ToolCall, result: &ToolResult) {
        let rendered = result.output.render();
        let preview = if rendered.chars().count() > PREVIEW_CHARS {
            format!("{}...", rendered.chars().take(PREVIEW_CHARS).collect::<String>())
        } else {
            rendered
        };
        self.send(TurnEvent::ToolCall {
            tool: call.name.clone(),
            call_id: call.id.clone(),
            is_error: result.is_error,
            preview,
        });
    }

    fn on_retry(&self, attempt: u32, error: &LlmError) {
        self.send(TurnEvent::Retry {
            attempt,
            error: error.message.clone(),
        });
    }

    fn on_outcome(&self, outcome: &TurnOutcome) {
        self.send(TurnEvent::Outcome {
            kind: outcome.kind().to_string(),
        });
    }
}
