//! 短期记忆：对话上下文
//!
//! 按顺序保存一次对话的全部轮次（user / assistant / tool），只允许追加，不改写、不重排。
//! 工具结果总是紧跟在发起调用的 assistant 轮次之后，且顺序与调用顺序一致。

use serde::{Deserialize, Serialize};

use crate::tools::{ToolCall, ToolResult};

/// 对话标识（由传输层提供，核心只用于生成转人工链接与串行化）
pub type ConversationId = String;

/// 消息角色（与后端 API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// 单条轮次；assistant 轮次可携带本轮发起的工具调用，tool 轮次携带对应的调用 ID
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    fn tool_result(result: &ToolResult) -> Self {
        Self {
            role: Role::Tool,
            content: result.output.render(),
            tool_call_id: Some(result.call_id.clone()),
            tool_calls: Vec::new(),
        }
    }
}

/// 一次对话的上下文：调用方持有，按引用传入每个轮次
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationContext {
    id: ConversationId,
    turns: Vec<Turn>,
}

impl ConversationContext {
    pub fn new(id: impl Into<ConversationId>) -> Self {
        Self {
            id: id.into(),
            turns: Vec::new(),
        }
    }

    /// 用已持久化的轮次恢复上下文（传输层加载历史时使用）
    pub fn from_turns(id: impl Into<ConversationId>, turns: Vec<Turn>) -> Self {
        Self {
            id: id.into(),
            turns,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// 最近 n 条轮次（不足 n 条时返回全部）
    pub fn last(&self, n: usize) -> &[Turn] {
        let start = self.turns.len().saturating_sub(n);
        &self.turns[start..]
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.turns.push(Turn::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.turns.push(Turn::assistant(content));
    }

    /// 追加一整轮工具调用：先写 assistant（携带全部调用），再按调用顺序写每个结果
    pub fn push_tool_round(&mut self, content: Option<String>, round: Vec<(ToolCall, ToolResult)>) {
        if round.is_empty() {
            return;
        }
        let (calls, results): (Vec<ToolCall>, Vec<ToolResult>) = round.into_iter().unzip();
        self.turns.push(Turn {
            role: Role::Assistant,
            content: content.unwrap_or_default(),
            tool_call_id: None,
            tool_calls: calls,
        });
        self.turns.extend(results.iter().map(Turn::tool_result));
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
