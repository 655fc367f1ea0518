//! 文本形式的工具调用解析
//!
//! 部分后端（或提示词引导下的模型）不走原生 function calling，而是把调用写成 JSON 文本：
//! `{"tool": "CheckAvailableSlots", "arguments": {"date": "2025-11-12"}}`，也可能包在 ```json 代码块里。
//! 只有整段回复就是一个 JSON 对象时才按调用处理，夹在正常回复里的花括号不算。
//! 另一种写法是以 `[CALL_MANAGER]` 开头的转人工标记，后面可跟 `{"reason": ...}`；标记文本不能发给用户。

use serde::Deserialize;
use serde_json::Value;

use crate::tools::{ToolArgs, ToolCall};

/// 回复开头的转人工标记
pub const HANDOFF_MARKER: &str = "[CALL_MANAGER]";

/// 标记后没有给出原因时使用
const DEFAULT_MARKER_REASON: &str = "Клиент запросил связь с менеджером";

/// 文本调用的宽松格式：tool/name 与 arguments/args 都接受
#[derive(Debug, Deserialize)]
struct TextToolCall {
    #[serde(alias = "name")]
    tool: Option<String>,
    #[serde(alias = "args")]
    arguments: Option<Value>,
    reason: Option<String>,
}

/// 去掉 ```json / ``` 代码块包裹
fn strip_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// 文本解析出的调用统一使用 fallback_ 前缀的 id
pub fn fallback_call(name: impl Into<String>, arguments: ToolArgs) -> ToolCall {
    ToolCall::new(
        format!("fallback_{}", uuid::Uuid::new_v4().simple()),
        name,
        arguments,
    )
}

/// 回复以转人工标记开头时返回原因
///
/// 原因依次取：标记后 JSON 的 `reason`，标记后的其余文本，默认原因。
pub fn parse_handoff_marker(text: &str) -> Option<String> {
    let rest = strip_fence(text).strip_prefix(HANDOFF_MARKER)?.trim();
    let from_json = rest
        .find('{')
        .and_then(|start| serde_json::from_str::<Value>(&rest[start..]).ok())
        .and_then(|v| v.get("reason").and_then(Value::as_str).map(|r| r.trim().to_string()))
        .filter(|r| !r.is_empty());
    let reason = match from_json {
        Some(reason) => reason,
        None if !rest.is_empty() && !rest.starts_with('{') => rest.to_string(),
        None => DEFAULT_MARKER_REASON.to_string(),
    };
    Some(reason)
}

/// 解析文本形式的工具调用
///
/// handoff 为当前阶段可用的转人工工具名：只带 `reason` 的对象视为对它的调用。
pub fn parse_tool_call_text(text: &str, handoff: Option<&str>) -> Option<ToolCall> {
    let body = strip_fence(text);
    if !(body.starts_with('{') && body.ends_with('}')) {
        return None;
    }
    let parsed: TextToolCall = serde_json::from_str(body).ok()?;

    let (name, arguments) = match (parsed.tool, parsed.reason) {
        (Some(tool), _) if !tool.trim().is_empty() => {
            let arguments = match parsed.arguments {
                Some(Value::Object(map)) => map,
                Some(Value::String(s)) => match serde_json::from_str::<Value>(&s) {
                    Ok(Value::Object(map)) => map,
                    _ => ToolArgs::new(),
                },
                _ => ToolArgs::new(),
            };
            (tool.trim().to_string(), arguments)
        }
        (_, Some(reason)) => {
            let name = handoff?;
            let mut arguments = ToolArgs::new();
            arguments.insert("reason".into(), Value::String(reason));
            (name.to_string(), arguments)
        }
        _ => return None,
    };

    tracing::debug!(tool = %name, "parsed tool call from reply text");
    Some(fallback_call(name, arguments))
}
