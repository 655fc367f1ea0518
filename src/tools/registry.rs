//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找，
//! ToolExecutor 在调用时加超时、做审计日志，并把结果统一成 ToolResult。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ToolError;

/// 工具参数：扁平的键值对象
pub type ToolArgs = serde_json::Map<String, Value>;

/// 后端发起的一次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: ToolArgs,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: ToolArgs) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// 工具输出：纯文本或结构化 JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolOutput {
    Text(String),
    Json(Value),
}

impl ToolOutput {
    /// 写回上下文时使用的文本形式
    pub fn render(&self) -> String {
        match self {
            ToolOutput::Text(s) => s.clone(),
            ToolOutput::Json(v) => v.to_string(),
        }
    }
}

impl From<String> for ToolOutput {
    fn from(s: String) -> Self {
        ToolOutput::Text(s)
    }
}

impl From<&str> for ToolOutput {
    fn from(s: &str) -> Self {
        ToolOutput::Text(s.to_string())
    }
}

impl From<Value> for ToolOutput {
    fn from(v: Value) -> Self {
        ToolOutput::Json(v)
    }
}

/// 一次工具调用的结果，按 call_id 与调用配对
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub output: ToolOutput,
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(call_id: impl Into<String>, output: ToolOutput) -> Self {
        Self {
            call_id: call_id.into(),
            output,
            is_error: false,
        }
    }

    pub fn error(call_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            output: ToolOutput::Text(message.into()),
            is_error: true,
        }
    }
}

/// 发给后端的工具描述（name / description / JSON Schema 参数）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 转人工工具：同一轮中出现时只执行它，其余调用丢弃
    fn is_handoff(&self) -> bool {
        false
    }

    async fn execute(&self, args: ToolArgs) -> Result<ToolOutput, ToolError>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool re-registered, previous handler replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn is_handoff(&self, name: &str) -> bool {
        self.tools.get(name).is_some_and(|t| t.is_handoff())
    }

    pub async fn execute(&self, name: &str, args: ToolArgs) -> Result<ToolOutput, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::Unknown(name.to_string()))?;
        tool.execute(args).await
    }

    /// 已注册工具名（排序后，便于日志与测试稳定）
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 按给定顺序生成工具 schema；未注册的名字跳过
    pub fn schemas(&self, names: &[String]) -> Vec<ToolSchema> {
        names
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolSchema {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::FnTool;

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(FnTool::new("Echo", "echo text", |args: ToolArgs| async move {
            Ok(ToolOutput::from(
                args.get("text").and_then(|v| v.as_str()).unwrap_or("(empty)"),
            ))
        }));
        reg
    }

    #[tokio::test]
    async fn test_execute_known_and_unknown() {
        let reg = registry();
        let mut args = ToolArgs::new();
        args.insert("text".into(), Value::from("hi"));
        assert_eq!(reg.execute("Echo", args).await, Ok(ToolOutput::from("hi")));
        assert_eq!(
            reg.execute("Nope", ToolArgs::new()).await,
            Err(ToolError::Unknown("Nope".into()))
        );
    }

    #[test]
    fn test_schemas_follow_requested_order_and_skip_unknown() {
        let mut reg = registry();
        reg.register(FnTool::new("Other", "other", |_| async { Ok(ToolOutput::from("")) }));
        let schemas = reg.schemas(&["Other".into(), "Missing".into(), "Echo".into()]);
        let names: Vec<&str> = schemas.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Other", "Echo"]);
        assert_eq!(schemas[1].parameters["type"], "object");
    }

    #[test]
    fn test_tool_output_render() {
        assert_eq!(ToolOutput::from("plain").render(), "plain");
        assert_eq!(
            ToolOutput::from(serde_json::json!({"slots": ["10:00"]})).render(),
            r#"{"slots":["10:00"]}"#
        );
    }
}
