//! 转人工工具：模型可直接调用；处理函数抛出 Handoff 信号，执行器据此立即结束轮次

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::ToolError;
use crate::tools::schema::{parameters_schema_for, parse_args};
use crate::tools::{Tool, ToolArgs, ToolOutput};

/// 默认工具名
pub const CALL_HUMAN: &str = "CallManager";

/// 转人工参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct CallHumanArgs {
    /// Short reason for the handoff, e.g. "client is unhappy with the service"
    pub reason: String,
}

pub struct CallHumanTool {
    name: String,
    description: String,
}

impl Default for CallHumanTool {
    fn default() -> Self {
        Self::new(CALL_HUMAN)
    }
}

impl CallHumanTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: "Hand the conversation over to a human manager. Use it when the client \
                is strongly dissatisfied, asks for something that needs a business decision, \
                or when another tool keeps failing. After calling it, do not answer the client."
                .to_string(),
        }
    }
}

#[async_trait]
impl Tool for CallHumanTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema_for::<CallHumanArgs>()
    }

    fn is_handoff(&self) -> bool {
        true
    }

    async fn execute(&self, args: ToolArgs) -> Result<ToolOutput, ToolError> {
        // 参数不合法也照样转人工，原因留空由报告补默认值
        let reason = parse_args::<CallHumanArgs>(&args)
            .map(|a| a.reason)
            .unwrap_or_default();
        Err(ToolError::Handoff(reason))
    }
}
