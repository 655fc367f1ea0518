//! 工具参数 JSON Schema 生成（schemars 自动生成）与参数解析
//!
//! 强类型参数结构体派生 JsonSchema，schema 直接作为 parameters 发给后端，避免手写 schema 与实际解析不一致。

use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::ToolError;
use crate::tools::ToolArgs;

/// 由参数类型生成 parameters schema（去掉 $schema / title 等后端不需要的顶层键）
pub fn parameters_schema_for<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| serde_json::json!({ "type": "object" }));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}

/// 把扁平参数解析为强类型参数
pub fn parse_args<T: DeserializeOwned>(args: &ToolArgs) -> Result<T, ToolError> {
    serde_json::from_value(Value::Object(args.clone()))
        .map_err(|e| ToolError::InvalidArguments(e.to_string()))
}
