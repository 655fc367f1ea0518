//! HTTP 工具：由配置 [[tools.http]] 注册，把参数以 JSON 发往外部接口（如预约系统）
//!
//! 工具对核心而言是不透明的 name / arguments / result 契约；响应体能解析为 JSON 则原样返回，否则按文本返回。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::HttpToolEntry;
use crate::core::ToolError;
use crate::tools::{Tool, ToolArgs, ToolOutput};

/// 响应体最大字符数，超出截断
const MAX_BODY_CHARS: usize = 8000;

pub struct HttpTool {
    name: String,
    description: String,
    url: String,
    use_get: bool,
    parameters: Value,
    headers: HashMap<String, String>,
    client: reqwest::Client,
}

impl HttpTool {
    pub fn new(entry: &HttpToolEntry, default_timeout_secs: u64) -> Self {
        let timeout = Duration::from_secs(entry.timeout_secs.unwrap_or(default_timeout_secs));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(tool = %entry.name, "http client builder failed ({}), using defaults", e);
                reqwest::Client::new()
            });
        Self {
            name: entry.name.clone(),
            description: entry.description.clone(),
            url: entry.url.clone(),
            use_get: entry.method.eq_ignore_ascii_case("GET"),
            parameters: entry.parameters.clone().unwrap_or_else(|| {
                serde_json::json!({ "type": "object", "properties": {}, "required": [] })
            }),
            headers: entry.headers.clone(),
            client,
        }
    }
}

/// GET 请求时把参数展开为查询串（字符串原样，其它值用 JSON 文本）
fn query_pairs(args: &ToolArgs) -> Vec<(String, String)> {
    args.iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), v)
        })
        .collect()
}

fn parse_body(body: String) -> ToolOutput {
    match serde_json::from_str::<Value>(&body) {
        Ok(v) if v.is_object() || v.is_array() => ToolOutput::Json(v),
        _ if body.chars().count() > MAX_BODY_CHARS => {
            ToolOutput::Text(format!("{}...", body.chars().take(MAX_BODY_CHARS).collect::<String>()))
        }
        _ => ToolOutput::Text(body),
    }
}

#[async_trait]
impl Tool for HttpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.parameters.clone()
    }

    async fn execute(&self, args: ToolArgs) -> Result<ToolOutput, ToolError> {
        let mut request = if self.use_get {
            self.client.get(&self.url).query(&query_pairs(&args))
        } else {
            self.client.post(&self.url).json(&args)
        };
        for (k, v) in &self.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        if !status.is_success() {
            return Err(ToolError::Execution(format!("HTTP {}: {}", status.as_u16(), body.trim())));
        }
        Ok(parse_body(body))
    }
}
