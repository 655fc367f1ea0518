//! 闭包工具：用一个 async 闭包实现 Tool（嵌入方快速注册、测试替身）

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::core::ToolError;
use crate::tools::{Tool, ToolArgs, ToolOutput};

type Handler = Arc<dyn Fn(ToolArgs) -> BoxFuture<'static, Result<ToolOutput, ToolError>> + Send + Sync>;

pub struct FnTool {
    name: String,
    description: String,
    handler: Handler,
}

impl FnTool {
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ToolArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(&self, args: ToolArgs) -> Result<ToolOutput, ToolError> {
        (self.handler)(args).await
    }
}
