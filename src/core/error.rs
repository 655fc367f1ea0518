//! 错误类型与恢复动作
//!
//! 与 RetryPolicy 配合：后端失败经分类后得到 Retry / Escalate / Abort；
//! 工具错误只会变成带 is_error 标记的结果，不会中断轮次（Handoff 除外）。

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// 轮次的终止性失败（对用户只展示统一的致歉文案）
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureKind {
    #[error("Iteration limit exceeded ({0} tool rounds)")]
    IterationLimitExceeded(usize),

    #[error("Malformed backend response: {0}")]
    MalformedBackendResponse(String),

    /// 非瞬时的后端错误（参数错误、未知模型等），不重试
    #[error("Backend rejected request: {0}")]
    BackendRejected(String),

    #[error("Turn cancelled")]
    Cancelled,

    #[error("Turn timed out")]
    TimedOut,
}

/// 工具执行错误：除 Handoff 外都会被转成错误结果写回上下文
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    Unknown(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool execution failed: {0}")]
    Execution(String),

    #[error("Tool timeout: {0}")]
    Timeout(String),

    /// 转人工信号：由 call-human 类工具抛出，执行器捕获后立即结束轮次
    #[error("Handoff requested: {0}")]
    Handoff(String),
}

/// 配置与阶段目录的装载/校验错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid stage catalog: {0}")]
    Catalog(#[from] toml::de::Error),

    #[error("Unknown stage label '{0}'")]
    UnknownStage(String),

    #[error("Stage '{stage}' references unregistered tool '{tool}'")]
    UnknownTool { stage: String, tool: String },

    #[error("Stage catalog has no catch-all '{0}' stage")]
    MissingCatchAll(String),

    #[error(transparent)]
    Load(#[from] config::ConfigError),
}

/// RetryPolicy 根据失败类型给出的动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 等待后用同样的输入重发（不重复追加用户消息）
    Retry(std::time::Duration),
    /// 重试耗尽：转人工
    Escalate,
    /// 致命错误：立即终止本轮
    Abort(String),
}
