//! concierge - 按阶段路由的对话轮次引擎
//!
//! 模块划分：
//! - **agent**: 无头运行时（按对话串行、整轮超时、取消、时钟前缀）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、重试策略、转人工、轮次终值、会话监管
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **memory**: 对话上下文
//! - **observability**: 日志订阅器
//! - **react**: 轮次主循环、文本工具调用解析、过程事件
//! - **stage**: 阶段词表、分类器、阶段目录与路由
//! - **tools**: 工具注册表、执行器、转人工与 HTTP 工具

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod stage;
pub mod tools;

pub use crate::agent::{AgentResponse, AgentRuntime};
pub use crate::core::{Escalation, FailureKind, TurnOutcome};
pub use crate::stage::{StageLabel, StageRouter};
