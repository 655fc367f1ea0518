//! 核心层：错误与恢复、重试策略、转人工、轮次终值、会话监管

pub mod error;
pub mod escalation;
pub mod outcome;
pub mod recovery;
pub mod session_supervisor;

pub use error::{ConfigError, FailureKind, RecoveryAction, ToolError};
pub use escalation::{Escalation, EscalationHandler};
pub use outcome::TurnOutcome;
pub use recovery::{is_internal_server_error, FailureClass, RetryPolicy, RetryState};
pub use session_supervisor::{ConversationHub, TurnGuard};
