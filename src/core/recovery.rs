//! 重试策略
//!
//! 只有后端的瞬时服务端错误（internal server error）可重试；按错误文本大小写不敏感匹配，
//! 不依赖错误类型（后端可能以状态字段或异常两种方式上报）。重试耗尽时给出 Escalate 而不是错误。

use std::time::Duration;

use crate::config::RetrySection;
use crate::core::RecoveryAction;
use crate::llm::LlmError;

/// 失败分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retryable,
    Fatal,
}

/// 判断错误文本是否为服务端 500（internal server error）
pub fn is_internal_server_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("internal server error") || (lower.contains("500") && lower.contains("internal"))
}

/// 单次轮次内的重试状态，轮次结束即丢弃
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// 连续失败次数（成功后清零）
    pub attempts: u32,
    pub last_error: Option<LlmError>,
    pub escalation_triggered: bool,
}

impl RetryState {
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_error = None;
    }
}

/// 重试策略：瞬时错误最多尝试 max_attempts 次，之后转人工
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Duration,
    signatures: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(300),
            signatures: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    pub fn from_config(section: &RetrySection) -> Self {
        Self::new(section.max_attempts)
            .with_backoff(Duration::from_millis(section.backoff_ms))
            .with_signatures(section.signatures.clone())
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// 额外的瞬时错误特征串（大小写不敏感），与内置的 500 判断并用
    pub fn with_signatures(mut self, signatures: Vec<String>) -> Self {
        self.signatures = signatures.into_iter().map(|s| s.to_lowercase()).collect();
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn classify(&self, err: &LlmError) -> FailureClass {
        let lower = err.message.to_lowercase();
        if is_internal_server_error(&lower) || self.signatures.iter().any(|s| lower.contains(s)) {
            FailureClass::Retryable
        } else {
            FailureClass::Fatal
        }
    }

    pub fn should_escalate(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// 记录一次失败并给出动作；Escalate 时 state.escalation_triggered 置位
    pub fn decide(&self, state: &mut RetryState, err: LlmError) -> RecoveryAction {
        match self.classify(&err) {
            FailureClass::Fatal => RecoveryAction::Abort(err.message),
            FailureClass::Retryable => {
                state.attempts += 1;
                state.last_error = Some(err);
                if self.should_escalate(state.attempts) {
                    state.escalation_triggered = true;
                    RecoveryAction::Escalate
                } else {
                    RecoveryAction::Retry(self.backoff)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_server_error_signatures() {
        assert!(is_internal_server_error("500: Internal Server Error"));
        assert!(is_internal_server_error("upstream said INTERNAL SERVER ERROR"));
        assert!(is_internal_server_error("status 500 (internal)"));
        assert!(!is_internal_server_error("400: bad request"));
        assert!(!is_internal_server_error("500 tokens left"));
        assert!(!is_internal_server_error(""));
    }

    #[test]
    fn test_classify_only_transient_is_retryable() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.classify(&LlmError::new("Internal server error")),
            FailureClass::Retryable
        );
        assert_eq!(
            policy.classify(&LlmError::new("model not found: gpt-x")),
            FailureClass::Fatal
        );
    }

    #[test]
    fn test_custom_signature() {
        let policy = RetryPolicy::default().with_signatures(vec!["Overloaded".into()]);
        assert_eq!(
            policy.classify(&LlmError::new("engine overloaded, try later")),
            FailureClass::Retryable
        );
    }

    #[test]
    fn test_decide_escalates_after_max_attempts() {
        let policy = RetryPolicy::new(3).with_backoff(Duration::ZERO);
        let mut state = RetryState::default();
        let err = || LlmError::new("500 internal server error");

        assert_eq!(policy.decide(&mut state, err()), RecoveryAction::Retry(Duration::ZERO));
        assert_eq!(policy.decide(&mut state, err()), RecoveryAction::Retry(Duration::ZERO));
        assert_eq!(policy.decide(&mut state, err()), RecoveryAction::Escalate);
        assert!(state.escalation_triggered);
        assert_eq!(state.attempts, 3);
    }

    #[test]
    fn test_decide_fatal_aborts_without_counting() {
        let policy = RetryPolicy::default();
        let mut state = RetryState::default();
        let action = policy.decide(&mut state, LlmError::new("invalid api key"));
        assert_eq!(action, RecoveryAction::Abort("invalid api key".into()));
        assert_eq!(state.attempts, 0);
    }

    #[test]
    fn test_zero_attempts_is_clamped() {
        let policy = RetryPolicy::new(0);
        assert_eq!(policy.max_attempts(), 1);
        assert!(policy.should_escalate(1));
    }
}
