//! 轮次终值

use serde::Serialize;

use crate::core::{Escalation, FailureKind};

/// 一个轮次的终止结果：回复 / 转人工 / 失败
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TurnOutcome {
    Reply(String),
    Escalated(Escalation),
    Failed(FailureKind),
}

impl TurnOutcome {
    pub fn is_reply(&self) -> bool {
        matches!(self, TurnOutcome::Reply(_))
    }

    pub fn is_escalated(&self) -> bool {
        matches!(self, TurnOutcome::Escalated(_))
    }

    /// 日志与事件中使用的简短类别名
    pub fn kind(&self) -> &'static str {
        match self {
            TurnOutcome::Reply(_) => "reply",
            TurnOutcome::Escalated(_) => "escalated",
            TurnOutcome::Failed(_) => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serializes_for_transports() {
        let escalated = TurnOutcome::Escalated(Escalation {
            user_message: "Секундочку".into(),
            manager_report: "--- MANAGER ALERT ---".into(),
            reason: "жалоба".into(),
        });
        let json = serde_json::to_value(&escalated).unwrap();
        assert_eq!(json["type"], "escalated");
        assert_eq!(json["value"]["reason"], "жалоба");

        let back: Escalation = serde_json::from_value(json["value"].clone()).unwrap();
        assert_eq!(back.user_message, "Секундочку");

        let failed = serde_json::to_value(TurnOutcome::Failed(FailureKind::IterationLimitExceeded(10))).unwrap();
        assert_eq!(failed["type"], "failed");
        assert_eq!(failed["value"]["kind"], "iteration_limit_exceeded");
        assert_eq!(failed["value"]["detail"], 10);

        let cancelled = serde_json::to_value(TurnOutcome::Failed(FailureKind::Cancelled)).unwrap();
        assert_eq!(cancelled["value"]["kind"], "cancelled");
    }
}
