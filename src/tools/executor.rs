//! 工具执行器
//!
//! 持有 ToolRegistry 与单次调用超时。execute(call, allowed) 先校验工具是否属于当前阶段且已注册，
//! 再在超时内调用 registry.execute；失败与超时都转为带 is_error 的 ToolResult 写回上下文，
//! 只有转人工信号（ToolError::Handoff）上升为 ToolDispatch::Handoff。每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::ToolError;
use crate::tools::{ToolCall, ToolRegistry, ToolResult};

/// 单次工具调用的分派结果
#[derive(Debug, Clone, PartialEq)]
pub enum ToolDispatch {
    /// 正常结束（成功或可写回的错误）
    Completed(ToolResult),
    /// 工具请求转人工，轮次应立即结束
    Handoff { reason: String },
}

/// 工具执行器：对每次调用施加超时，并将结果映射为 ToolResult
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn is_handoff(&self, name: &str) -> bool {
        self.registry.is_handoff(name)
    }

    /// 执行一次调用；allowed 为当前阶段可用工具，之外的名字按未知工具处理
    pub async fn execute(&self, call: &ToolCall, allowed: &[String]) -> ToolDispatch {
        let start = Instant::now();
        let args_preview = args_preview(&call.arguments);

        let result = match canonical_tool_name(&call.name, allowed) {
            None => Ok(Err(ToolError::Unknown(call.name.clone()))),
            Some(name) => {
                timeout(self.timeout, self.registry.execute(name, call.arguments.clone())).await
            }
        };

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(ToolError::Handoff(_))) => (true, "handoff"),
            Ok(Err(ToolError::Unknown(_))) => (false, "unknown"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.name,
            "call_id": call.id,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(output)) => ToolDispatch::Completed(ToolResult::ok(&call.id, output)),
            Ok(Err(ToolError::Handoff(reason))) => ToolDispatch::Handoff { reason },
            Ok(Err(e)) => ToolDispatch::Completed(ToolResult::error(&call.id, format!("Error: {}", e))),
            Err(_) => {
                let e = ToolError::Timeout(call.name.clone());
                ToolDispatch::Completed(ToolResult::error(&call.id, format!("Error: {}", e)))
            }
        }
    }
}

/// 在阶段工具中查找调用名：先精确匹配，再忽略大小写，返回规范名
pub fn canonical_tool_name<'a>(name: &str, allowed: &'a [String]) -> Option<&'a str> {
    allowed
        .iter()
        .find(|n| n.as_str() == name)
        .or_else(|| allowed.iter().find(|n| n.eq_ignore_ascii_case(name)))
        .map(String::as_str)
}

fn args_preview(args: &crate::tools::ToolArgs) -> String {
    let s = serde_json::Value::Object(args.clone()).to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{CallHumanTool, FnTool, ToolArgs, ToolOutput};

    fn executor() -> ToolExecutor {
        let mut reg = ToolRegistry::new();
        reg.register(FnTool::new("Slots", "free slots", |_| async {
            Ok(ToolOutput::from(serde_json::json!(["10:00"])))
        }));
        reg.register(FnTool::new("Broken", "always fails", |_| async {
            Err(ToolError::Execution("backend down".into()))
        }));
        reg.register(FnTool::new("Slow", "sleeps", |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ToolOutput::from("late"))
        }));
        reg.register(CallHumanTool::default());
        ToolExecutor::new(reg, 30).with_timeout(Duration::from_millis(50))
    }

    fn all() -> Vec<String> {
        vec!["Slots".into(), "Broken".into(), "Slow".into(), "CallManager".into()]
    }

    #[tokio::test]
    async fn test_success_keeps_call_id() {
        let call = ToolCall::new("c1", "Slots", ToolArgs::new());
        match executor().execute(&call, &all()).await {
            ToolDispatch::Completed(r) => {
                assert_eq!(r.call_id, "c1");
                assert!(!r.is_error);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failures_become_error_results() {
        let exec = executor();
        for name in ["Broken", "Slow", "Ghost"] {
            let call = ToolCall::new("x", name, ToolArgs::new());
            match exec.execute(&call, &all()).await {
                ToolDispatch::Completed(r) => assert!(r.is_error, "{} should be an error result", name),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_tool_outside_stage_is_unknown() {
        let call = ToolCall::new("c1", "Slots", ToolArgs::new());
        match executor().execute(&call, &["CallManager".to_string()]).await {
            ToolDispatch::Completed(r) => {
                assert!(r.is_error);
                assert!(r.output.render().contains("Slots"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_canonical_name_prefers_exact_match() {
        let allowed = vec!["CheckAvailableSlots".to_string(), "checkavailableslots".to_string()];
        assert_eq!(canonical_tool_name("checkavailableslots", &allowed), Some("checkavailableslots"));
        assert_eq!(canonical_tool_name("CHECKAVAILABLESLOTS", &allowed), Some("CheckAvailableSlots"));
        assert_eq!(canonical_tool_name("CreateBooking", &allowed), None);
    }

    #[tokio::test]
    async fn test_lowercase_name_runs_the_stage_tool() {
        let call = ToolCall::new("c1", "slots", ToolArgs::new());
        match executor().execute(&call, &all()).await {
            ToolDispatch::Completed(r) => {
                assert!(!r.is_error, "{}", r.output.render());
                assert_eq!(r.output.render(), r#"["10:00"]"#);
            }
            other => panic!("unexpected {:?}", other),
        }

        let handoff = ToolCall::new("h", "callmanager", ToolArgs::new());
        assert!(matches!(
            executor().execute(&handoff, &all()).await,
            ToolDispatch::Handoff { .. }
        ));
    }

    #[tokio::test]
    async fn test_handoff_signal() {
        let mut args = ToolArgs::new();
        args.insert("reason".into(), serde_json::Value::from("angry client"));
        let call = ToolCall::new("h", "CallManager", args);
        assert_eq!(
            executor().execute(&call, &all()).await,
            ToolDispatch::Handoff { reason: "angry client".into() }
        );
    }
}
