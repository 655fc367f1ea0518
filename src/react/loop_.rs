//! 轮次主循环
//!
//! 用户消息 -> 调后端（带阶段指令与工具 schema）-> 若有工具调用则执行并把整轮结果写回上下文 -> 再调后端，
//! 直到后端给出最终文本。后端瞬时错误按 RetryPolicy 重试（不重复追加用户消息），耗尽后转人工；
//! 转人工工具出现时只执行它并立即结束；工具轮数超过上限则失败。每一步都在 TurnGuard 内等待。

use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;
use tracing::Instrument;

use crate::config::TurnSection;
use crate::core::{
    EscalationHandler, FailureKind, RecoveryAction, RetryPolicy, RetryState, TurnGuard, TurnOutcome,
};
use crate::llm::{LlmClient, LlmReply};
use crate::memory::ConversationContext;
use crate::react::{
    fallback_call, parse_handoff_marker, parse_tool_call_text, NoopObserver, TurnObserver,
};
use crate::tools::{
    canonical_tool_name, ToolArgs, ToolCall, ToolDispatch, ToolExecutor, ToolResult, ToolSchema,
};

/// 循环参数
#[derive(Debug, Clone)]
pub struct TurnSettings {
    /// 单个轮次内最多执行的工具轮数
    pub max_rounds: usize,
    /// 同一轮的多个调用并发执行
    pub parallel_tools: bool,
    /// 把整段 JSON 文本回复当作工具调用
    pub json_tool_fallback: bool,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self::from_config(&TurnSection::default())
    }
}

impl TurnSettings {
    pub fn from_config(section: &TurnSection) -> Self {
        Self {
            max_rounds: section.max_rounds,
            parallel_tools: section.parallel_tools,
            json_tool_fallback: section.json_tool_fallback,
        }
    }
}

/// 一次执行所用的阶段档案：指令 + 可用工具
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnProfile {
    pub name: String,
    pub instruction: String,
    pub tools: Vec<String>,
}

impl TurnProfile {
    pub fn new(name: impl Into<String>, instruction: impl Into<String>, tools: Vec<String>) -> Self {
        Self {
            name: name.into(),
            instruction: instruction.into(),
            tools,
        }
    }
}

/// 执行记录：结果 + 实际执行过的工具、工具轮数、后端调用次数
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub outcome: TurnOutcome,
    pub tools_used: Vec<String>,
    pub rounds: usize,
    pub backend_calls: u32,
}

/// 轮次执行器
pub struct TurnExecutor {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolExecutor>,
    retry: RetryPolicy,
    escalation: EscalationHandler,
    settings: TurnSettings,
    observer: Arc<dyn TurnObserver>,
}

impl TurnExecutor {
    pub fn new(llm: Arc<dyn LlmClient>, tools: Arc<ToolExecutor>) -> Self {
        Self {
            llm,
            tools,
            retry: RetryPolicy::default(),
            escalation: EscalationHandler::default(),
            settings: TurnSettings::default(),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_escalation(mut self, escalation: EscalationHandler) -> Self {
        self.escalation = escalation;
        self
    }

    pub fn with_settings(mut self, settings: TurnSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn TurnObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn tools(&self) -> &ToolExecutor {
        &self.tools
    }

    pub fn escalation(&self) -> &EscalationHandler {
        &self.escalation
    }

    pub fn observer(&self) -> &Arc<dyn TurnObserver> {
        &self.observer
    }

    pub async fn run(
        &self,
        profile: &TurnProfile,
        context: &mut ConversationContext,
        user_message: &str,
        guard: &TurnGuard,
    ) -> TurnOutcome {
        self.run_with_report(profile, context, user_message, guard)
            .await
            .outcome
    }

    pub async fn run_with_report(
        &self,
        profile: &TurnProfile,
        context: &mut ConversationContext,
        user_message: &str,
        guard: &TurnGuard,
    ) -> TurnReport {
        let span = tracing::info_span!(
            "turn",
            conversation = %context.id(),
            stage = %profile.name,
        );
        async move {
            let mut report = TurnReport {
                outcome: TurnOutcome::Failed(FailureKind::Cancelled),
                tools_used: Vec::new(),
                rounds: 0,
                backend_calls: 0,
            };
            let outcome = self.drive(profile, context, user_message, guard, &mut report).await;
            report.outcome = outcome;

            match &report.outcome {
                TurnOutcome::Reply(_) => tracing::info!(
                    rounds = report.rounds,
                    backend_calls = report.backend_calls,
                    "turn finished with reply"
                ),
                TurnOutcome::Escalated(e) => tracing::warn!(reason = %e.reason, "turn escalated"),
                TurnOutcome::Failed(kind) => tracing::error!(error = %kind, "turn failed"),
            }
            self.observer.on_outcome(&report.outcome);
            report
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        profile: &TurnProfile,
        context: &mut ConversationContext,
        user_message: &str,
        guard: &TurnGuard,
        report: &mut TurnReport,
    ) -> TurnOutcome {
        // 用户消息只追加一次；重试复用同一份上下文
        context.push_user(user_message);

        let schemas = self.tools.registry().schemas(&profile.tools);
        let handoff_tool = profile
            .tools
            .iter()
            .find(|name| self.tools.is_handoff(name))
            .map(String::as_str);
        let mut retry_state = RetryState::default();

        loop {
            let reply = match self
                .call_backend(profile, &schemas, context, guard, &mut retry_state, report)
                .await
            {
                Ok(reply) => reply,
                Err(outcome) => return outcome,
            };

            let LlmReply { text, tool_calls } = reply;
            let mut calls = tool_calls;
            let mut content = text;
            if calls.is_empty() && self.settings.json_tool_fallback {
                if let Some(reason) = content.as_deref().and_then(parse_handoff_marker) {
                    // 标记文本不能作为回复发出去
                    let Some(name) = handoff_tool else {
                        tracing::warn!("handoff marker in reply but stage has no handoff tool, escalating");
                        return TurnOutcome::Escalated(self.escalation.build(&reason, context));
                    };
                    tracing::warn!(tool = %name, "backend wrote a handoff marker as text, calling the handoff tool");
                    let mut arguments = ToolArgs::new();
                    arguments.insert("reason".into(), Value::String(reason));
                    calls.push(fallback_call(name, arguments));
                    content = None;
                } else if let Some(call) = content
                    .as_deref()
                    .and_then(|t| parse_tool_call_text(t, handoff_tool))
                {
                    tracing::warn!(tool = %call.name, "backend wrote a tool call as text, executing it");
                    calls.push(call);
                    content = None;
                }
            }

            if calls.is_empty() {
                let text = content.as_deref().map(str::trim).unwrap_or_default();
                if text.is_empty() {
                    return TurnOutcome::Failed(FailureKind::MalformedBackendResponse(
                        "empty reply without tool calls".to_string(),
                    ));
                }
                context.push_assistant(text);
                return TurnOutcome::Reply(text.to_string());
            }

            // 名字按阶段工具对齐（部分后端会把工具名转成小写）
            for call in &mut calls {
                if let Some(canonical) = canonical_tool_name(&call.name, &profile.tools) {
                    if canonical != call.name {
                        tracing::debug!(requested = %call.name, tool = %canonical, "tool name matched ignoring case");
                        call.name = canonical.to_string();
                    }
                }
            }
            let content = content.filter(|c| !c.trim().is_empty());

            // 转人工工具优先：只执行它，同轮其余调用丢弃；不受工具轮数上限限制
            if let Some(call) = calls
                .iter()
                .find(|c| profile.tools.contains(&c.name) && self.tools.is_handoff(&c.name))
                .cloned()
            {
                if calls.len() > 1 {
                    tracing::warn!(
                        tool = %call.name,
                        dropped = calls.len() - 1,
                        "handoff requested, sibling tool calls are not executed"
                    );
                }
                report.tools_used.push(call.name.clone());
                let dispatch = match guard.run(self.tools.execute(&call, &profile.tools)).await {
                    Ok(d) => d,
                    Err(kind) => return TurnOutcome::Failed(kind),
                };
                match dispatch {
                    ToolDispatch::Handoff { reason } => {
                        return TurnOutcome::Escalated(self.escalation.build(&reason, context));
                    }
                    ToolDispatch::Completed(result) => {
                        if report.rounds >= self.settings.max_rounds {
                            return TurnOutcome::Failed(FailureKind::IterationLimitExceeded(
                                self.settings.max_rounds,
                            ));
                        }
                        report.rounds += 1;
                        self.observer.on_tool_call(&call, &result);
                        context.push_tool_round(content, vec![(call, result)]);
                        continue;
                    }
                }
            }

            if report.rounds >= self.settings.max_rounds {
                return TurnOutcome::Failed(FailureKind::IterationLimitExceeded(
                    self.settings.max_rounds,
                ));
            }
            report.rounds += 1;

            let dispatches = match guard.run(self.execute_round(&calls, &profile.tools)).await {
                Ok(d) => d,
                Err(kind) => return TurnOutcome::Failed(kind),
            };
            report.tools_used.extend(calls.iter().map(|c| c.name.clone()));

            let mut round: Vec<(ToolCall, ToolResult)> = Vec::with_capacity(calls.len());
            for (call, dispatch) in calls.into_iter().zip(dispatches) {
                match dispatch {
                    ToolDispatch::Handoff { reason } => {
                        return TurnOutcome::Escalated(self.escalation.build(&reason, context));
                    }
                    ToolDispatch::Completed(result) => round.push((call, result)),
                }
            }
            for (call, result) in &round {
                self.observer.on_tool_call(call, result);
            }
            context.push_tool_round(content, round);
        }
    }

    /// 调后端；瞬时错误在此处重试，Err 为本轮终值
    async fn call_backend(
        &self,
        profile: &TurnProfile,
        schemas: &[ToolSchema],
        context: &ConversationContext,
        guard: &TurnGuard,
        state: &mut RetryState,
        report: &mut TurnReport,
    ) -> Result<LlmReply, TurnOutcome> {
        loop {
            report.backend_calls += 1;
            let result = guard
                .run(self.llm.complete(&profile.instruction, schemas, context.turns()))
                .await
                .map_err(TurnOutcome::Failed)?;

            let err = match result {
                Ok(reply) => {
                    state.reset();
                    return Ok(reply);
                }
                Err(err) => err,
            };

            match self.retry.decide(state, err.clone()) {
                RecoveryAction::Retry(backoff) => {
                    tracing::warn!(
                        attempt = state.attempts,
                        max_attempts = self.retry.max_attempts(),
                        error = %err,
                        "transient backend error, retrying"
                    );
                    self.observer.on_retry(state.attempts, &err);
                    if !backoff.is_zero() {
                        guard
                            .run(tokio::time::sleep(backoff))
                            .await
                            .map_err(TurnOutcome::Failed)?;
                    }
                }
                RecoveryAction::Escalate => {
                    tracing::warn!(attempts = state.attempts, error = %err, "retries exhausted, escalating");
                    let reason = self.escalation.transient_reason(&err.message);
                    return Err(TurnOutcome::Escalated(self.escalation.build(&reason, context)));
                }
                RecoveryAction::Abort(message) => {
                    tracing::error!(error = %message, "backend rejected request");
                    return Err(TurnOutcome::Failed(FailureKind::BackendRejected(message)));
                }
            }
        }
    }

    /// 执行一轮调用；返回顺序与调用顺序一致（与完成先后无关）
    async fn execute_round(&self, calls: &[ToolCall], allowed: &[String]) -> Vec<ToolDispatch> {
        if self.settings.parallel_tools {
            join_all(calls.iter().map(|call| self.tools.execute(call, allowed))).await
        } else {
            let mut out = Vec::with_capacity(calls.len());
            for call in calls {
                out.push(self.tools.execute(call, allowed).await);
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::ToolError;
    use crate::llm::{tool_call, ScriptedClient};
    use crate::memory::Role;
    use crate::tools::{CallHumanTool, FnTool, ToolArgs, ToolOutput, ToolRegistry};

    fn tools() -> Arc<ToolExecutor> {
        let mut reg = ToolRegistry::new();
        reg.register(FnTool::new("GetServices", "list services", |_| async {
            Ok(ToolOutput::from("manicure, pedicure"))
        }));
        reg.register(FnTool::new("Broken", "fails", |_| async {
            Err(ToolError::Execution("db offline".into()))
        }));
        reg.register(CallHumanTool::default());
        Arc::new(ToolExecutor::new(reg, 5))
    }

    fn profile() -> TurnProfile {
        TurnProfile::new(
            "information_gathering",
            "answer questions",
            vec!["GetServices".into(), "Broken".into(), "CallManager".into()],
        )
    }

    fn executor(llm: Arc<ScriptedClient>) -> TurnExecutor {
        TurnExecutor::new(llm, tools()).with_retry(RetryPolicy::new(3).with_backoff(Duration::ZERO))
    }

    #[tokio::test]
    async fn test_plain_reply() {
        let llm = Arc::new(ScriptedClient::new(vec![ScriptedClient::text("Здравствуйте!")]));
        let mut ctx = ConversationContext::new("1");
        let report = executor(llm)
            .run_with_report(&profile(), &mut ctx, "привет", &TurnGuard::unbounded())
            .await;
        assert_eq!(report.outcome, TurnOutcome::Reply("Здравствуйте!".into()));
        assert_eq!(report.rounds, 0);
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.turns()[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_tool_error_is_written_back_and_turn_continues() {
        let llm = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::call("c1", "Broken", serde_json::json!({})),
            ScriptedClient::text("Извините, попробуйте позже"),
        ]));
        let mut ctx = ConversationContext::new("1");
        let outcome = executor(llm.clone())
            .run(&profile(), &mut ctx, "запиши меня", &TurnGuard::unbounded())
            .await;
        assert!(outcome.is_reply());
        // user, assistant(call), tool(error), assistant(text)
        assert_eq!(ctx.len(), 4);
        assert_eq!(ctx.turns()[2].tool_call_id.as_deref(), Some("c1"));
        assert!(ctx.turns()[2].content.contains("db offline"));
        // 第二次请求能看到工具结果
        assert_eq!(llm.requests()[1].context.len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_error_result() {
        let llm = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::call("c1", "DeleteEverything", serde_json::json!({})),
            ScriptedClient::text("ok"),
        ]));
        let mut ctx = ConversationContext::new("1");
        let outcome = executor(llm)
            .run(&profile(), &mut ctx, "x", &TurnGuard::unbounded())
            .await;
        assert!(outcome.is_reply());
        assert!(ctx.turns()[2].content.contains("Unknown tool"));
    }

    #[tokio::test]
    async fn test_empty_reply_is_malformed() {
        let llm = Arc::new(ScriptedClient::new(vec![ScriptedClient::text("   ")]));
        let mut ctx = ConversationContext::new("1");
        let outcome = executor(llm)
            .run(&profile(), &mut ctx, "x", &TurnGuard::unbounded())
            .await;
        assert!(matches!(
            outcome,
            TurnOutcome::Failed(FailureKind::MalformedBackendResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_fatal_backend_error_is_not_retried() {
        let llm = Arc::new(ScriptedClient::new(vec![ScriptedClient::fail("401 invalid api key")]));
        let mut ctx = ConversationContext::new("1");
        let outcome = executor(llm.clone())
            .run(&profile(), &mut ctx, "x", &TurnGuard::unbounded())
            .await;
        assert_eq!(
            outcome,
            TurnOutcome::Failed(FailureKind::BackendRejected("401 invalid api key".into()))
        );
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_json_text_fallback_handoff() {
        let llm = Arc::new(ScriptedClient::new(vec![ScriptedClient::text(
            r#"{"reason": "клиент требует менеджера"}"#,
        )]));
        let mut ctx = ConversationContext::new("77");
        let outcome = executor(llm)
            .run(&profile(), &mut ctx, "позовите менеджера", &TurnGuard::unbounded())
            .await;
        match outcome {
            TurnOutcome::Escalated(e) => assert_eq!(e.reason, "клиент требует менеджера"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_json_fallback_can_be_disabled() {
        let llm = Arc::new(ScriptedClient::new(vec![ScriptedClient::text(
            r#"{"tool": "GetServices", "arguments": {}}"#,
        )]));
        let mut ctx = ConversationContext::new("1");
        let settings = TurnSettings {
            json_tool_fallback: false,
            ..TurnSettings::default()
        };
        let outcome = executor(llm)
            .with_settings(settings)
            .run(&profile(), &mut ctx, "x", &TurnGuard::unbounded())
            .await;
        assert!(outcome.is_reply());
    }

    #[tokio::test]
    async fn test_json_text_tool_call_runs_and_is_written_back() {
        let llm = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::text("```json\n{\"tool\": \"GetServices\", \"arguments\": {}}\n```"),
            ScriptedClient::text("Делаем маникюр и педикюр."),
        ]));
        let mut ctx = ConversationContext::new("1");
        let report = executor(llm.clone())
            .run_with_report(&profile(), &mut ctx, "что вы делаете?", &TurnGuard::unbounded())
            .await;

        assert_eq!(report.outcome, TurnOutcome::Reply("Делаем маникюр и педикюр.".into()));
        assert_eq!(report.tools_used, vec!["GetServices"]);
        assert_eq!(report.rounds, 1);
        let turns = ctx.turns();
        assert_eq!(turns.len(), 4);
        assert!(turns[1].tool_calls[0].id.starts_with("fallback_"));
        assert_eq!(turns[2].tool_call_id.as_deref(), Some(turns[1].tool_calls[0].id.as_str()));
        assert_eq!(turns[2].content, "manicure, pedicure");
        assert_eq!(llm.requests()[1].context[2].content, "manicure, pedicure");
    }

    #[tokio::test]
    async fn test_handoff_marker_text_escalates() {
        let llm = Arc::new(ScriptedClient::new(vec![ScriptedClient::text(
            r#"[CALL_MANAGER] {"reason": "клиент недоволен"}"#,
        )]));
        let mut ctx = ConversationContext::new("5");
        let report = executor(llm)
            .run_with_report(&profile(), &mut ctx, "это безобразие", &TurnGuard::unbounded())
            .await;

        let TurnOutcome::Escalated(escalation) = &report.outcome else {
            panic!("expected escalation, got {:?}", report.outcome);
        };
        assert_eq!(escalation.reason, "клиент недоволен");
        assert!(!escalation.user_message.contains("[CALL_MANAGER]"));
        assert_eq!(report.tools_used, vec!["CallManager"]);
        assert_eq!(ctx.len(), 1);
    }

    #[tokio::test]
    async fn test_handoff_marker_without_handoff_tool_still_escalates() {
        let llm = Arc::new(ScriptedClient::new(vec![ScriptedClient::text("[CALL_MANAGER]")]));
        let narrow = TurnProfile::new("greeting", "hi", vec![]);
        let mut ctx = ConversationContext::new("5");
        let outcome = executor(llm)
            .run(&narrow, &mut ctx, "позовите менеджера", &TurnGuard::unbounded())
            .await;
        match outcome {
            TurnOutcome::Escalated(e) => assert_eq!(e.reason, "Клиент запросил связь с менеджером"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lowercase_tool_name_uses_stage_tool() {
        let llm = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::call("c1", "getservices", serde_json::json!({})),
            ScriptedClient::text("Маникюр и педикюр."),
        ]));
        let mut ctx = ConversationContext::new("1");
        let report = executor(llm)
            .run_with_report(&profile(), &mut ctx, "услуги?", &TurnGuard::unbounded())
            .await;
        assert!(report.outcome.is_reply());
        assert_eq!(report.tools_used, vec!["GetServices"]);
        assert_eq!(ctx.turns()[1].tool_calls[0].name, "GetServices");
        assert_eq!(ctx.turns()[2].content, "manicure, pedicure");
    }

    #[tokio::test]
    async fn test_handoff_at_round_cap_still_escalates() {
        let llm = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::call("a", "GetServices", serde_json::json!({})),
            ScriptedClient::call("b", "GetServices", serde_json::json!({})),
            ScriptedClient::call("h", "CallManager", serde_json::json!({"reason": "зациклились"})),
        ]));
        let settings = TurnSettings {
            max_rounds: 2,
            ..TurnSettings::default()
        };
        let mut ctx = ConversationContext::new("1");
        let report = executor(llm.clone())
            .with_settings(settings)
            .run_with_report(&profile(), &mut ctx, "x", &TurnGuard::unbounded())
            .await;
        match &report.outcome {
            TurnOutcome::Escalated(e) => assert_eq!(e.reason, "зациклились"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(report.rounds, 2);
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn test_tool_outside_profile_is_not_a_handoff() {
        let llm = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::calls(vec![tool_call("h", "CallManager", serde_json::json!({"reason": "x"}))]),
            ScriptedClient::text("ok"),
        ]));
        let narrow = TurnProfile::new("greeting", "hi", vec!["GetServices".into()]);
        let mut ctx = ConversationContext::new("1");
        let outcome = executor(llm)
            .run(&narrow, &mut ctx, "x", &TurnGuard::unbounded())
            .await;
        assert!(outcome.is_reply());
        assert!(ctx.turns()[2].content.contains("Unknown tool"));
    }

    #[tokio::test]
    async fn test_sequential_mode_keeps_order() {
        let llm = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::calls(vec![
                ToolCall::new("a", "GetServices", ToolArgs::new()),
                ToolCall::new("b", "Broken", ToolArgs::new()),
            ]),
            ScriptedClient::text("done"),
        ]));
        let mut ctx = ConversationContext::new("1");
        let settings = TurnSettings {
            parallel_tools: false,
            ..TurnSettings::default()
        };
        let report = executor(llm)
            .with_settings(settings)
            .run_with_report(&profile(), &mut ctx, "x", &TurnGuard::unbounded())
            .await;
        assert!(report.outcome.is_reply());
        assert_eq!(report.tools_used, vec!["GetServices", "Broken"]);
        assert_eq!(ctx.turns()[2].tool_call_id.as_deref(), Some("a"));
        assert_eq!(ctx.turns()[3].tool_call_id.as_deref(), Some("b"));
    }
}
