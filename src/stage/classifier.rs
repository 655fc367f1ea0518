//! 阶段分类器
//!
//! 一次受约束的后端调用，把用户消息映射到固定词表中的一个阶段。后端回复是自由文本，
//! 解析器必须是全函数：精确匹配 -> 首个词 -> 词边界正则（长标签优先）-> 内嵌 JSON 的 stage 字段
//! -> 子串（长标签优先）-> 安全默认阶段。后端失败同样落到安全默认阶段；调用转人工工具则给出 Escalate。

use std::sync::Arc;

use regex::Regex;

use crate::core::{FailureKind, TurnGuard};
use crate::llm::LlmClient;
use crate::memory::{ConversationContext, Turn};
use crate::react::{parse_handoff_marker, parse_tool_call_text};
use crate::stage::{Classification, StageLabel};
use crate::tools::{ToolCall, ToolSchema};

/// 指令模板中的阶段列表占位符
pub const STAGES_PLACEHOLDER: &str = "{STAGES_LIST}";

/// 默认分类指令模板
pub const DEFAULT_CLASSIFIER_TEMPLATE: &str = "Прочитай последнее сообщение клиента и ознакомься с историей переписки. \
Определи, какая стадия диалога подходит больше всего.

**СПИСОК СТАДИЙ:**
{STAGES_LIST}

Верни ТОЛЬКО одно слово - название стадии. Если клиент явно требует живого человека или \
недоволен обслуживанием, вызови инструмент передачи менеджеру.";

/// 自由文本 -> 阶段标签
#[derive(Debug, Clone)]
pub struct StageParser {
    /// 按标签长度降序，booking_to_master 先于 booking
    ordered: Vec<(StageLabel, Regex)>,
    safe: StageLabel,
}

impl StageParser {
    pub fn new(safe: StageLabel) -> Self {
        let mut labels = StageLabel::ALL.to_vec();
        labels.sort_by_key(|l| std::cmp::Reverse(l.as_str().len()));
        let ordered = labels
            .into_iter()
            .filter_map(|label| {
                Regex::new(&format!(r"\b{}\b", regex::escape(label.as_str())))
                    .ok()
                    .map(|re| (label, re))
            })
            .collect();
        Self { ordered, safe }
    }

    pub fn safe_label(&self) -> StageLabel {
        self.safe
    }

    pub fn parse(&self, raw: &str) -> StageLabel {
        let text = raw.trim().to_lowercase();

        if let Ok(label) = text.parse::<StageLabel>() {
            return label;
        }

        if let Some(label) = text
            .split_whitespace()
            .next()
            .map(|t| t.trim_matches(|c: char| !(c.is_alphanumeric() || c == '_')))
            .and_then(|t| t.parse::<StageLabel>().ok())
        {
            return label;
        }

        if let Some((label, _)) = self.ordered.iter().find(|(_, re)| re.is_match(&text)) {
            return *label;
        }

        if let Some(label) = stage_from_json(&text) {
            return label;
        }

        if let Some((label, _)) = self.ordered.iter().find(|(l, _)| text.contains(l.as_str())) {
            return *label;
        }

        tracing::warn!(
            raw = %truncate(raw, 200),
            fallback = %self.safe,
            "classifier output matched no stage, using safe default"
        );
        self.safe
    }
}

/// 第一个 '{' 到最后一个 '}' 之间的 JSON 中的 "stage" 字段
fn stage_from_json(text: &str) -> Option<StageLabel> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(&text[start..=end]).ok()?;
    value.get("stage")?.as_str()?.parse().ok()
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// 用阶段描述填充指令模板
pub fn build_instruction(template: &str, descriptions: &[(StageLabel, String)]) -> String {
    let list = descriptions
        .iter()
        .map(|(label, desc)| format!("- {}: {}", label, desc))
        .collect::<Vec<_>>()
        .join("\n");
    if template.contains(STAGES_PLACEHOLDER) {
        template.replace(STAGES_PLACEHOLDER, &list)
    } else {
        format!("{}\n\n{}", template.trim_end(), list)
    }
}

/// 阶段分类器：持有后端、分类指令与可选的转人工工具
pub struct StageClassifier {
    llm: Arc<dyn LlmClient>,
    instruction: String,
    parser: StageParser,
    handoff: Option<ToolSchema>,
}

impl StageClassifier {
    pub fn new(llm: Arc<dyn LlmClient>, instruction: impl Into<String>, safe: StageLabel) -> Self {
        Self {
            llm,
            instruction: instruction.into(),
            parser: StageParser::new(safe),
            handoff: None,
        }
    }

    /// 允许分类器直接调用转人工工具
    pub fn with_handoff_tool(mut self, schema: ToolSchema) -> Self {
        self.handoff = Some(schema);
        self
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn safe_label(&self) -> StageLabel {
        self.parser.safe_label()
    }

    pub async fn classify(&self, message: &str, context: &ConversationContext) -> Classification {
        match self.classify_guarded(message, context, &TurnGuard::unbounded()).await {
            Ok(c) => c,
            Err(_) => Classification::Stage(self.safe_label()),
        }
    }

    /// 在轮次令牌内分类；只有取消/超时返回 Err，其余情况一律给出分类
    pub async fn classify_guarded(
        &self,
        message: &str,
        context: &ConversationContext,
        guard: &TurnGuard,
    ) -> Result<Classification, FailureKind> {
        // 上下文快照 + 当前消息；不写回上下文
        let mut turns: Vec<Turn> = context.turns().to_vec();
        turns.push(Turn::user(message));
        let tools: Vec<ToolSchema> = self.handoff.iter().cloned().collect();

        let reply = match guard
            .run(self.llm.complete(&self.instruction, &tools, &turns))
            .await?
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, fallback = %self.safe_label(), "stage classification failed");
                return Ok(Classification::Stage(self.safe_label()));
            }
        };

        let handoff_name = self.handoff.as_ref().map(|s| s.name.as_str());
        if let Some(name) = handoff_name {
            let structured = reply
                .tool_calls
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(name))
                .map(handoff_reason);
            let textual = || {
                let text = reply.text.as_deref()?;
                parse_handoff_marker(text).or_else(|| {
                    parse_tool_call_text(text, Some(name))
                        .filter(|c| c.name.eq_ignore_ascii_case(name))
                        .map(|c| handoff_reason(&c))
                })
            };
            if let Some(reason) = structured.or_else(textual) {
                tracing::info!(reason = %reason, "classifier requested handoff");
                return Ok(Classification::Escalate { reason });
            }
        }
        if reply.has_tool_calls() {
            tracing::warn!(
                tools = ?reply.tool_calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                "classifier issued unexpected tool calls, ignoring them"
            );
        }

        let label = self.parser.parse(reply.text.as_deref().unwrap_or_default());
        tracing::info!(stage = %label, "stage classified");
        Ok(Classification::Stage(label))
    }
}

fn handoff_reason(call: &ToolCall) -> String {
    call.arguments
        .get("reason")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ScriptedClient, ScriptStep};
    use crate::tools::{CallHumanTool, Tool};

    fn parser() -> StageParser {
        StageParser::new(StageLabel::Greeting)
    }

    #[test]
    fn test_exact_and_first_token() {
        let p = parser();
        assert_eq!(p.parse("booking"), StageLabel::Booking);
        assert_eq!(p.parse("  RESCHEDULE \n"), StageLabel::Reschedule);
        assert_eq!(p.parse("find_window. Клиент ищет окно"), StageLabel::FindWindow);
        assert_eq!(p.parse("'view_my_booking'"), StageLabel::ViewMyBooking);
    }

    #[test]
    fn test_longest_label_wins() {
        let p = parser();
        assert_eq!(p.parse("Стадия: booking_to_master"), StageLabel::BookingToMaster);
        assert_eq!(p.parse("Стадия: booking"), StageLabel::Booking);
    }

    #[test]
    fn test_json_and_substring() {
        let p = parser();
        assert_eq!(p.parse(r#"ответ {"stage": "Cancellation_Request"}"#), StageLabel::CancellationRequest);
        assert_eq!(p.parse("prebooking?"), StageLabel::Booking);
    }

    #[test]
    fn test_total_on_garbage() {
        let p = parser();
        for raw in ["", "   ", "???", "{\"stage\": 5}", "}{", "Здравствуйте", "🙂🙂"] {
            assert_eq!(p.parse(raw), StageLabel::Greeting, "input {:?}", raw);
        }
        assert_eq!(StageParser::new(StageLabel::Fallback).parse("nonsense"), StageLabel::Fallback);
    }

    #[test]
    fn test_build_instruction_fills_placeholder() {
        let instruction = build_instruction(
            DEFAULT_CLASSIFIER_TEMPLATE,
            &[(StageLabel::Greeting, "привет".into()), (StageLabel::Booking, "запись".into())],
        );
        assert!(instruction.contains("- greeting: привет\n- booking: запись"));
        assert!(!instruction.contains(STAGES_PLACEHOLDER));

        let appended = build_instruction("Pick one.", &[(StageLabel::Fallback, "x".into())]);
        assert!(appended.ends_with("- fallback: x"));
    }

    fn handoff_schema() -> ToolSchema {
        let tool = CallHumanTool::default();
        ToolSchema {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters: tool.parameters_schema(),
        }
    }

    #[tokio::test]
    async fn test_backend_error_gives_safe_label() {
        let llm = Arc::new(ScriptedClient::new(vec![ScriptStep::Fail("boom".into())]));
        let c = StageClassifier::new(llm, "classify", StageLabel::Greeting);
        let ctx = ConversationContext::new("1");
        assert_eq!(c.classify("hi", &ctx).await, Classification::Stage(StageLabel::Greeting));
    }

    #[tokio::test]
    async fn test_handoff_tool_call_escalates() {
        let llm = Arc::new(ScriptedClient::new(vec![ScriptedClient::call(
            "h",
            "CallManager",
            serde_json::json!({"reason": "грубость"}),
        )]));
        let c = StageClassifier::new(llm.clone(), "classify", StageLabel::Greeting)
            .with_handoff_tool(handoff_schema());
        let mut ctx = ConversationContext::new("1");
        ctx.push_user("раньше");
        assert_eq!(
            c.classify("позовите человека", &ctx).await,
            Classification::Escalate { reason: "грубость".into() }
        );
        // 分类器看到历史 + 当前消息，但不改写上下文
        let req = &llm.requests()[0];
        assert_eq!(req.context.len(), 2);
        assert_eq!(req.tools, vec!["CallManager"]);
        assert_eq!(ctx.len(), 1);
    }

    #[tokio::test]
    async fn test_handoff_as_json_text() {
        let llm = Arc::new(ScriptedClient::new(vec![ScriptedClient::text(r#"{"reason": "жалоба"}"#)]));
        let c = StageClassifier::new(llm, "classify", StageLabel::Greeting)
            .with_handoff_tool(handoff_schema());
        let ctx = ConversationContext::new("1");
        assert_eq!(
            c.classify("x", &ctx).await,
            Classification::Escalate { reason: "жалоба".into() }
        );
    }

    #[tokio::test]
    async fn test_handoff_marker_and_lowercase_call() {
        let llm = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::text(r#"[CALL_MANAGER] {"reason": "спор о цене"}"#),
            ScriptedClient::call("h", "callmanager", serde_json::json!({"reason": "грубость"})),
        ]));
        let c = StageClassifier::new(llm, "classify", StageLabel::Greeting)
            .with_handoff_tool(handoff_schema());
        let ctx = ConversationContext::new("1");
        assert_eq!(
            c.classify("x", &ctx).await,
            Classification::Escalate { reason: "спор о цене".into() }
        );
        assert_eq!(
            c.classify("x", &ctx).await,
            Classification::Escalate { reason: "грубость".into() }
        );
    }
}
