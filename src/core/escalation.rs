//! 转人工：为管理员生成报告，为用户生成中性的占位回复
//!
//! 报告包含对话外部身份的链接、原因与最近 N 条轮次；用户永远看不到原始错误文本。

use serde::{Deserialize, Serialize};

use crate::config::EscalationSection;
use crate::memory::{ConversationContext, Role, Turn};

/// 转人工结果：发给用户的占位消息 + 发给管理员的报告
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub user_message: String,
    pub manager_report: String,
    pub reason: String,
}

/// 转人工报告生成器（终态，不含重试逻辑）
#[derive(Debug, Clone)]
pub struct EscalationHandler {
    excerpt_turns: usize,
    excerpt_chars: usize,
    user_message: String,
    deep_link_template: String,
    transient_reason: String,
}

impl Default for EscalationHandler {
    fn default() -> Self {
        Self::from_config(&EscalationSection::default())
    }
}

impl EscalationHandler {
    pub fn from_config(section: &EscalationSection) -> Self {
        Self {
            excerpt_turns: section.excerpt_turns,
            excerpt_chars: section.excerpt_chars,
            user_message: section.user_message.clone(),
            deep_link_template: section.deep_link_template.clone(),
            transient_reason: section.transient_reason.clone(),
        }
    }

    pub fn with_excerpt_turns(mut self, n: usize) -> Self {
        self.excerpt_turns = n;
        self
    }

    pub fn with_user_message(mut self, message: impl Into<String>) -> Self {
        self.user_message = message.into();
        self
    }

    /// 模板中的 {id} 替换为对话标识，例如 `[{id}](tg://user?id={id})`
    pub fn deep_link(&self, conversation_id: &str) -> String {
        self.deep_link_template.replace("{id}", conversation_id)
    }

    /// 重试耗尽时的原因文本，模板中的 {error} 替换为最后一次错误
    pub fn transient_reason(&self, error: &str) -> String {
        self.transient_reason.replace("{error}", error)
    }

    pub fn build(&self, reason: &str, context: &ConversationContext) -> Escalation {
        let reason = if reason.trim().is_empty() {
            "Причина не указана"
        } else {
            reason.trim()
        };

        let mut lines = vec![
            "--- MANAGER ALERT ---".to_string(),
            format!("Клиент: {}", self.deep_link(context.id())),
            String::new(),
            "Отчет для менеджера:".to_string(),
            format!("Причина: {reason}"),
            String::new(),
        ];

        let excerpt = context.last(self.excerpt_turns);
        if excerpt.is_empty() {
            lines.push("История сообщений недоступна".to_string());
        } else {
            lines.push("История последних сообщений:".to_string());
            lines.extend(excerpt.iter().map(|t| self.render_turn(t)));
        }

        Escalation {
            user_message: self.user_message.clone(),
            manager_report: lines.join("\n"),
            reason: reason.to_string(),
        }
    }

    fn render_turn(&self, turn: &Turn) -> String {
        let content = if turn.role == Role::Assistant && turn.content.is_empty() && !turn.tool_calls.is_empty() {
            let names: Vec<&str> = turn.tool_calls.iter().map(|c| c.name.as_str()).collect();
            format!("[{}]", names.join(", "))
        } else {
            truncate(&turn.content, self.excerpt_chars)
        };
        format!("- {}: {}", turn.role.as_str(), content)
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s.to_string()
    }
}
