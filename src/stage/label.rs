//! 阶段标签：固定词表，每个轮次计算一次，不持久化

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::ConfigError;

/// 对话阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageLabel {
    Greeting,
    InformationGathering,
    Booking,
    BookingToMaster,
    FindWindow,
    CancellationRequest,
    Reschedule,
    ViewMyBooking,
    CallManager,
    Fallback,
}

impl StageLabel {
    pub const ALL: [StageLabel; 10] = [
        StageLabel::Greeting,
        StageLabel::InformationGathering,
        StageLabel::Booking,
        StageLabel::BookingToMaster,
        StageLabel::FindWindow,
        StageLabel::CancellationRequest,
        StageLabel::Reschedule,
        StageLabel::ViewMyBooking,
        StageLabel::CallManager,
        StageLabel::Fallback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageLabel::Greeting => "greeting",
            StageLabel::InformationGathering => "information_gathering",
            StageLabel::Booking => "booking",
            StageLabel::BookingToMaster => "booking_to_master",
            StageLabel::FindWindow => "find_window",
            StageLabel::CancellationRequest => "cancellation_request",
            StageLabel::Reschedule => "reschedule",
            StageLabel::ViewMyBooking => "view_my_booking",
            StageLabel::CallManager => "call_manager",
            StageLabel::Fallback => "fallback",
        }
    }

    /// 分类指令里列出的默认描述（阶段目录可覆盖）
    pub fn default_description(&self) -> &'static str {
        match self {
            StageLabel::Greeting => "клиент здоровается или начинает диалог без конкретного запроса",
            StageLabel::InformationGathering => "вопросы об услугах, ценах, мастерах, адресе и режиме работы",
            StageLabel::Booking => "клиент хочет записаться на услугу",
            StageLabel::BookingToMaster => "клиент хочет записаться к конкретному мастеру",
            StageLabel::FindWindow => "клиент ищет свободное время или окно",
            StageLabel::CancellationRequest => "клиент хочет отменить запись",
            StageLabel::Reschedule => "клиент хочет перенести запись на другое время",
            StageLabel::ViewMyBooking => "клиент спрашивает о своей текущей записи",
            StageLabel::CallManager => "клиент просит позвать менеджера или живого человека",
            StageLabel::Fallback => "сообщение не подходит ни под одну стадию",
        }
    }
}

impl fmt::Display for StageLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageLabel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        StageLabel::ALL
            .into_iter()
            .find(|l| l.as_str() == needle)
            .ok_or_else(|| ConfigError::UnknownStage(s.to_string()))
    }
}

/// 分类结果：阶段标签，或分类器直接要求转人工
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Stage(StageLabel),
    Escalate { reason: String },
}

impl Classification {
    pub fn label(&self) -> Option<StageLabel> {
        match self {
            Classification::Stage(l) => Some(*l),
            Classification::Escalate { .. } => None,
        }
    }
}
