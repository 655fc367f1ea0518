//! 阶段目录：各阶段的指令、描述与可用工具，启动时从 TOML 读取一次
//!
//! ```toml
//! [classifier]
//! instruction = "... {STAGES_LIST} ..."
//!
//! [stages.booking]
//! description = "клиент хочет записаться"
//! instruction = "Ты администратор салона..."
//! tools = ["GetServices", "CheckAvailableSlots", "CreateBooking", "CallManager"]
//! ```
//!
//! 文件不存在时使用内置目录；未列出的阶段在路由时落到兜底阶段（fallback），兜底阶段必须存在。

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;

use crate::core::ConfigError;
use crate::react::TurnProfile;
use crate::stage::{build_instruction, StageLabel, StageTable, DEFAULT_CLASSIFIER_TEMPLATE};
use crate::tools::CALL_HUMAN;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClassifierEntry {
    /// 分类指令模板，含 {STAGES_LIST} 占位符
    #[serde(default)]
    pub instruction: Option<String>,
    /// 分类器可调用的转人工工具；为空则分类器不带工具
    #[serde(default)]
    pub handoff_tool: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageEntry {
    #[serde(default)]
    pub description: Option<String>,
    pub instruction: String,
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StageCatalog {
    #[serde(default)]
    pub classifier: ClassifierEntry,
    #[serde(default)]
    pub stages: BTreeMap<String, StageEntry>,
}

const BASE_RULES: &str = "Ты вежливый администратор салона красоты. Отвечай кратко, по-русски, \
не выдумывай услуги, цены и свободное время, которых нет в результатах инструментов.";

fn builtin_instruction(label: StageLabel) -> &'static str {
    match label {
        StageLabel::Greeting => "Поздоровайся с клиентом и спроси, чем можешь помочь.",
        StageLabel::InformationGathering => "Ответь на вопрос клиента об услугах, ценах, мастерах или салоне.",
        StageLabel::Booking => "Помоги клиенту выбрать услугу, дату и время и оформи запись.",
        StageLabel::BookingToMaster => "Помоги клиенту записаться к выбранному мастеру.",
        StageLabel::FindWindow => "Найди свободное время, подходящее клиенту.",
        StageLabel::CancellationRequest => "Уточни, какую запись клиент хочет отменить, и отмени её.",
        StageLabel::Reschedule => "Уточни новую дату и время и перенеси запись клиента.",
        StageLabel::ViewMyBooking => "Сообщи клиенту данные его текущей записи.",
        StageLabel::CallManager => "Клиент просит менеджера: передай диалог менеджеру с кратким описанием причины.",
        StageLabel::Fallback => "Вежливо уточни, что именно нужно клиенту.",
    }
}

impl StageCatalog {
    /// 内置目录：每个阶段只带转人工工具
    pub fn builtin() -> Self {
        let stages = StageLabel::ALL
            .into_iter()
            .map(|label| {
                let tools = match label {
                    StageLabel::Greeting => Vec::new(),
                    _ => vec![CALL_HUMAN.to_string()],
                };
                (
                    label.as_str().to_string(),
                    StageEntry {
                        description: None,
                        instruction: format!("{}\n\n{}", BASE_RULES, builtin_instruction(label)),
                        tools,
                    },
                )
            })
            .collect();
        Self {
            classifier: ClassifierEntry {
                instruction: None,
                handoff_tool: Some(CALL_HUMAN.to_string()),
            },
            stages,
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// 文件存在则读取，否则使用内置目录
    pub fn load_or_builtin(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) if p.exists() => {
                tracing::info!(path = %p.display(), "loading stage catalog");
                Self::load(p)
            }
            Some(p) => {
                tracing::warn!(path = %p.display(), "stage catalog not found, using built-in stages");
                Ok(Self::builtin())
            }
            None => Ok(Self::builtin()),
        }
    }

    /// 分类指令：模板 + 全部阶段的描述
    pub fn classifier_instruction(&self) -> String {
        let descriptions: Vec<(StageLabel, String)> = StageLabel::ALL
            .into_iter()
            .map(|label| {
                let desc = self
                    .stages
                    .get(label.as_str())
                    .and_then(|e| e.description.clone())
                    .unwrap_or_else(|| label.default_description().to_string());
                (label, desc)
            })
            .collect();
        let template = self
            .classifier
            .instruction
            .as_deref()
            .unwrap_or(DEFAULT_CLASSIFIER_TEMPLATE);
        build_instruction(template, &descriptions)
    }

    pub fn handoff_tool(&self) -> Option<&str> {
        self.classifier.handoff_tool.as_deref()
    }

    /// 构造静态阶段表；键名不在词表中或缺少兜底阶段时报错
    pub fn stage_table(&self) -> Result<StageTable, ConfigError> {
        let mut profiles = HashMap::new();
        for (key, entry) in &self.stages {
            let label: StageLabel = key.parse()?;
            profiles.insert(
                label,
                TurnProfile::new(label.as_str(), entry.instruction.clone(), entry.tools.clone()),
            );
        }
        let catch_all = profiles
            .get(&StageLabel::Fallback)
            .cloned()
            .ok_or_else(|| ConfigError::MissingCatchAll(StageLabel::Fallback.to_string()))?;
        Ok(StageTable::new(profiles, catch_all))
    }
}
