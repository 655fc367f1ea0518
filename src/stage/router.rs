//! 阶段路由：分类 -> 查静态阶段表 -> 执行一个轮次
//!
//! 阶段表在构造时解析并校验一次（所有工具名必须已注册）；没有档案的标签落到兜底档案。
//! 分类器要求转人工时不再分派：用户消息写入上下文后直接产出 Escalated。

use std::collections::HashMap;

use crate::core::{ConfigError, TurnGuard, TurnOutcome};
use crate::memory::ConversationContext;
use crate::react::{TurnExecutor, TurnProfile};
use crate::stage::{Classification, StageClassifier, StageLabel};
use crate::tools::ToolRegistry;

/// 静态阶段表：标签 -> 档案，外加兜底档案
#[derive(Debug, Clone)]
pub struct StageTable {
    profiles: HashMap<StageLabel, TurnProfile>,
    catch_all: TurnProfile,
}

impl StageTable {
    pub fn new(profiles: HashMap<StageLabel, TurnProfile>, catch_all: TurnProfile) -> Self {
        Self { profiles, catch_all }
    }

    pub fn resolve(&self, label: StageLabel) -> &TurnProfile {
        self.profiles.get(&label).unwrap_or(&self.catch_all)
    }

    /// 每个档案引用的工具都必须已注册
    pub fn validate(&self, registry: &ToolRegistry) -> Result<(), ConfigError> {
        for profile in self.profiles.values().chain(std::iter::once(&self.catch_all)) {
            if let Some(tool) = profile.tools.iter().find(|t| !registry.contains(t)) {
                return Err(ConfigError::UnknownTool {
                    stage: profile.name.clone(),
                    tool: tool.clone(),
                });
            }
        }
        Ok(())
    }
}

/// 路由结果的统一记录
#[derive(Debug, Clone)]
pub struct RoutedTurn {
    /// 取消/超时发生在分类阶段时为 None
    pub classification: Option<Classification>,
    pub outcome: TurnOutcome,
    pub tools_used: Vec<String>,
    pub rounds: usize,
}

impl RoutedTurn {
    pub fn stage(&self) -> Option<StageLabel> {
        self.classification.as_ref().and_then(Classification::label)
    }
}

pub struct StageRouter {
    classifier: StageClassifier,
    executor: TurnExecutor,
    table: StageTable,
}

impl StageRouter {
    pub fn new(
        classifier: StageClassifier,
        executor: TurnExecutor,
        table: StageTable,
    ) -> Result<Self, ConfigError> {
        table.validate(executor.tools().registry())?;
        Ok(Self {
            classifier,
            executor,
            table,
        })
    }

    pub fn table(&self) -> &StageTable {
        &self.table
    }

    pub async fn handle(&self, message: &str, context: &mut ConversationContext) -> TurnOutcome {
        self.route(message, context, &TurnGuard::unbounded())
            .await
            .outcome
    }

    pub async fn route(
        &self,
        message: &str,
        context: &mut ConversationContext,
        guard: &TurnGuard,
    ) -> RoutedTurn {
        let classification = match self
            .classifier
            .classify_guarded(message, context, guard)
            .await
        {
            Ok(c) => c,
            Err(kind) => {
                tracing::warn!(conversation = %context.id(), error = %kind, "turn aborted during classification");
                let outcome = TurnOutcome::Failed(kind);
                self.executor.observer().on_outcome(&outcome);
                return RoutedTurn {
                    classification: None,
                    outcome,
                    tools_used: Vec::new(),
                    rounds: 0,
                };
            }
        };

        match &classification {
            Classification::Escalate { reason } => {
                tracing::info!(conversation = %context.id(), reason = %reason, "classifier escalation");
                context.push_user(message);
                let outcome = TurnOutcome::Escalated(self.executor.escalation().build(reason, context));
                self.executor.observer().on_outcome(&outcome);
                RoutedTurn {
                    classification: Some(classification.clone()),
                    outcome,
                    tools_used: Vec::new(),
                    rounds: 0,
                }
            }
            Classification::Stage(label) => {
                let profile = self.table.resolve(*label);
                tracing::info!(
                    conversation = %context.id(),
                    stage = %label,
                    profile = %profile.name,
                    "routing turn"
                );
                self.executor.observer().on_stage(label.as_str());
                let report = self
                    .executor
                    .run_with_report(profile, context, message, guard)
                    .await;
                RoutedTurn {
                    classification: Some(classification.clone()),
                    outcome: report.outcome,
                    tools_used: report.tools_used,
                    rounds: report.rounds,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::llm::ScriptedClient;
    use crate::tools::{CallHumanTool, ToolExecutor};

    fn table() -> StageTable {
        let mut profiles = HashMap::new();
        profiles.insert(
            StageLabel::Greeting,
            TurnProfile::new("greeting", "greet", vec![]),
        );
        StageTable::new(
            profiles,
            TurnProfile::new("fallback", "clarify", vec!["CallManager".into()]),
        )
    }

    #[test]
    fn test_validate_rejects_unregistered_tools() {
        let empty = ToolRegistry::new();
        assert!(matches!(
            table().validate(&empty),
            Err(ConfigError::UnknownTool { .. })
        ));
        let mut reg = ToolRegistry::new();
        reg.register(CallHumanTool::default());
        assert!(table().validate(&reg).is_ok());
    }

    #[tokio::test]
    async fn test_unmapped_label_uses_catch_all() {
        let classifier_llm = Arc::new(ScriptedClient::new(vec![ScriptedClient::text("reschedule")]));
        let turn_llm = Arc::new(ScriptedClient::new(vec![ScriptedClient::text("Уточните, пожалуйста")]));
        let mut reg = ToolRegistry::new();
        reg.register(CallHumanTool::default());
        let executor = TurnExecutor::new(turn_llm.clone(), Arc::new(ToolExecutor::new(reg, 5)));
        let classifier = StageClassifier::new(classifier_llm, "classify", StageLabel::Greeting);
        let router = StageRouter::new(classifier, executor, table()).unwrap();

        let mut ctx = ConversationContext::new("5");
        let routed = router.route("перенести", &mut ctx, &TurnGuard::unbounded()).await;
        assert_eq!(routed.stage(), Some(StageLabel::Reschedule));
        assert!(routed.outcome.is_reply());
        assert_eq!(turn_llm.requests()[0].instruction, "clarify");
    }
}
