//! Headless 运行时
//!
//! 供传输层（Telegram、HTTP 等）调用的无界面入口：from_config 构建后端、工具注册表、阶段目录与路由，
//! process_message 对单条用户消息跑一个完整轮次并给出发给用户的文本与（可选的）管理员报告。
//! 同一对话的轮次串行执行；每个轮次带整体超时，可被取消。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;

use crate::config::AppConfig;
use crate::core::{
    ConfigError, ConversationHub, EscalationHandler, RetryPolicy, TurnGuard, TurnOutcome,
};
use crate::llm::{create_deepseek_client, EchoClient, LlmClient, OpenAiClient, DEEPSEEK_CHAT};
use crate::memory::ConversationContext;
use crate::react::{TurnExecutor, TurnObserver, TurnSettings};
use crate::stage::{StageCatalog, StageClassifier, StageLabel, StageRouter};
use crate::tools::{CallHumanTool, HttpTool, ToolExecutor, ToolRegistry};

/// 一次处理的对外结果（可序列化后交给传输层）
#[derive(Debug, Clone, Serialize)]
pub struct AgentResponse {
    /// 发给用户的文本（回复、转人工占位或致歉）
    pub user_message: String,
    /// 转人工时发给管理员的报告
    pub manager_alert: Option<String>,
    pub stage: Option<StageLabel>,
    pub tools_used: Vec<String>,
    pub outcome: TurnOutcome,
}

/// 按配置选择后端：有 Key 用 DeepSeek / OpenAI 兼容端点，否则本地回显
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let explicit_key = std::env::var("CONCIERGE_API_KEY").ok();
    let deepseek_key = std::env::var("DEEPSEEK_API_KEY").ok();
    let openai_key = std::env::var("OPENAI_API_KEY").ok();
    let timeout = Duration::from_secs(cfg.llm.timeouts.request.max(1));

    let use_deepseek = provider == "deepseek"
        && (explicit_key.is_some() || deepseek_key.is_some() || openai_key.is_some());
    let use_openai = provider != "deepseek" && (explicit_key.is_some() || openai_key.is_some());

    if use_deepseek {
        let model = cfg.llm.model.clone().unwrap_or_else(|| DEEPSEEK_CHAT.to_string());
        tracing::info!("Using DeepSeek LLM ({})", model);
        let key = explicit_key.or(deepseek_key).or(openai_key);
        let client = match cfg.llm.base_url.as_deref() {
            Some(base) => OpenAiClient::new(Some(base), &model, key.as_deref()),
            None => create_deepseek_client(Some(model.as_str()), key.as_deref()),
        };
        Arc::new(
            client
                .with_temperature(cfg.llm.temperature)
                .with_request_timeout(timeout),
        )
    } else if use_openai {
        let model = cfg.llm.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
        tracing::info!("Using OpenAI-compatible LLM ({})", model);
        let key = explicit_key.or(openai_key);
        Arc::new(
            OpenAiClient::new(cfg.llm.base_url.as_deref(), &model, key.as_deref())
                .with_temperature(cfg.llm.temperature)
                .with_request_timeout(timeout),
        )
    } else {
        tracing::warn!("No API key set or provider unknown, using local echo backend");
        Arc::new(EchoClient)
    }
}

/// 注册转人工工具与配置中声明的 HTTP 工具
pub fn create_registry_from_config(cfg: &AppConfig) -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(CallHumanTool::new(cfg.tools.call_human.clone()));
    for entry in &cfg.tools.http {
        tools.register(HttpTool::new(entry, cfg.tools.tool_timeout_secs));
    }
    tracing::info!(tools = ?tools.tool_names(), "tool registry ready");
    tools
}

/// 在消息前加上当前时间
pub fn clock_prefixed(text: &str, now: DateTime<FixedOffset>) -> String {
    format!("[Текущее время: {}] {}", now.format("%Y-%m-%d %H:%M"), text)
}

pub struct AgentRuntime {
    router: StageRouter,
    hub: ConversationHub,
    turn_timeout: Option<Duration>,
    clock: Option<FixedOffset>,
    failure_message: String,
}

impl AgentRuntime {
    pub fn new(router: StageRouter) -> Self {
        let cfg = AppConfig::default();
        Self {
            router,
            hub: ConversationHub::new(),
            turn_timeout: Some(Duration::from_secs(cfg.turn.turn_timeout_secs)),
            clock: None,
            failure_message: cfg.escalation.failure_message,
        }
    }

    /// 0 或 None 表示不限
    pub fn with_turn_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.turn_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn with_clock(mut self, offset: Option<FixedOffset>) -> Self {
        self.clock = offset;
        self
    }

    pub fn with_failure_message(mut self, message: impl Into<String>) -> Self {
        self.failure_message = message.into();
        self
    }

    /// 按配置构建完整运行时（后端按环境变量选择）
    pub fn from_config(cfg: &AppConfig) -> Result<Self, ConfigError> {
        Self::from_parts(cfg, create_llm_from_config(cfg), create_registry_from_config(cfg), None)
    }

    /// 用给定后端与工具构建（嵌入方注册自己的工具时使用）
    pub fn from_parts(
        cfg: &AppConfig,
        llm: Arc<dyn LlmClient>,
        registry: ToolRegistry,
        observer: Option<Arc<dyn TurnObserver>>,
    ) -> Result<Self, ConfigError> {
        let catalog = StageCatalog::load_or_builtin(cfg.stages.catalog.as_deref())?;
        let safe: StageLabel = cfg.stages.safe_label.parse()?;

        let mut classifier = StageClassifier::new(llm.clone(), catalog.classifier_instruction(), safe);
        if let Some(name) = catalog.handoff_tool() {
            match registry.schemas(&[name.to_string()]).into_iter().next() {
                Some(schema) => classifier = classifier.with_handoff_tool(schema),
                None => {
                    return Err(ConfigError::UnknownTool {
                        stage: "classifier".to_string(),
                        tool: name.to_string(),
                    })
                }
            }
        }

        let tools = Arc::new(ToolExecutor::new(registry, cfg.tools.tool_timeout_secs));
        let mut executor = TurnExecutor::new(llm, tools)
            .with_retry(RetryPolicy::from_config(&cfg.retry))
            .with_escalation(EscalationHandler::from_config(&cfg.escalation))
            .with_settings(TurnSettings::from_config(&cfg.turn));
        if let Some(observer) = observer {
            executor = executor.with_observer(observer);
        }

        let router = StageRouter::new(classifier, executor, catalog.stage_table()?)?;
        let clock = if cfg.app.clock_prefix {
            FixedOffset::east_opt(cfg.app.utc_offset_hours * 3600)
        } else {
            None
        };
        Ok(Self::new(router)
            .with_turn_timeout(Some(Duration::from_secs(cfg.turn.turn_timeout_secs)))
            .with_clock(clock)
            .with_failure_message(cfg.escalation.failure_message.clone()))
    }

    pub fn hub(&self) -> &ConversationHub {
        &self.hub
    }

    /// 处理一条用户消息；同一对话的调用按到达顺序串行
    pub async fn process_message(&self, conversation_id: &str, text: &str) -> AgentResponse {
        let context = self.hub.context(conversation_id).await;
        let mut context = context.lock().await;

        let token = self.hub.begin_turn(conversation_id).await;
        let guard = TurnGuard::new(token, self.turn_timeout);
        let message = match self.clock {
            Some(offset) => clock_prefixed(text, Utc::now().with_timezone(&offset)),
            None => text.to_string(),
        };

        let routed = self.router.route(&message, &mut context, &guard).await;
        self.hub.end_turn(conversation_id).await;

        let stage = routed.stage();
        let (user_message, manager_alert) = match &routed.outcome {
            TurnOutcome::Reply(text) => (text.clone(), None),
            TurnOutcome::Escalated(e) => (e.user_message.clone(), Some(e.manager_report.clone())),
            TurnOutcome::Failed(kind) => {
                tracing::error!(conversation = %conversation_id, error = %kind, "turn failed, sending apology");
                (self.failure_message.clone(), None)
            }
        };
        AgentResponse {
            user_message,
            manager_alert,
            stage,
            tools_used: routed.tools_used,
            outcome: routed.outcome,
        }
    }

    /// 取消对话当前轮次；返回是否存在进行中的轮次
    pub async fn cancel(&self, conversation_id: &str) -> bool {
        self.hub.cancel(conversation_id).await
    }

    /// 丢弃对话上下文（/new）
    pub async fn reset(&self, conversation_id: &str) {
        self.hub.reset(conversation_id).await;
    }

    /// 载入外部保存的上下文
    pub async fn restore(&self, context: ConversationContext) {
        self.hub.insert(context).await;
    }

    pub fn shutdown(&self) {
        self.hub.shutdown();
    }
}
