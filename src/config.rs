//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读默认 TOML，再读显式指定的文件，最后用环境变量 `CONCIERGE__*` 覆盖
//! （双下划线表示嵌套，如 `CONCIERGE__RETRY__MAX_ATTEMPTS=5`）。各段缺省值与代码内默认一致。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub turn: TurnSection,
    pub retry: RetrySection,
    pub escalation: EscalationSection,
    pub stages: StagesSection,
    pub tools: ToolsSection,
}

/// [app] 段：应用名、时钟前缀
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 在用户消息前加上当前时间，便于模型理解「明天」「下周」
    pub clock_prefix: bool,
    /// 时钟前缀使用的时区（相对 UTC 的小时数）
    pub utc_offset_hours: i32,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "concierge".to_string(),
            clock_prefix: true,
            utc_offset_hours: 3,
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：deepseek / openai
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: None,
            base_url: None,
            temperature: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次后端请求超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [turn] 段：工具轮数上限、并发执行、文本调用解析、整轮超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TurnSection {
    pub max_rounds: usize,
    pub parallel_tools: bool,
    pub json_tool_fallback: bool,
    /// 整个轮次（分类 + 执行）的超时（秒），0 表示不限
    pub turn_timeout_secs: u64,
}

impl Default for TurnSection {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            parallel_tools: true,
            json_tool_fallback: true,
            turn_timeout_secs: 120,
        }
    }
}

/// [retry] 段：瞬时错误的最大尝试次数、间隔与额外特征串
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub signatures: Vec<String>,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 300,
            signatures: Vec::new(),
        }
    }
}

/// [escalation] 段：报告摘录、用户占位文案、链接模板
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EscalationSection {
    /// 报告中摘录的最近轮次数
    pub excerpt_turns: usize,
    /// 每条摘录的最大字符数
    pub excerpt_chars: usize,
    /// 转人工时发给用户的占位消息
    pub user_message: String,
    /// 轮次失败时发给用户的致歉消息
    pub failure_message: String,
    /// 客户链接模板，{id} 为对话标识
    pub deep_link_template: String,
    /// 重试耗尽时的原因模板，{error} 为最后一次错误
    pub transient_reason: String,
}

impl Default for EscalationSection {
    fn default() -> Self {
        Self {
            excerpt_turns: 3,
            excerpt_chars: 500,
            user_message: "Секундочку, уточняю ваш вопрос у менеджера.".to_string(),
            failure_message: "Извините, произошла ошибка. Попробуйте, пожалуйста, ещё раз чуть позже."
                .to_string(),
            deep_link_template: "[{id}](tg://user?id={id})".to_string(),
            transient_reason: "Ошибка API: {error}".to_string(),
        }
    }
}

/// [stages] 段：阶段目录路径与安全默认阶段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StagesSection {
    pub catalog: Option<PathBuf>,
    pub safe_label: String,
}

impl Default for StagesSection {
    fn default() -> Self {
        Self {
            catalog: Some(PathBuf::from("config/stages.toml")),
            safe_label: "greeting".to_string(),
        }
    }
}

/// [tools] 段：工具超时与 HTTP 工具声明
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    /// 转人工工具名
    pub call_human: String,
    pub http: Vec<HttpToolEntry>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            call_human: crate::tools::CALL_HUMAN.to_string(),
            http: Vec::new(),
        }
    }
}

/// [[tools.http]]：一个外部 HTTP 工具
#[derive(Debug, Clone, Deserialize)]
pub struct HttpToolEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub url: String,
    #[serde(default = "default_http_method")]
    pub method: String,
    /// 参数 JSON Schema；缺省为无参数
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_http_method() -> String {
    "POST".to_string()
}

/// 加载配置：默认文件 -> 显式文件 -> 环境变量
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, skipping");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CONCIERGE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
