//! concierge 命令行演示
//!
//! 从标准输入逐行读取用户消息，交给 AgentRuntime 处理并打印回复；转人工报告打印到标准错误。
//! 命令：/new 重置对话，/quit 退出。对话标识取自 CONCIERGE_CHAT_ID（默认 local）。

use std::path::PathBuf;

use anyhow::Context;
use concierge::agent::AgentRuntime;
use concierge::config::load_config;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    concierge::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load configuration")?;
    let runtime = AgentRuntime::from_config(&cfg).context("Failed to build runtime")?;
    let chat_id = std::env::var("CONCIERGE_CHAT_ID").unwrap_or_else(|_| "local".to_string());

    tracing::info!(app = %cfg.app.name, conversation = %chat_id, "ready, type a message (/new, /quit)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                runtime.shutdown();
                break;
            }
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else { break };
        let input = line.trim();
        match input {
            "" => continue,
            "/quit" | "/exit" => break,
            "/new" => {
                runtime.reset(&chat_id).await;
                println!("(new conversation)");
                continue;
            }
            _ => {}
        }

        let response = runtime.process_message(&chat_id, input).await;
        if let Some(alert) = &response.manager_alert {
            eprintln!("{}", alert);
        }
        println!("{}", response.user_message);
    }

    Ok(())
}
