//! 会话监管：按对话串行化轮次、取消与超时
//!
//! 不同对话的轮次可以并发；同一对话的上下文由一把异步互斥锁保护，同一时刻只有一个轮次修改它。
//! 每个轮次持有一个 TurnGuard（取消令牌 + 截止时间），后端调用与工具调用都在其中等待。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::FailureKind;
use crate::memory::{ConversationContext, ConversationId};

/// 单个轮次的取消令牌与截止时间
#[derive(Debug, Clone)]
pub struct TurnGuard {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl TurnGuard {
    pub fn new(cancel: CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            cancel,
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    /// 无超时、不会被外部取消的令牌（测试与嵌入场景）
    pub fn unbounded() -> Self {
        Self::new(CancellationToken::new(), None)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// 在取消与截止时间之内等待 fut；先到的一方决定结果
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, FailureKind> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FailureKind::Cancelled),
            _ = sleep_until(self.deadline) => Err(FailureKind::TimedOut),
            out = fut => Ok(out),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

/// 对话表：对话 ID -> 上下文（带锁），以及正在进行的轮次的取消令牌
#[derive(Debug)]
pub struct ConversationHub {
    conversations: RwLock<HashMap<ConversationId, Arc<Mutex<ConversationContext>>>>,
    active: RwLock<HashMap<ConversationId, CancellationToken>>,
    /// 关闭时取消所有进行中的轮次
    root: CancellationToken,
}

impl ConversationHub {
    pub fn new() -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
            root: CancellationToken::new(),
        }
    }

    /// 获取（不存在则创建）对话上下文；调用方锁住返回值即完成串行化
    pub async fn context(&self, id: &str) -> Arc<Mutex<ConversationContext>> {
        if let Some(ctx) = self.conversations.read().await.get(id) {
            return ctx.clone();
        }
        self.conversations
            .write()
            .await
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ConversationContext::new(id))))
            .clone()
    }

    /// 放入已从存储加载的上下文（覆盖同 ID 的旧上下文）
    pub async fn insert(&self, context: ConversationContext) {
        let id = context.id().to_string();
        self.conversations
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(context)));
    }

    /// 丢弃对话上下文（/new 重置），并取消其进行中的轮次
    pub async fn reset(&self, id: &str) {
        self.cancel(id).await;
        self.conversations.write().await.remove(id);
    }

    /// 为对话登记新轮次，返回其取消令牌（根令牌的子令牌）
    pub async fn begin_turn(&self, id: &str) -> CancellationToken {
        let token = self.root.child_token();
        if let Some(old) = self.active.write().await.insert(id.to_string(), token.clone()) {
            old.cancel();
        }
        token
    }

    pub async fn end_turn(&self, id: &str) {
        self.active.write().await.remove(id);
    }

    /// 取消对话当前轮次（如客户端断开）；返回是否存在进行中的轮次
    pub async fn cancel(&self, id: &str) -> bool {
        match self.active.write().await.remove(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub async fn len(&self) -> usize {
        self.conversations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conversations.read().await.is_empty()
    }
}

impl Default for ConversationHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_passes_through_result() {
        let guard = TurnGuard::unbounded();
        assert_eq!(guard.run(async { 7 }).await, Ok(7));
    }

    #[tokio::test]
    async fn test_guard_cancelled() {
        let token = CancellationToken::new();
        let guard = TurnGuard::new(token.clone(), None);
        token.cancel();
        let res = guard.run(std::future::pending::<()>()).await;
        assert_eq!(res, Err(FailureKind::Cancelled));
    }

    #[tokio::test]
    async fn test_guard_times_out() {
        let guard = TurnGuard::new(CancellationToken::new(), Some(Duration::from_millis(20)));
        let res = guard.run(std::future::pending::<()>()).await;
        assert_eq!(res, Err(FailureKind::TimedOut));
    }

    #[tokio::test]
    async fn test_hub_returns_same_context_per_id() {
        let hub = ConversationHub::new();
        let a = hub.context("1").await;
        a.lock().await.push_user("hello");
        let again = hub.context("1").await;
        assert_eq!(again.lock().await.len(), 1);
        let other = hub.context("2").await;
        assert!(other.lock().await.is_empty());
        assert_eq!(hub.len().await, 2);
    }

    #[tokio::test]
    async fn test_begin_turn_cancels_previous_and_shutdown_cancels_all() {
        let hub = ConversationHub::new();
        let first = hub.begin_turn("1").await;
        let second = hub.begin_turn("1").await;
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        hub.shutdown();
        assert!(second.is_cancelled());
    }

    #[tokio::test]
    async fn test_reset_drops_context() {
        let hub = ConversationHub::new();
        hub.context("1").await.lock().await.push_user("x");
        let token = hub.begin_turn("1").await;
        hub.reset("1").await;
        assert!(token.is_cancelled());
        assert!(hub.context("1").await.lock().await.is_empty());
    }
}
