//! 通知扇出客户端的抽象
//!
//! 一个共享的直连交换器，每个用户一个持久队列，路由键就是用户 ID。
//! 订阅以 channel 的形式交付，每条投递都带确认句柄：处理成功后 `ack`，
//! 失败或句柄被丢弃时视为 `nack` 并重新入队（at-least-once）。

use async_trait::async_trait;
use domain::{CompatibilityResult, MessageId, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// 投递给用户队列的业务通知
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerNotification {
    NewMessage(NewMessageNotice),
    MessageRead(MessageReadNotice),
}

impl BrokerNotification {
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerNotification::NewMessage(_) => "NEW_MESSAGE",
            BrokerNotification::MessageRead(_) => "MESSAGE_READ",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageNotice {
    pub message: NotifiedMessage,
    pub alert: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zodiac_compatibility: Option<CompatibilityResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifiedMessage {
    pub id: MessageId,
    pub content: String,
    pub sender: NotifiedSender,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifiedSender {
    pub id: UserId,
    pub username: String,
    pub zodiac_sign: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReadNotice {
    pub message: ReadMessageRef,
    pub alert: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadMessageRef {
    pub id: MessageId,
    pub read_by: UserId,
    pub read_at: Timestamp,
    pub reader_zodiac: Option<String>,
}

/// 队列中实际存放的信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: BrokerNotification,
    pub timestamp: Timestamp,
}

impl NotificationEnvelope {
    pub const KIND: &'static str = "NOTIFICATION";

    pub fn new(data: BrokerNotification, timestamp: Timestamp) -> Self {
        Self {
            kind: Self::KIND.to_owned(),
            data,
            timestamp,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker connection unavailable: {0}")]
    Unavailable(String),
    #[error("failed to encode notification: {0}")]
    Encode(String),
    #[error("broker operation failed: {0}")]
    Operation(String),
}

/// 消费者对一条投递的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Ack,
    Nack,
}

/// 一条待确认的投递
#[derive(Debug)]
pub struct Delivery {
    pub envelope: NotificationEnvelope,
    /// 从 1 开始的投递次数
    pub attempt: u32,
    reply: Option<oneshot::Sender<DeliveryOutcome>>,
}

impl Delivery {
    pub fn new(
        envelope: NotificationEnvelope,
        attempt: u32,
    ) -> (Self, oneshot::Receiver<DeliveryOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                envelope,
                attempt,
                reply: Some(tx),
            },
            rx,
        )
    }

    pub fn ack(mut self) {
        self.settle(DeliveryOutcome::Ack);
    }

    pub fn nack(mut self) {
        self.settle(DeliveryOutcome::Nack);
    }

    fn settle(&mut self, outcome: DeliveryOutcome) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(outcome);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        self.settle(DeliveryOutcome::Nack);
    }
}

/// 订阅得到的投递流；丢弃即取消订阅。
#[derive(Debug)]
pub struct NotificationStream {
    receiver: mpsc::Receiver<Delivery>,
}

impl NotificationStream {
    pub fn new(receiver: mpsc::Receiver<Delivery>) -> Self {
        Self { receiver }
    }

    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

#[async_trait]
pub trait NotificationBroker: Send + Sync {
    /// 声明用户队列并绑定到交换器，可重复调用。
    async fn ensure_user_queue(&self, user: UserId) -> Result<(), BrokerError>;

    /// 为用户队列挂一个消费者。
    async fn subscribe(&self, user: UserId) -> Result<NotificationStream, BrokerError>;

    /// 以持久方式发布，路由键为目标用户。
    async fn publish(
        &self,
        routing_key: UserId,
        envelope: &NotificationEnvelope,
    ) -> Result<(), BrokerError>;
}

/// 内存实现（用于测试）
pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::{Mutex, Notify};

    const DEFAULT_MAX_ATTEMPTS: u32 = 5;

    #[derive(Debug, Clone)]
    struct Stored {
        envelope: NotificationEnvelope,
        attempts: u32,
    }

    #[derive(Default)]
    struct Queue {
        items: VecDeque<Stored>,
        dead: Vec<NotificationEnvelope>,
    }

    #[derive(Default)]
    struct Tables {
        queues: HashMap<String, Queue>,
        // routing key -> 绑定的队列名
        bindings: HashMap<String, HashSet<String>>,
    }

    struct Inner {
        tables: Mutex<Tables>,
        notify: Notify,
        available: AtomicBool,
        queue_prefix: String,
        max_attempts: u32,
    }

    #[derive(Clone)]
    pub struct MemoryNotificationBroker {
        inner: Arc<Inner>,
    }

    impl Default for MemoryNotificationBroker {
        fn default() -> Self {
            Self::new("user_queue", DEFAULT_MAX_ATTEMPTS)
        }
    }

    impl MemoryNotificationBroker {
        pub fn new(queue_prefix: impl Into<String>, max_attempts: u32) -> Self {
            Self {
                inner: Arc::new(Inner {
                    tables: Mutex::new(Tables::default()),
                    notify: Notify::new(),
                    available: AtomicBool::new(true),
                    queue_prefix: queue_prefix.into(),
                    max_attempts: max_attempts.max(1),
                }),
            }
        }

        pub fn queue_name(&self, user: UserId) -> String {
            format!("{}_{}", self.inner.queue_prefix, user)
        }

        /// 模拟 broker 断线/恢复。
        pub fn set_available(&self, available: bool) {
            self.inner.available.store(available, Ordering::SeqCst);
            self.inner.notify.notify_waiters();
        }

        pub async fn queue_count(&self) -> usize {
            self.inner.tables.lock().await.queues.len()
        }

        pub async fn binding_count(&self, user: UserId) -> usize {
            self.inner
                .tables
                .lock()
                .await
                .bindings
                .get(&user.to_string())
                .map_or(0, HashSet::len)
        }

        pub async fn queue_depth(&self, user: UserId) -> usize {
            let name = self.queue_name(user);
            self.inner
                .tables
                .lock()
                .await
                .queues
                .get(&name)
                .map_or(0, |q| q.items.len())
        }

        pub async fn pending(&self, user: UserId) -> Vec<NotificationEnvelope> {
            let name = self.queue_name(user);
            self.inner
                .tables
                .lock()
                .await
                .queues
                .get(&name)
                .map(|q| q.items.iter().map(|s| s.envelope.clone()).collect())
                .unwrap_or_default()
        }

        pub async fn dead_letters(&self, user: UserId) -> Vec<NotificationEnvelope> {
            let name = self.queue_name(user);
            self.inner
                .tables
                .lock()
                .await
                .queues
                .get(&name)
                .map(|q| q.dead.clone())
                .unwrap_or_default()
        }

        fn check_available(&self) -> Result<(), BrokerError> {
            if self.inner.available.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(BrokerError::Unavailable("memory broker offline".into()))
            }
        }

        async fn next_item(inner: &Inner, queue: &str) -> Stored {
            loop {
                let notified = inner.notify.notified();
                if inner.available.load(Ordering::SeqCst) {
                    let mut tables = inner.tables.lock().await;
                    if let Some(item) = tables
                        .queues
                        .get_mut(queue)
                        .and_then(|q| q.items.pop_front())
                    {
                        return item;
                    }
                }
                notified.await;
            }
        }

        async fn requeue(inner: &Inner, queue: &str, mut item: Stored) {
            let mut tables = inner.tables.lock().await;
            let entry = tables.queues.entry(queue.to_owned()).or_default();
            item.attempts += 1;
            if item.attempts >= inner.max_attempts {
                tracing::warn!(queue = %queue, attempts = item.attempts, "通知多次处理失败，转入死信");
                entry.dead.push(item.envelope);
            } else {
                entry.items.push_front(item);
            }
            drop(tables);
            inner.notify.notify_waiters();
        }

        async fn consume(inner: Arc<Inner>, queue: String, tx: mpsc::Sender<Delivery>) {
            loop {
                let item = tokio::select! {
                    item = Self::next_item(&inner, &queue) => item,
                    _ = tx.closed() => break,
                };
                let (delivery, outcome) = Delivery::new(item.envelope.clone(), item.attempts + 1);
                if tx.send(delivery).await.is_err() {
                    // 消费端已经走了，原样放回队首
                    let mut tables = inner.tables.lock().await;
                    tables.queues.entry(queue.clone()).or_default().items.push_front(item);
                    break;
                }
                match outcome.await {
                    Ok(DeliveryOutcome::Ack) => {}
                    Ok(DeliveryOutcome::Nack) | Err(_) => Self::requeue(&inner, &queue, item).await,
                }
            }
            tracing::debug!(queue = %queue, "内存消费者退出");
        }
    }

    #[async_trait]
    impl NotificationBroker for MemoryNotificationBroker {
        async fn ensure_user_queue(&self, user: UserId) -> Result<(), BrokerError> {
            self.check_available()?;
            let name = self.queue_name(user);
            let mut tables = self.inner.tables.lock().await;
            tables.queues.entry(name.clone()).or_default();
            tables
                .bindings
                .entry(user.to_string())
                .or_default()
                .insert(name);
            Ok(())
        }

        async fn subscribe(&self, user: UserId) -> Result<NotificationStream, BrokerError> {
            self.check_available()?;
            let name = self.queue_name(user);
            if !self.inner.tables.lock().await.queues.contains_key(&name) {
                return Err(BrokerError::Operation(format!("queue {name} not declared")));
            }
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(Self::consume(self.inner.clone(), name, tx));
            Ok(NotificationStream::new(rx))
        }

        async fn publish(
            &self,
            routing_key: UserId,
            envelope: &NotificationEnvelope,
        ) -> Result<(), BrokerError> {
            self.check_available()?;
            let mut tables = self.inner.tables.lock().await;
            let targets: Vec<String> = tables
                .bindings
                .get(&routing_key.to_string())
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default();
            if targets.is_empty() {
                tracing::warn!(routing_key = %routing_key, "没有绑定的队列，通知被丢弃");
                return Ok(());
            }
            for name in targets {
                tables.queues.entry(name).or_default().items.push_back(Stored {
                    envelope: envelope.clone(),
                    attempts: 0,
                });
            }
            drop(tables);
            self.inner.notify.notify_waiters();
            Ok(())
        }
    }
}
