//! 基于 Redis Streams 的通知 broker
//!
//! 映射关系：
//! - 用户队列 = stream `{queue_prefix}_{user_id}`，带一个消费者组，数据在消费者挂上前一直保留
//! - 交换器绑定 = set `{exchange}:bindings:{routing_key}`，成员是队列名
//! - ack = `XACK`；nack = 带上次数重新 `XADD` 后 `XACK` 原条目，超过上限转入 `{queue}:dead`

use std::collections::HashMap;
use std::sync::Arc;

use application::{
    BrokerError, Delivery, DeliveryOutcome, NotificationBroker, NotificationEnvelope,
    NotificationStream,
};
use async_trait::async_trait;
use domain::UserId;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadReply};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::connection::BrokerConnection;
use super::error::{RedisBrokerError, RedisBrokerResult};

const PAYLOAD_FIELD: &str = "payload";
const ATTEMPTS_FIELD: &str = "attempts";
const BLOCK_MS: u64 = 1000;

/// broker 拓扑与消费参数
#[derive(Debug, Clone)]
pub struct RedisBrokerSettings {
    pub exchange: String,
    pub queue_prefix: String,
    pub consumer_group: String,
    pub max_delivery_attempts: u32,
    pub prefetch: usize,
}

impl Default for RedisBrokerSettings {
    fn default() -> Self {
        Self {
            exchange: "notifications".to_string(),
            queue_prefix: "user_queue".to_string(),
            consumer_group: "notification_consumers".to_string(),
            max_delivery_attempts: 5,
            prefetch: 16,
        }
    }
}

impl RedisBrokerSettings {
    pub fn queue_name(&self, user: UserId) -> String {
        format!("{}_{}", self.queue_prefix, user)
    }

    pub fn binding_key(&self, routing_key: UserId) -> String {
        format!("{}:bindings:{}", self.exchange, routing_key)
    }

    pub fn dead_letter_queue(&self, queue: &str) -> String {
        format!("{queue}:dead")
    }
}

/// 从 stream 条目里取出的一条通知
#[derive(Debug)]
struct QueuedNotification {
    entry_id: String,
    payload: String,
    attempts: u32,
}

fn string_field(fields: &HashMap<String, redis::Value>, key: &str) -> Option<String> {
    match fields.get(key) {
        Some(redis::Value::BulkString(bytes)) => String::from_utf8(bytes.clone()).ok(),
        Some(redis::Value::SimpleString(text)) => Some(text.clone()),
        _ => None,
    }
}

fn parse_entry(entry: &StreamId) -> Option<QueuedNotification> {
    let payload = string_field(&entry.map, PAYLOAD_FIELD)?;
    let attempts = string_field(&entry.map, ATTEMPTS_FIELD)
        .and_then(|raw| raw.parse::<u32>().ok())
        .unwrap_or(1);
    Some(QueuedNotification {
        entry_id: entry.id.clone(),
        payload,
        attempts,
    })
}

#[derive(Clone)]
pub struct RedisNotificationBroker {
    connection: Arc<BrokerConnection>,
    settings: Arc<RedisBrokerSettings>,
}

impl RedisNotificationBroker {
    pub fn new(connection: Arc<BrokerConnection>, settings: RedisBrokerSettings) -> Self {
        Self {
            connection,
            settings: Arc::new(settings),
        }
    }

    pub fn connection(&self) -> &Arc<BrokerConnection> {
        &self.connection
    }

    pub fn settings(&self) -> &RedisBrokerSettings {
        &self.settings
    }

    async fn conn(&self) -> RedisBrokerResult<MultiplexedConnection> {
        self.connection.get().await
    }

    async fn declare_queue(&self, queue: &str) -> RedisBrokerResult<()> {
        let mut conn = self.conn().await?;
        let result: Result<String, redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(queue)
            .arg(&self.settings.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => {
                info!(queue = %queue, "用户队列已创建");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(queue = %queue, "用户队列已存在");
                Ok(())
            }
            Err(e) => {
                self.connection.report(&e).await;
                Err(e.into())
            }
        }
    }

    async fn bind(&self, routing_key: UserId, queue: &str) -> RedisBrokerResult<()> {
        let mut conn = self.conn().await?;
        let result: Result<i64, redis::RedisError> = redis::cmd("SADD")
            .arg(self.settings.binding_key(routing_key))
            .arg(queue)
            .query_async(&mut conn)
            .await;
        if let Err(e) = &result {
            self.connection.report(e).await;
        }
        result?;
        Ok(())
    }

    async fn queue_exists(&self, queue: &str) -> RedisBrokerResult<bool> {
        let mut conn = self.conn().await?;
        let result: Result<bool, redis::RedisError> =
            redis::cmd("EXISTS").arg(queue).query_async(&mut conn).await;
        if let Err(e) = &result {
            self.connection.report(e).await;
        }
        Ok(result?)
    }

    async fn bound_queues(&self, routing_key: UserId) -> RedisBrokerResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let result: Result<Vec<String>, redis::RedisError> = redis::cmd("SMEMBERS")
            .arg(self.settings.binding_key(routing_key))
            .query_async(&mut conn)
            .await;
        if let Err(e) = &result {
            self.connection.report(e).await;
        }
        Ok(result?)
    }

    async fn append(&self, queue: &str, payload: &str, attempts: u32) -> RedisBrokerResult<()> {
        let mut conn = self.conn().await?;
        let result: Result<String, redis::RedisError> = redis::cmd("XADD")
            .arg(queue)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .arg(ATTEMPTS_FIELD)
            .arg(attempts)
            .query_async(&mut conn)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                self.connection.report(&e).await;
                Err(RedisBrokerError::PublishError {
                    message: e.to_string(),
                })
            }
        }
    }

    /// 在消费循环自己的连接上读取一批条目。`cursor` 为 "0" 时读本消费者未确认的条目，
    /// 为 ">" 时读新条目。
    async fn read_batch(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &str,
        consumer: &str,
        cursor: &str,
    ) -> RedisBrokerResult<Vec<StreamId>> {
        let result: Result<StreamReadReply, redis::RedisError> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.settings.consumer_group)
            .arg(consumer)
            .arg("COUNT")
            .arg(self.settings.prefetch.max(1))
            .arg("BLOCK")
            .arg(BLOCK_MS)
            .arg("STREAMS")
            .arg(queue)
            .arg(cursor)
            .query_async(conn)
            .await;

        // 连接出错时由消费循环丢弃并重建
        let reply = result.map_err(|e| RedisBrokerError::SubscribeError {
            message: e.to_string(),
        })?;
        Ok(reply.keys.into_iter().flat_map(|key| key.ids).collect())
    }

    async fn ack(&self, queue: &str, entry_id: &str) -> RedisBrokerResult<()> {
        let mut conn = self.conn().await?;
        let result: Result<i64, redis::RedisError> = redis::cmd("XACK")
            .arg(queue)
            .arg(&self.settings.consumer_group)
            .arg(entry_id)
            .query_async(&mut conn)
            .await;
        if let Err(e) = &result {
            self.connection.report(e).await;
        }
        result?;
        Ok(())
    }

    /// 重新入队或转入死信，然后确认原条目。
    async fn nack(&self, queue: &str, item: &QueuedNotification) -> RedisBrokerResult<()> {
        if item.attempts >= self.settings.max_delivery_attempts {
            let dead = self.settings.dead_letter_queue(queue);
            warn!(
                queue = %queue,
                entry_id = %item.entry_id,
                attempts = item.attempts,
                "通知多次处理失败，转入死信"
            );
            self.append(&dead, &item.payload, item.attempts).await?;
        } else {
            self.append(queue, &item.payload, item.attempts + 1).await?;
        }
        self.ack(queue, &item.entry_id).await
    }

    async fn settle(&self, queue: &str, item: &QueuedNotification, outcome: DeliveryOutcome) {
        let result = match outcome {
            DeliveryOutcome::Ack => self.ack(queue, &item.entry_id).await,
            DeliveryOutcome::Nack => self.nack(queue, item).await,
        };
        if let Err(err) = result {
            // 条目仍在待确认列表中，下次订阅时会重新投递
            warn!(queue = %queue, entry_id = %item.entry_id, error = %err, "确认通知失败");
        }
    }

    async fn consume(self, queue: String, consumer: String, tx: mpsc::Sender<Delivery>) {
        info!(queue = %queue, consumer = %consumer, "broker 消费者已启动");
        // 先补投本消费者名下未确认的条目
        let mut cursor = "0";
        let mut reader: Option<MultiplexedConnection> = None;

        'outer: while !tx.is_closed() {
            if reader.is_none() {
                match self.connection.dedicated().await {
                    Ok(conn) => reader = Some(conn),
                    Err(err) => {
                        warn!(queue = %queue, error = %err, "消费连接不可用，稍后重试");
                        tokio::time::sleep(self.connection.reconnect_interval()).await;
                        continue;
                    }
                }
            }
            let Some(conn) = reader.as_mut() else {
                continue;
            };

            let entries = match self.read_batch(conn, &queue, &consumer, cursor).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(queue = %queue, error = %err, "读取用户队列失败，稍后重试");
                    reader = None;
                    tokio::time::sleep(self.connection.reconnect_interval()).await;
                    // 连接可能被重建，消费者组也可能需要重新声明
                    if let Err(err) = self.declare_queue(&queue).await {
                        debug!(queue = %queue, error = %err, "重新声明队列失败");
                    }
                    cursor = "0";
                    continue;
                }
            };

            if entries.is_empty() {
                cursor = ">";
                continue;
            }

            for entry in entries {
                let Some(item) = parse_entry(&entry) else {
                    warn!(queue = %queue, entry_id = %entry.id, "无法解析的队列条目，已丢弃");
                    if let Err(err) = self.ack(&queue, &entry.id).await {
                        warn!(queue = %queue, error = %err, "丢弃条目失败");
                    }
                    continue;
                };

                let envelope: NotificationEnvelope = match serde_json::from_str(&item.payload) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!(queue = %queue, entry_id = %item.entry_id, error = %err, "通知无法解码，转入死信");
                        let dead = self.settings.dead_letter_queue(&queue);
                        let moved = match self.append(&dead, &item.payload, item.attempts).await {
                            Ok(()) => self.ack(&queue, &item.entry_id).await,
                            Err(err) => Err(err),
                        };
                        if let Err(err) = moved {
                            warn!(queue = %queue, error = %err, "转入死信失败");
                        }
                        continue;
                    }
                };

                let (delivery, outcome) = Delivery::new(envelope, item.attempts);
                if tx.send(delivery).await.is_err() {
                    // 订阅方已离开，条目留在待确认列表
                    break 'outer;
                }
                let outcome = outcome.await.unwrap_or(DeliveryOutcome::Nack);
                self.settle(&queue, &item, outcome).await;
            }
        }
        info!(queue = %queue, consumer = %consumer, "broker 消费者已退出");
    }
}

#[async_trait]
impl NotificationBroker for RedisNotificationBroker {
    async fn ensure_user_queue(&self, user: UserId) -> Result<(), BrokerError> {
        let queue = self.settings.queue_name(user);
        self.declare_queue(&queue).await?;
        self.bind(user, &queue).await?;
        Ok(())
    }

    async fn subscribe(&self, user: UserId) -> Result<NotificationStream, BrokerError> {
        let queue = self.settings.queue_name(user);
        if !self.queue_exists(&queue).await? {
            return Err(RedisBrokerError::SubscribeError {
                message: format!("queue {queue} not declared"),
            }
            .into());
        }

        let (tx, rx) = mpsc::channel(1);
        // 同一用户的订阅共用消费者名，重连后能接手上一次未确认的条目
        let consumer = user.to_string();
        tokio::spawn(self.clone().consume(queue, consumer, tx));
        Ok(NotificationStream::new(rx))
    }

    async fn publish(
        &self,
        routing_key: UserId,
        envelope: &NotificationEnvelope,
    ) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(envelope).map_err(RedisBrokerError::from)?;
        let queues = self.bound_queues(routing_key).await?;
        if queues.is_empty() {
            warn!(routing_key = %routing_key, "没有绑定的队列，通知被丢弃");
            return Ok(());
        }
        for queue in &queues {
            self.append(queue, &payload, 1).await?;
        }
        debug!(routing_key = %routing_key, kind = envelope.data.kind(), queues = queues.len(), "通知已发布");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_topology_names() {
        let settings = RedisBrokerSettings::default();
        let user = UserId::from(Uuid::nil());
        let queue = settings.queue_name(user);
        assert_eq!(queue, format!("user_queue_{}", Uuid::nil()));
        assert_eq!(
            settings.binding_key(user),
            format!("notifications:bindings:{}", Uuid::nil())
        );
        assert_eq!(settings.dead_letter_queue(&queue), format!("{queue}:dead"));
    }

    #[test]
    fn test_parse_entry_fields() {
        let mut map = HashMap::new();
        map.insert(
            PAYLOAD_FIELD.to_string(),
            redis::Value::BulkString(b"{\"x\":1}".to_vec()),
        );
        map.insert(
            ATTEMPTS_FIELD.to_string(),
            redis::Value::BulkString(b"3".to_vec()),
        );
        let entry = StreamId {
            id: "1-0".into(),
            map,
        };
        let item = parse_entry(&entry).unwrap();
        assert_eq!(item.entry_id, "1-0");
        assert_eq!(item.payload, "{\"x\":1}");
        assert_eq!(item.attempts, 3);

        let empty = StreamId {
            id: "2-0".into(),
            map: HashMap::new(),
        };
        assert!(parse_entry(&empty).is_none());
    }
}
