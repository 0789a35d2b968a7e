//! 共享的 broker 连接
//!
//! 发布、确认与声明共用一条多路复用连接。连接断开后第一个拿锁的调用方负责重连，
//! 其他调用方等锁释放后直接复用新连接。后台守护任务按固定间隔探活，断线时重连。
//!
//! 阻塞读（`XREADGROUP BLOCK`）会占住所在连接的应答管道，每个消费循环通过
//! [`BrokerConnection::dedicated`] 单独建立连接，不经过共享连接。

use std::sync::Arc;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::Client;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::error::{RedisBrokerError, RedisBrokerResult};

pub struct BrokerConnection {
    client: Client,
    current: Mutex<Option<MultiplexedConnection>>,
    reconnect_interval: Duration,
}

impl BrokerConnection {
    pub fn new(url: &str, reconnect_interval: Duration) -> RedisBrokerResult<Self> {
        let client = Client::open(url).map_err(|e| RedisBrokerError::ConfigError {
            message: format!("创建 Redis 客户端失败: {}", e),
        })?;
        Ok(Self {
            client,
            current: Mutex::new(None),
            reconnect_interval,
        })
    }

    pub fn reconnect_interval(&self) -> Duration {
        self.reconnect_interval
    }

    /// 取得当前连接，没有时建立一条。
    pub async fn get(&self) -> RedisBrokerResult<MultiplexedConnection> {
        let mut current = self.current.lock().await;
        if let Some(conn) = current.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RedisBrokerError::ConnectionError {
                message: format!("连接 Redis 失败: {}", e),
            })?;
        info!("broker 连接已建立");
        *current = Some(conn.clone());
        Ok(conn)
    }

    /// 新建一条不共享的连接，给阻塞读使用；不影响共享连接的状态。
    pub async fn dedicated(&self) -> RedisBrokerResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RedisBrokerError::ConnectionError {
                message: format!("建立消费连接失败: {}", e),
            })
    }

    /// 丢弃当前连接，下次 `get` 时重连。
    pub async fn invalidate(&self) {
        if self.current.lock().await.take().is_some() {
            warn!("broker 连接已失效");
        }
    }

    /// 操作失败后调用：连接类错误会让当前连接失效。
    pub async fn report(&self, err: &redis::RedisError) {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            self.invalidate().await;
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.current.lock().await.is_some()
    }

    /// 探活一次；失败时让连接失效。
    pub async fn probe(&self) -> RedisBrokerResult<()> {
        let mut conn = self.get().await?;
        let result: Result<String, redis::RedisError> =
            redis::cmd("PING").query_async(&mut conn).await;
        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                self.report(&err).await;
                Err(err.into())
            }
        }
    }

    /// 启动守护任务，每个重连间隔探活一次。
    pub fn spawn_supervisor(self: &Arc<Self>) -> JoinHandle<()> {
        let connection = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(connection.reconnect_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match connection.probe().await {
                    Ok(()) => debug!("broker 连接正常"),
                    Err(err) => warn!(
                        error = %err,
                        retry_in_ms = connection.reconnect_interval.as_millis() as u64,
                        "broker 不可用，稍后重连"
                    ),
                }
            }
        })
    }
}
