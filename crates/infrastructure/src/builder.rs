use std::sync::Arc;

use application::{MessageRepository, NotificationBroker, UserRepository};
use config::AppConfig;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::{
    broker::{BrokerConnection, RedisBrokerError, RedisBrokerSettings, RedisNotificationBroker},
    migrations::MIGRATOR,
    repository::{create_pg_pool, PgStorage},
};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("broker error: {0}")]
    Broker(#[from] RedisBrokerError),
}

/// 已连接的外部依赖
#[derive(Clone)]
pub struct Infrastructure {
    pub storage: Arc<PgStorage>,
    pub broker: RedisNotificationBroker,
}

impl Infrastructure {
    /// 建连接池、跑迁移、准备 broker。broker 不可达不影响启动，由守护任务重连。
    pub async fn connect(config: &AppConfig) -> Result<Self, InfrastructureError> {
        let pool = create_pg_pool(&config.database.url, config.database.max_connections).await?;
        MIGRATOR.run(&pool).await?;
        let storage = Arc::new(PgStorage::new(pool));

        let connection = Arc::new(BrokerConnection::new(
            &config.broker.url,
            config.broker.reconnect_interval(),
        )?);
        if let Err(err) = connection.probe().await {
            tracing::warn!(error = %err, "broker 暂不可用，将在后台重连");
        }
        let broker = RedisNotificationBroker::new(
            connection,
            RedisBrokerSettings {
                exchange: config.broker.exchange.clone(),
                queue_prefix: config.broker.queue_prefix.clone(),
                consumer_group: config.broker.consumer_group.clone(),
                max_delivery_attempts: config.broker.max_delivery_attempts,
                prefetch: config.broker.prefetch,
            },
        );

        Ok(Self { storage, broker })
    }

    pub fn spawn_broker_supervisor(&self) -> JoinHandle<()> {
        self.broker.connection().spawn_supervisor()
    }

    pub fn user_repository(&self) -> Arc<dyn UserRepository> {
        self.storage.user_repository.clone()
    }

    pub fn message_repository(&self) -> Arc<dyn MessageRepository> {
        self.storage.message_repository.clone()
    }

    pub fn notification_broker(&self) -> Arc<dyn NotificationBroker> {
        Arc::new(self.broker.clone())
    }
}
