//! 基础设施层实现。
//!
//! 提供 PostgreSQL 仓储与 Redis Streams 通知 broker，实现应用层定义的接口。

pub mod broker;
pub mod builder;
pub mod migrations;
pub mod repository;

pub use broker::{
    BrokerConnection, RedisBrokerError, RedisBrokerSettings, RedisNotificationBroker,
};
pub use builder::{Infrastructure, InfrastructureError};
pub use migrations::MIGRATOR;
pub use repository::{create_pg_pool, PgMessageRepository, PgStorage, PgUserRepository};
