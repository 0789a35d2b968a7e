//! 通知 broker 适配器
//!
//! 用 Redis Streams 实现持久的按用户队列，并提供共享连接与重连守护。

pub mod connection;
pub mod error;
pub mod redis_broker;

pub use connection::BrokerConnection;
pub use error::{RedisBrokerError, RedisBrokerResult};
pub use redis_broker::{RedisBrokerSettings, RedisNotificationBroker};
