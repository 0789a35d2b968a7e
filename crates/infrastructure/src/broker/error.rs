//! broker 适配器的错误类型

use application::BrokerError;
use thiserror::Error;

/// Redis broker 操作错误
#[derive(Error, Debug)]
pub enum RedisBrokerError {
    /// 连接错误
    #[error("Redis 连接错误: {message}")]
    ConnectionError { message: String },

    /// 发布错误
    #[error("Redis 发布错误: {message}")]
    PublishError { message: String },

    /// 订阅错误
    #[error("Redis 订阅错误: {message}")]
    SubscribeError { message: String },

    /// 序列化错误
    #[error("序列化错误: {message}")]
    SerializationError { message: String },

    /// 配置错误
    #[error("配置错误: {message}")]
    ConfigError { message: String },
}

pub type RedisBrokerResult<T> = Result<T, RedisBrokerError>;

impl From<redis::RedisError> for RedisBrokerError {
    fn from(err: redis::RedisError) -> Self {
        match err.kind() {
            redis::ErrorKind::InvalidClientConfig => RedisBrokerError::ConfigError {
                message: err.to_string(),
            },
            _ => RedisBrokerError::ConnectionError {
                message: err.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for RedisBrokerError {
    fn from(err: serde_json::Error) -> Self {
        RedisBrokerError::SerializationError {
            message: err.to_string(),
        }
    }
}

impl From<RedisBrokerError> for BrokerError {
    fn from(err: RedisBrokerError) -> Self {
        match err {
            RedisBrokerError::ConnectionError { message } => BrokerError::Unavailable(message),
            RedisBrokerError::SerializationError { message } => BrokerError::Encode(message),
            other => BrokerError::Operation(other.to_string()),
        }
    }
}
