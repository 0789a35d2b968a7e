use domain::{DomainError, RepositoryError};
use thiserror::Error;

use crate::identity::AuthError;
use crate::notifications::BrokerError;

/// 应用层错误
///
/// `Display` 的内容会作为 `{success: false, error}` 回给客户端，所以保持简短可读。
#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("store unavailable: {0}")]
    Repository(#[from] RepositoryError),
    #[error("broker unavailable: {0}")]
    Broker(#[from] BrokerError),
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),
    #[error("{0}")]
    Validation(String),
    #[error("Receiver not found")]
    ReceiverNotFound,
    #[error("Message not found")]
    MessageNotFound,
    #[error("User not found")]
    UserNotFound,
    #[error("You can only mark your own messages as read")]
    NotAuthorized,
    #[error("user {0} is not connected")]
    RecipientOffline(domain::UserId),
}

impl ApplicationError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApplicationError::Validation(message.into())
    }

    /// 是否应该断开连接（而不是返回失败结果）。
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(self, ApplicationError::Authentication(_))
    }
}
