use async_trait::async_trait;
use domain::UserProfile;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("user not found")]
    UnknownUser,
    #[error("identity lookup failed: {0}")]
    Unavailable(String),
}

/// 把连接时携带的凭证换成用户资料。
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<UserProfile, AuthError>;
}

/// 内存实现（用于测试）
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    /// token 与用户资料一一对应的验证器
    #[derive(Default)]
    pub struct StaticIdentityVerifier {
        tokens: RwLock<HashMap<String, UserProfile>>,
    }

    impl StaticIdentityVerifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn insert(&self, token: impl Into<String>, profile: UserProfile) {
            self.tokens.write().await.insert(token.into(), profile);
        }
    }

    #[async_trait]
    impl IdentityVerifier for StaticIdentityVerifier {
        async fn verify(&self, token: &str) -> Result<UserProfile, AuthError> {
            let token = token.trim();
            let token = token.strip_prefix("Bearer ").unwrap_or(token);
            if token.is_empty() {
                return Err(AuthError::MissingToken);
            }
            self.tokens
                .read()
                .await
                .get(token)
                .cloned()
                .ok_or_else(|| AuthError::InvalidToken("unknown token".into()))
        }
    }
}
