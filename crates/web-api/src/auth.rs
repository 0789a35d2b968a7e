//! JWT 认证模块
//!
//! 提供 JWT token 生成、验证，以及基于 JWT 的 [`IdentityVerifier`] 实现：
//! token 的 `sub` 为用户 ID，验证通过后从用户存储加载资料。

use std::sync::Arc;

use application::{AuthError, IdentityVerifier, UserRepository};
use async_trait::async_trait;
use config::JwtConfig;
use domain::{UserId, UserProfile};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;

/// JWT Claims 结构
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub exp: i64, // 过期时间 (Unix timestamp)
}

/// JWT Token 服务
#[derive(Clone)]
pub struct JwtService {
    config: JwtConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(config: JwtConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_ref());
        let decoding_key = DecodingKey::from_secret(config.secret.as_ref());

        Self {
            config,
            encoding_key,
            decoding_key,
        }
    }

    /// 生成 JWT token
    pub fn generate_token(&self, user: &UserProfile) -> Result<String, ApiError> {
        let exp = chrono::Utc::now() + chrono::Duration::hours(self.config.expiration_hours);

        let claims = Claims {
            sub: Uuid::from(user.id),
            username: Some(user.username.clone()),
            exp: exp.timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|err| ApiError::internal_server_error(format!("Token generation failed: {}", err)))
    }

    /// 验证并解析 JWT token，接受带 `Bearer ` 前缀的写法
    pub fn verify_token(&self, token: &str) -> Result<Claims, AuthError> {
        let token = token.trim();
        let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|token_data| token_data.claims)
            .map_err(|err| AuthError::InvalidToken(err.to_string()))
    }
}

/// 用 JWT 校验连接凭证，再到用户存储里取资料
pub struct JwtIdentityVerifier {
    jwt: Arc<JwtService>,
    users: Arc<dyn UserRepository>,
}

impl JwtIdentityVerifier {
    pub fn new(jwt: Arc<JwtService>, users: Arc<dyn UserRepository>) -> Self {
        Self { jwt, users }
    }
}

#[async_trait]
impl IdentityVerifier for JwtIdentityVerifier {
    async fn verify(&self, token: &str) -> Result<UserProfile, AuthError> {
        let claims = self.jwt.verify_token(token)?;
        let user_id = UserId::from(claims.sub);
        match self.users.find_by_id(user_id).await {
            Ok(Some(profile)) => Ok(profile),
            Ok(None) => {
                tracing::debug!(user_id = %user_id, "token 对应的用户不存在");
                Err(AuthError::UnknownUser)
            }
            Err(err) => Err(AuthError::Unavailable(err.to_string())),
        }
    }
}
