//! Web API 层。
//!
//! 提供 Axum 路由：`/health` 健康检查与 `/ws` 实时通道。连接在升级前完成认证，
//! 之后的帧全部交给应用层的 [`application::ChatGateway`]。

mod auth;
mod error;
mod routes;
mod state;
mod ws_connection;

pub use auth::{Claims, JwtIdentityVerifier, JwtService};
pub use config::JwtConfig;
pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
