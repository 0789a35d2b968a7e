use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::{error::ApiError, state::AppState, ws_connection::WebSocketConnection};

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(websocket_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// 升级前完成认证：查询参数 `token` 优先，其次 `Authorization` 头
async fn websocket_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let token = query.token.or_else(|| {
        headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    });

    let user = state
        .gateway
        .authenticate(token.as_deref())
        .await
        .map_err(|err| {
            tracing::warn!(error = %err, "WebSocket 认证失败");
            ApiError::from(err)
        })?;

    let gateway = state.gateway.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        WebSocketConnection::open(socket, gateway, user).await.run().await;
    }))
}
