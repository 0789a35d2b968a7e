//! 主应用程序入口
//!
//! 加载配置、连接 PostgreSQL 与 broker，组装实时核心并启动 Axum 服务。

use std::sync::Arc;

use anyhow::Context;
use application::{
    ChatGateway, ChatGatewayDependencies, Clock, ConversationRooms, DeliveryDependencies,
    DeliveryPipeline, IdentityVerifier, PresenceRegistry, SystemClock, TypingTracker,
};
use config::AppConfig;
use domain::CompatibilityEngine;
use infrastructure::Infrastructure;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtIdentityVerifier, JwtService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load().context("加载配置失败")?;
    tracing::info!(config = %config.sanitize(), "配置已加载");

    let infrastructure = Infrastructure::connect(&config)
        .await
        .context("初始化基础设施失败")?;
    let supervisor = infrastructure.spawn_broker_supervisor();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let user_repository = infrastructure.user_repository();
    let message_repository = infrastructure.message_repository();
    let broker = infrastructure.notification_broker();
    let presence = Arc::new(PresenceRegistry::new(clock.clone()));
    let rooms = Arc::new(ConversationRooms::new());
    let compatibility = CompatibilityEngine::default();

    let jwt_service = Arc::new(JwtService::new(config.jwt.clone()));
    let identity: Arc<dyn IdentityVerifier> = Arc::new(JwtIdentityVerifier::new(
        jwt_service.clone(),
        user_repository.clone(),
    ));

    let delivery = Arc::new(DeliveryPipeline::new(DeliveryDependencies {
        user_repository: user_repository.clone(),
        message_repository: message_repository.clone(),
        broker: broker.clone(),
        presence: presence.clone(),
        rooms: rooms.clone(),
        compatibility: compatibility.clone(),
        clock: clock.clone(),
    }));
    let typing = TypingTracker::new(
        presence.clone(),
        rooms.clone(),
        clock.clone(),
        config.realtime.typing_timeout(),
    );

    let gateway = ChatGateway::new(ChatGatewayDependencies {
        identity,
        user_repository,
        message_repository,
        broker,
        presence,
        rooms,
        typing,
        delivery,
        compatibility,
        clock,
    });

    let app = router(AppState::new(gateway, jwt_service));
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("监听 {addr} 失败"))?;

    tracing::info!(%addr, "服务器启动");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    supervisor.abort();
    tracing::info!("服务器已关闭");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "无法监听退出信号");
        std::future::pending::<()>().await;
    }
}
