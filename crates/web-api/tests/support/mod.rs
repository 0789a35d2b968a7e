use std::{net::SocketAddr, sync::Arc, time::Duration};

use application::{
    identity::IdentityVerifier,
    notifications::memory::MemoryNotificationBroker,
    repository::memory::{InMemoryMessageRepository, InMemoryUserRepository},
    ChatGateway, ChatGatewayDependencies, Clock, ConversationRooms, DeliveryDependencies,
    DeliveryPipeline, NotificationBroker, PresenceRegistry, SystemClock, TypingTracker,
    DEFAULT_TYPING_TIMEOUT,
};
use domain::{CompatibilityEngine, FixedPhrase, UserId, UserProfile};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::{net::TcpListener, net::TcpStream, sync::oneshot};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;
use web_api::{router, AppState, JwtConfig, JwtIdentityVerifier, JwtService};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 内存组件搭起来的完整服务
pub struct TestServer {
    pub addr: SocketAddr,
    pub jwt: Arc<JwtService>,
    pub users: Arc<InMemoryUserRepository>,
    pub messages: Arc<InMemoryMessageRepository>,
    pub broker: MemoryNotificationBroker,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let jwt = Arc::new(JwtService::new(JwtConfig {
            secret: "integration-test-secret-key-with-enough-length".into(),
            expiration_hours: 1,
        }));
        let users = Arc::new(InMemoryUserRepository::new());
        let messages = Arc::new(InMemoryMessageRepository::new());
        let broker = MemoryNotificationBroker::default();
        let broker_dyn: Arc<dyn NotificationBroker> = Arc::new(broker.clone());
        let presence = Arc::new(PresenceRegistry::new(clock.clone()));
        let rooms = Arc::new(ConversationRooms::new());
        let compatibility = CompatibilityEngine::new(Arc::new(FixedPhrase(0)));
        let identity: Arc<dyn IdentityVerifier> =
            Arc::new(JwtIdentityVerifier::new(jwt.clone(), users.clone()));

        let delivery = Arc::new(DeliveryPipeline::new(DeliveryDependencies {
            user_repository: users.clone(),
            message_repository: messages.clone(),
            broker: broker_dyn.clone(),
            presence: presence.clone(),
            rooms: rooms.clone(),
            compatibility: compatibility.clone(),
            clock: clock.clone(),
        }));
        let typing = TypingTracker::new(
            presence.clone(),
            rooms.clone(),
            clock.clone(),
            DEFAULT_TYPING_TIMEOUT,
        );
        let gateway = ChatGateway::new(ChatGatewayDependencies {
            identity,
            user_repository: users.clone(),
            message_repository: messages.clone(),
            broker: broker_dyn,
            presence,
            rooms,
            typing,
            delivery,
            compatibility,
            clock,
        });

        let app = router(AppState::new(gateway, jwt.clone()));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            addr,
            jwt,
            users,
            messages,
            broker,
            shutdown: Some(shutdown_tx),
        }
    }

    /// 注册用户并返回 (资料, token)
    pub async fn user(&self, username: &str, sign: &str) -> (UserProfile, String) {
        let profile = UserProfile::new(UserId::from(Uuid::new_v4()), username).with_zodiac(sign);
        self.users.insert(profile.clone()).await;
        let token = self.jwt.generate_token(&profile).expect("token");
        (profile, token)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// 读到指定事件为止，返回其 `data`
pub async fn next_event(client: &mut Client, name: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(3), async {
        while let Some(Ok(message)) = client.next().await {
            if let Message::Text(text) = message {
                let value: Value = serde_json::from_str(&text).expect("json frame");
                if value["event"] == name {
                    return value["data"].clone();
                }
            }
        }
        panic!("connection closed before {name}");
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {name}"))
}

/// 读到指定 id 的 ack 为止，返回其 `response`
pub async fn next_ack(client: &mut Client, id: u64) -> Value {
    loop {
        let data = next_event(client, "ack").await;
        if data["id"] == id {
            return data["response"].clone();
        }
    }
}
