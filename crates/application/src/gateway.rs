//! 实时网关
//!
//! 负责一条连接的完整生命周期：
//! - 连接：登记在线状态、声明并订阅用户队列、加入个人房间、广播上线
//! - 事件：解析客户端帧并分发到各个服务，带 `id` 的帧以 `ack` 回执
//! - 断开：退出房间、注销在线状态、清除输入状态
//!
//! 传输层只需要把文本帧交给 [`ChatGateway::handle_frame`]，把 [`ConnectionHandle`]
//! 的接收端写回 socket。

use std::sync::Arc;

use domain::{CompatibilityEngine, MessageId, UserId, UserProfile};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::connection::ConnectionHandle;
use crate::delivery::DeliveryPipeline;
use crate::error::ApplicationError;
use crate::events::{
    required, ClientEvent, ClientFrame, ConversationEntry, ConversationHistory,
    ConversationJoined, ConversationLeft, MarkAsReadPayload, MessageErrorNotice,
    OnlineUsersList, OtherUserPayload, PublicProfile, SendMessagePayload, ServerEvent,
    TypingPayload, UserPayload,
};
use crate::identity::{AuthError, IdentityVerifier};
use crate::notifications::{NotificationBroker, NotificationStream};
use crate::presence::PresenceRegistry;
use crate::repository::{MessageRepository, UserRepository};
use crate::rooms::{personal_room, ConversationRooms};
use crate::typing::TypingTracker;

pub struct ChatGatewayDependencies {
    pub identity: Arc<dyn IdentityVerifier>,
    pub user_repository: Arc<dyn UserRepository>,
    pub message_repository: Arc<dyn MessageRepository>,
    pub broker: Arc<dyn NotificationBroker>,
    pub presence: Arc<PresenceRegistry>,
    pub rooms: Arc<ConversationRooms>,
    pub typing: TypingTracker,
    pub delivery: Arc<DeliveryPipeline>,
    pub compatibility: CompatibilityEngine,
    pub clock: Arc<dyn Clock>,
}

/// 一条已认证连接的会话状态
pub struct Session {
    user: UserProfile,
    handle: ConnectionHandle,
    forwarder: Option<JoinHandle<()>>,
}

impl Session {
    pub fn user(&self) -> &UserProfile {
        &self.user
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// 是否挂上了 broker 消费者
    pub fn is_subscribed(&self) -> bool {
        self.forwarder.is_some()
    }
}

#[derive(Clone)]
pub struct ChatGateway {
    deps: Arc<ChatGatewayDependencies>,
}

impl ChatGateway {
    pub fn new(deps: ChatGatewayDependencies) -> Self {
        Self {
            deps: Arc::new(deps),
        }
    }

    pub fn presence(&self) -> &Arc<PresenceRegistry> {
        &self.deps.presence
    }

    /// 校验连接凭证。
    pub async fn authenticate(&self, token: Option<&str>) -> Result<UserProfile, AuthError> {
        let token = token.map(str::trim).filter(|t| !t.is_empty());
        let Some(token) = token else {
            return Err(AuthError::MissingToken);
        };
        self.deps.identity.verify(token).await
    }

    /// 建立会话。broker 不可用时只记日志，本地连接照常可用。
    pub async fn connect(&self, user: UserProfile, handle: ConnectionHandle) -> Session {
        self.deps
            .presence
            .register(user.clone(), handle.clone())
            .await;

        let forwarder = match self.attach_consumer(user.id).await {
            Ok(stream) => Some(tokio::spawn(forward_notifications(
                self.deps.delivery.clone(),
                user.id,
                stream,
            ))),
            Err(err) => {
                tracing::warn!(user_id = %user.id, error = %err, "订阅用户队列失败，仅使用本地推送");
                None
            }
        };

        self.deps
            .rooms
            .join_key(&handle, &personal_room(user.id))
            .await;
        self.deps.presence.announce_online(&user, handle.id()).await;

        let entries = self.deps.presence.online_entries().await;
        handle.emit(ServerEvent::OnlineUsers(entries));

        tracing::info!(
            user_id = %user.id,
            username = %user.username,
            connection_id = %handle.id(),
            "用户已连接"
        );
        Session {
            user,
            handle,
            forwarder,
        }
    }

    /// 结束会话。旧连接（已被新连接替换）只退出房间，不影响在线状态。
    pub async fn disconnect(&self, mut session: Session) {
        if let Some(forwarder) = session.forwarder.take() {
            forwarder.abort();
        }
        self.deps.rooms.leave_all(session.handle.id()).await;

        let removed = self
            .deps
            .presence
            .unregister(session.user.id, session.handle.id())
            .await;
        if removed {
            self.deps.typing.clear(session.user.id).await;
        }
        tracing::info!(
            user_id = %session.user.id,
            connection_id = %session.handle.id(),
            removed,
            "用户已断开"
        );
    }

    /// 处理一条客户端文本帧。
    pub async fn handle_frame(&self, session: &Session, text: &str) {
        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(user_id = %session.user.id, error = %err, "无法解析的客户端帧");
                session.handle.emit(ServerEvent::MessageError(MessageErrorNotice {
                    error: "Invalid frame".to_owned(),
                    timestamp: self.deps.clock.now(),
                }));
                return;
            }
        };

        let is_send = frame.event == "send_message";
        let result = match ClientEvent::parse(&frame.event, frame.data) {
            Ok(event) => self.dispatch(session, event).await,
            Err(err) => Err(err),
        };

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(
                    user_id = %session.user.id,
                    event = %frame.event,
                    error = %err,
                    "客户端事件处理失败"
                );
                if is_send {
                    session.handle.emit(ServerEvent::MessageError(MessageErrorNotice {
                        error: err.to_string(),
                        timestamp: self.deps.clock.now(),
                    }));
                }
                json!({ "success": false, "error": err.to_string() })
            }
        };

        if let Some(id) = frame.id {
            session.handle.emit(ServerEvent::Ack { id, response });
        }
    }

    async fn dispatch(
        &self,
        session: &Session,
        event: ClientEvent,
    ) -> Result<Value, ApplicationError> {
        match event {
            ClientEvent::SendMessage(payload) => self.send_message(session, payload).await,
            ClientEvent::JoinConversation(payload) => {
                self.join_conversation(session, payload).await
            }
            ClientEvent::LeaveConversation(payload) => {
                self.leave_conversation(session, payload).await
            }
            ClientEvent::TypingStart(payload) => self.typing(session, payload, true).await,
            ClientEvent::TypingStop(payload) => self.typing(session, payload, false).await,
            ClientEvent::MarkAsRead(payload) => self.mark_as_read(session, payload).await,
            ClientEvent::GetZodiacCompatibility(payload) => {
                self.zodiac_compatibility(session, payload).await
            }
            ClientEvent::GetOnlineUsers => self.online_users(session).await,
            ClientEvent::GetUserProfile(payload) => self.user_profile(payload).await,
            ClientEvent::GetConversations => self.conversations(session).await,
            ClientEvent::Ping => Ok(json!({
                "success": true,
                "message": "pong",
                "userId": session.user.id,
                "timestamp": self.deps.clock.now(),
            })),
        }
    }

    async fn send_message(
        &self,
        session: &Session,
        payload: SendMessagePayload,
    ) -> Result<Value, ApplicationError> {
        const MISSING: &str = "Receiver ID and content are required";
        let receiver = UserId::parse(required(&payload.receiver_id, MISSING)?)?;
        let content = required(&payload.content, MISSING)?;

        let envelope = self
            .deps
            .delivery
            .deliver(&session.user, &session.handle, receiver, content)
            .await?;
        Ok(json!({ "success": true, "message": envelope }))
    }

    async fn join_conversation(
        &self,
        session: &Session,
        payload: OtherUserPayload,
    ) -> Result<Value, ApplicationError> {
        let other_id = UserId::parse(required(
            &payload.other_user_id,
            "Other user ID is required",
        )?)?;
        let other = self
            .deps
            .user_repository
            .find_by_id(other_id)
            .await?
            .ok_or(ApplicationError::UserNotFound)?;

        let room = self
            .deps
            .rooms
            .join(&session.handle, session.user.id, other.id)
            .await;
        let compatibility = self
            .deps
            .compatibility
            .score(session.user.zodiac_label(), other.zodiac_label());
        let other_profile = PublicProfile::from(&other);

        session
            .handle
            .emit(ServerEvent::ConversationJoined(ConversationJoined {
                other_user: other_profile.clone(),
                room: room.clone(),
                compatibility: compatibility.clone(),
                timestamp: self.deps.clock.now(),
            }));

        let messages = self
            .deps
            .message_repository
            .list_between(session.user.id, other.id)
            .await?;
        session
            .handle
            .emit(ServerEvent::ConversationHistory(ConversationHistory {
                messages,
                compatibility: compatibility.clone(),
                other_user_zodiac: other.zodiac_sign.clone(),
                timestamp: self.deps.clock.now(),
            }));

        tracing::debug!(user_id = %session.user.id, room = %room, "加入会话");
        Ok(json!({
            "success": true,
            "room": room,
            "otherUser": other_profile,
            "compatibility": compatibility,
        }))
    }

    async fn leave_conversation(
        &self,
        session: &Session,
        payload: OtherUserPayload,
    ) -> Result<Value, ApplicationError> {
        let other_id = UserId::parse(required(
            &payload.other_user_id,
            "Other user ID is required",
        )?)?;
        let room = self
            .deps
            .rooms
            .leave(session.handle.id(), session.user.id, other_id)
            .await;
        session
            .handle
            .emit(ServerEvent::ConversationLeft(ConversationLeft {
                other_user_id: other_id,
                room: room.clone(),
                timestamp: self.deps.clock.now(),
            }));
        Ok(json!({ "success": true, "room": room }))
    }

    async fn typing(
        &self,
        session: &Session,
        payload: TypingPayload,
        typing: bool,
    ) -> Result<Value, ApplicationError> {
        let receiver = UserId::parse(required(&payload.receiver_id, "Receiver ID is required")?)?;
        if typing {
            self.deps
                .typing
                .start(&session.user, receiver, payload.conversation_id)
                .await;
        } else {
            self.deps
                .typing
                .stop(&session.user, receiver, payload.conversation_id)
                .await;
        }
        Ok(json!({ "success": true }))
    }

    async fn mark_as_read(
        &self,
        session: &Session,
        payload: MarkAsReadPayload,
    ) -> Result<Value, ApplicationError> {
        let message_id = MessageId::parse(required(&payload.message_id, "Message ID is required")?)?;
        let outcome = self
            .deps
            .delivery
            .mark_as_read(&session.user, message_id, payload.conversation_id)
            .await?;
        Ok(json!({
            "success": true,
            "messageId": outcome.message.id,
            "readAt": outcome.message.read_at,
        }))
    }

    async fn zodiac_compatibility(
        &self,
        session: &Session,
        payload: OtherUserPayload,
    ) -> Result<Value, ApplicationError> {
        let other_id = UserId::parse(required(
            &payload.other_user_id,
            "Other user ID is required",
        )?)?;
        let other = self.deps.user_repository.find_by_id(other_id).await?;
        let compatibility = self.deps.compatibility.score(
            session.user.zodiac_label(),
            other.as_ref().and_then(UserProfile::zodiac_label),
        );
        Ok(json!({ "success": true, "compatibility": compatibility }))
    }

    async fn online_users(&self, session: &Session) -> Result<Value, ApplicationError> {
        let users = self.deps.presence.online_users().await;
        let count = users.len();
        session
            .handle
            .emit(ServerEvent::OnlineUsersList(OnlineUsersList {
                users: users.clone(),
                count,
                timestamp: self.deps.clock.now(),
            }));
        Ok(json!({ "success": true, "users": users, "count": count }))
    }

    async fn user_profile(&self, payload: UserPayload) -> Result<Value, ApplicationError> {
        let user_id = UserId::parse(required(&payload.user_id, "User ID is required")?)?;
        let profile = self
            .deps
            .user_repository
            .find_by_id(user_id)
            .await?
            .ok_or(ApplicationError::UserNotFound)?;

        let today = self.deps.clock.now().date_naive();
        let mut user = serde_json::to_value(&profile)
            .map_err(|err| ApplicationError::validation(err.to_string()))?;
        if let Value::Object(fields) = &mut user {
            fields.insert("age".into(), json!(profile.age_on(today)));
            fields.insert(
                "zodiacElement".into(),
                json!(profile.element().map(|e| e.as_str())),
            );
            fields.insert("dailyHoroscope".into(), json!(profile.daily_horoscope()));
        }
        Ok(json!({ "success": true, "user": user }))
    }

    async fn conversations(&self, session: &Session) -> Result<Value, ApplicationError> {
        let summaries = self
            .deps
            .message_repository
            .list_conversations_for(session.user.id)
            .await?;

        let mut conversations = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let partner = self
                .deps
                .user_repository
                .find_by_id(summary.partner_id)
                .await?
                .as_ref()
                .map(PublicProfile::from);
            conversations.push(ConversationEntry { summary, partner });
        }
        Ok(json!({ "success": true, "conversations": conversations }))
    }

    async fn attach_consumer(&self, user: UserId) -> Result<NotificationStream, ApplicationError> {
        self.deps.broker.ensure_user_queue(user).await?;
        Ok(self.deps.broker.subscribe(user).await?)
    }
}

/// 把 broker 投递转给当前连接：成功 ack，失败 nack 并停止消费。
async fn forward_notifications(
    delivery: Arc<DeliveryPipeline>,
    user: UserId,
    mut stream: NotificationStream,
) {
    tracing::debug!(user_id = %user, "broker 消费者已挂载");
    while let Some(item) = stream.recv().await {
        match delivery.handle_notification(user, &item.envelope).await {
            Ok(()) => item.ack(),
            Err(err) => {
                tracing::warn!(
                    user_id = %user,
                    attempt = item.attempt,
                    error = %err,
                    "通知处理失败，退回队列"
                );
                item.nack();
                break;
            }
        }
    }
    tracing::debug!(user_id = %user, "broker 消费者已退出");
}
