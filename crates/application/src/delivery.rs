//! 私信投递流水线
//!
//! 发送：校验接收者 → 持久化 → 计算匹配度 → 回给发送者 → 推给在线接收者 →
//! 广播到两个会话房间 → 无条件发布到 broker。broker 发布失败只记日志，
//! 已持久化的消息不会回滚。
//!
//! 已读：校验存在与权限 → 条件写入 `read_at` → 通知发送者与会话房间 → 发布到 broker。
//!
//! 另外负责把 broker 投递过来的通知转成客户端事件。

use std::sync::Arc;

use domain::{
    zodiac, CompatibilityEngine, DomainError, Message, MessageContent, MessageId, UserId,
    UserProfile,
};
use uuid::Uuid;

use crate::clock::Clock;
use crate::connection::ConnectionHandle;
use crate::error::ApplicationError;
use crate::events::{
    BrowserNotification, ForwardedNotification, MessageEnvelope, ReadReceipt, ServerEvent,
};
use crate::notifications::{
    BrokerNotification, MessageReadNotice, NewMessageNotice, NotificationBroker,
    NotificationEnvelope, NotifiedMessage, NotifiedSender, ReadMessageRef,
};
use crate::presence::PresenceRegistry;
use crate::repository::{MessageRepository, ReadOutcome, UserRepository};
use crate::rooms::{is_conversation_room, room_keys_for, ConversationRooms};

pub struct DeliveryDependencies {
    pub user_repository: Arc<dyn UserRepository>,
    pub message_repository: Arc<dyn MessageRepository>,
    pub broker: Arc<dyn NotificationBroker>,
    pub presence: Arc<PresenceRegistry>,
    pub rooms: Arc<ConversationRooms>,
    pub compatibility: CompatibilityEngine,
    pub clock: Arc<dyn Clock>,
}

pub struct DeliveryPipeline {
    deps: DeliveryDependencies,
}

impl DeliveryPipeline {
    pub fn new(deps: DeliveryDependencies) -> Self {
        Self { deps }
    }

    pub fn compatibility(&self) -> &CompatibilityEngine {
        &self.deps.compatibility
    }

    /// 发送一条私信。`origin` 是发起请求的连接，`message_sent` 回给它。
    pub async fn deliver(
        &self,
        sender: &UserProfile,
        origin: &ConnectionHandle,
        receiver_id: UserId,
        content: &str,
    ) -> Result<MessageEnvelope, ApplicationError> {
        let content = MessageContent::new(content)?;

        let receiver = self
            .deps
            .user_repository
            .find_by_id(receiver_id)
            .await?
            .ok_or(ApplicationError::ReceiverNotFound)?;

        let message = Message::new(
            MessageId::from(Uuid::new_v4()),
            sender.id,
            receiver.id,
            content,
            self.deps.clock.now(),
        );
        let message = self.deps.message_repository.create(message).await?;

        let compatibility = self
            .deps
            .compatibility
            .score(sender.zodiac_label(), receiver.zodiac_label());
        let envelope = MessageEnvelope {
            message: message.clone(),
            compatibility: compatibility.clone(),
            zodiac_insight: zodiac::insight_for(sender.zodiac_label()),
            daily_horoscope: sender.daily_horoscope().map(str::to_owned),
            sender_zodiac: sender.zodiac_sign.clone(),
            timestamp: self.deps.clock.now(),
        };

        origin.emit(ServerEvent::MessageSent(envelope.clone()));

        if let Some(handle) = self.deps.presence.lookup(receiver.id).await {
            handle.emit(ServerEvent::NewMessage(envelope.clone()));
            handle.emit(ServerEvent::BrowserNotification(
                BrowserNotification::for_message(
                    &sender.username,
                    message.content.as_str(),
                    message.id,
                    Some(sender.id),
                ),
            ));
        }

        let delivered = ServerEvent::MessageDelivered(envelope.clone());
        for key in room_keys_for(sender.id, receiver.id) {
            self.deps.rooms.broadcast(&key, &delivered).await;
        }

        let notification = BrokerNotification::NewMessage(NewMessageNotice {
            message: NotifiedMessage {
                id: message.id,
                content: message.content.as_str().to_owned(),
                sender: NotifiedSender {
                    id: sender.id,
                    username: sender.username.clone(),
                    zodiac_sign: sender.zodiac_sign.clone(),
                },
                created_at: message.created_at,
            },
            alert: format!("New message from {}", sender.username),
            zodiac_compatibility: Some(compatibility),
        });
        self.publish_best_effort(receiver.id, notification).await;

        tracing::info!(
            message_id = %message.id,
            sender_id = %sender.id,
            receiver_id = %receiver.id,
            "私信已投递"
        );
        Ok(envelope)
    }

    /// 接收者把消息标记为已读。已读过的消息直接返回原记录，不再重复通知。
    pub async fn mark_as_read(
        &self,
        reader: &UserProfile,
        message_id: MessageId,
        conversation_id: Option<String>,
    ) -> Result<ReadOutcome, ApplicationError> {
        let message = self
            .deps
            .message_repository
            .find_by_id(message_id)
            .await?
            .ok_or(ApplicationError::MessageNotFound)?;

        let read_at = self.deps.clock.now();
        let mut candidate = message.clone();
        candidate
            .mark_read(reader.id, read_at)
            .map_err(|err| match err {
                DomainError::NotMessageReceiver => ApplicationError::NotAuthorized,
                other => ApplicationError::Domain(other),
            })?;
        if message.is_read() {
            return Ok(ReadOutcome {
                message,
                newly_read: false,
            });
        }

        let outcome = self
            .deps
            .message_repository
            .mark_read(message_id, read_at)
            .await?
            .ok_or(ApplicationError::MessageNotFound)?;
        // 并发标记时以先写入者为准
        if !outcome.newly_read {
            return Ok(outcome);
        }
        let updated = outcome.message;
        // 以存储里的时间为准（数据库只保留到微秒）
        let read_at = updated.read_at.unwrap_or(read_at);

        let receipt = ServerEvent::MessageRead(ReadReceipt {
            message_id: updated.id,
            read_by: reader.id,
            read_by_username: reader.username.clone(),
            read_by_zodiac: reader.zodiac_sign.clone(),
            read_at,
            conversation_id: conversation_id.clone(),
            timestamp: self.deps.clock.now(),
        });
        if let Some(handle) = self.deps.presence.lookup(updated.sender_id).await {
            handle.emit(receipt.clone());
        }
        match conversation_id.as_deref() {
            Some(room) if is_conversation_room(room, reader.id, updated.sender_id) => {
                self.deps.rooms.broadcast(room, &receipt).await;
            }
            Some(room) => {
                tracing::debug!(reader_id = %reader.id, room = %room, "会话房间不属于这条消息，不广播");
            }
            None => {}
        }

        let notification = BrokerNotification::MessageRead(MessageReadNotice {
            message: ReadMessageRef {
                id: updated.id,
                read_by: reader.id,
                read_at,
                reader_zodiac: reader.zodiac_sign.clone(),
            },
            alert: "Your message was read".to_owned(),
        });
        self.publish_best_effort(updated.sender_id, notification)
            .await;

        tracing::info!(message_id = %updated.id, reader_id = %reader.id, "消息已读");
        Ok(ReadOutcome {
            message: updated,
            newly_read: true,
        })
    }

    /// 把一条 broker 通知推给用户当前的连接。用户不在线时返回错误，由调用方 nack。
    pub async fn handle_notification(
        &self,
        user: UserId,
        envelope: &NotificationEnvelope,
    ) -> Result<(), ApplicationError> {
        let handle = self
            .deps
            .presence
            .lookup(user)
            .await
            .ok_or(ApplicationError::RecipientOffline(user))?;

        let timestamp = self.deps.clock.now();
        let forwarded = ForwardedNotification {
            notification: envelope.data.clone(),
            via: "broker".to_owned(),
            timestamp,
        };

        let mut events = vec![ServerEvent::BrokerNotification(envelope.data.clone())];
        match &envelope.data {
            BrokerNotification::NewMessage(notice) => {
                events.push(ServerEvent::NewMessageNotification(forwarded));
                events.push(ServerEvent::BrowserNotification(
                    BrowserNotification::for_message(
                        &notice.message.sender.username,
                        &notice.message.content,
                        notice.message.id,
                        None,
                    ),
                ));
            }
            BrokerNotification::MessageRead(_) => {
                events.push(ServerEvent::MessageReadNotification(forwarded));
            }
        }

        for event in events {
            if !handle.emit(event) {
                return Err(ApplicationError::RecipientOffline(user));
            }
        }
        tracing::debug!(user_id = %user, kind = envelope.data.kind(), "broker 通知已推送");
        Ok(())
    }

    async fn publish_best_effort(&self, routing_key: UserId, notification: BrokerNotification) {
        let kind = notification.kind();
        let envelope = NotificationEnvelope::new(notification, self.deps.clock.now());

        // 先声明队列，保证从未连接过的用户也能离线收到
        let result = match self.deps.broker.ensure_user_queue(routing_key).await {
            Ok(()) => self.deps.broker.publish(routing_key, &envelope).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            tracing::warn!(
                routing_key = %routing_key,
                kind,
                error = %err,
                "broker 发布失败，已忽略"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::connection::Outbound;
    use crate::notifications::memory::MemoryNotificationBroker;
    use crate::repository::memory::{InMemoryMessageRepository, InMemoryUserRepository};
    use crate::repository::{MockMessageRepository, MockUserRepository};
    use crate::rooms::personal_room;
    use chrono::SubsecRound;
    use domain::{FixedPhrase, RepositoryError};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        pipeline: DeliveryPipeline,
        broker: MemoryNotificationBroker,
        messages: Arc<InMemoryMessageRepository>,
        presence: Arc<PresenceRegistry>,
        rooms: Arc<ConversationRooms>,
        aries: UserProfile,
        leo: UserProfile,
    }

    /// 模拟 TIMESTAMPTZ：写入的时间只保留到微秒
    struct MicrosecondStore {
        inner: Arc<InMemoryMessageRepository>,
    }

    #[async_trait::async_trait]
    impl MessageRepository for MicrosecondStore {
        async fn create(&self, message: Message) -> Result<Message, RepositoryError> {
            self.inner.create(message).await
        }

        async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
            self.inner.find_by_id(id).await
        }

        async fn mark_read(
            &self,
            id: MessageId,
            read_at: domain::Timestamp,
        ) -> Result<Option<ReadOutcome>, RepositoryError> {
            self.inner.mark_read(id, read_at.trunc_subsecs(6)).await
        }

        async fn list_between(
            &self,
            a: UserId,
            b: UserId,
        ) -> Result<Vec<Message>, RepositoryError> {
            self.inner.list_between(a, b).await
        }

        async fn list_conversations_for(
            &self,
            user: UserId,
        ) -> Result<Vec<domain::ConversationSummary>, RepositoryError> {
            self.inner.list_conversations_for(user).await
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(false).await
    }

    async fn fixture_with(microsecond_store: bool) -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let users = Arc::new(InMemoryUserRepository::new());
        let messages = Arc::new(InMemoryMessageRepository::new());
        let broker = MemoryNotificationBroker::default();
        let presence = Arc::new(PresenceRegistry::new(clock.clone()));

        let aries = UserProfile::new(UserId::from(Uuid::new_v4()), "alice").with_zodiac("Aries");
        let leo = UserProfile::new(UserId::from(Uuid::new_v4()), "bob").with_zodiac("Leo");
        users.insert(aries.clone()).await;
        users.insert(leo.clone()).await;

        let message_repository: Arc<dyn MessageRepository> = if microsecond_store {
            Arc::new(MicrosecondStore {
                inner: messages.clone(),
            }) as Arc<dyn MessageRepository>
        } else {
            messages.clone() as Arc<dyn MessageRepository>
        };
        let rooms = Arc::new(ConversationRooms::new());

        let pipeline = DeliveryPipeline::new(DeliveryDependencies {
            user_repository: users,
            message_repository,
            broker: Arc::new(broker.clone()),
            presence: presence.clone(),
            rooms: rooms.clone(),
            compatibility: CompatibilityEngine::new(Arc::new(FixedPhrase(0))),
            clock,
        });

        Fixture {
            pipeline,
            broker,
            messages,
            presence,
            rooms,
            aries,
            leo,
        }
    }

    fn events(rx: &mut UnboundedReceiver<Outbound>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Event(event) = item {
                out.push(event);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_deliver_to_offline_receiver() {
        let f = fixture().await;
        let (origin, mut origin_rx) = ConnectionHandle::new(chrono::Utc::now());

        let envelope = f
            .pipeline
            .deliver(&f.aries, &origin, f.leo.id, "hi")
            .await
            .unwrap();

        assert!(envelope.compatibility.compatible);
        assert_eq!(envelope.compatibility.score, 95);
        assert!(envelope.message.read_at.is_none());

        let stored = f.messages.all().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content.as_str(), "hi");

        let sent = events(&mut origin_rx);
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], ServerEvent::MessageSent(e) if e.compatibility.score == 95));

        let queued = f.broker.pending(f.leo.id).await;
        assert_eq!(queued.len(), 1);
        match &queued[0].data {
            BrokerNotification::NewMessage(notice) => {
                assert_eq!(notice.message.id, envelope.message.id);
                assert_eq!(notice.alert, "New message from alice");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deliver_to_online_receiver_emits_locally() {
        let f = fixture().await;
        let (origin, _origin_rx) = ConnectionHandle::new(chrono::Utc::now());
        let (leo_handle, mut leo_rx) = ConnectionHandle::new(chrono::Utc::now());
        f.presence.register(f.leo.clone(), leo_handle).await;

        f.pipeline
            .deliver(&f.aries, &origin, f.leo.id, "hello leo")
            .await
            .unwrap();

        let names: Vec<&str> = events(&mut leo_rx).iter().map(ServerEvent::name).collect();
        assert_eq!(names, vec!["new_message", "browser_notification"]);
        // 双通道：broker 仍然会收到一份
        assert_eq!(f.broker.queue_depth(f.leo.id).await, 1);
    }

    #[tokio::test]
    async fn test_unknown_receiver_is_rejected_before_persisting() {
        let f = fixture().await;
        let (origin, mut origin_rx) = ConnectionHandle::new(chrono::Utc::now());

        let err = f
            .pipeline
            .deliver(&f.aries, &origin, UserId::from(Uuid::new_v4()), "hi")
            .await
            .unwrap_err();

        assert!(matches!(err, ApplicationError::ReceiverNotFound));
        assert!(f.messages.all().await.is_empty());
        assert!(events(&mut origin_rx).is_empty());
    }

    #[tokio::test]
    async fn test_broker_outage_does_not_fail_send() {
        let f = fixture().await;
        let (origin, _rx) = ConnectionHandle::new(chrono::Utc::now());
        f.broker.set_available(false);

        let envelope = f
            .pipeline
            .deliver(&f.aries, &origin, f.leo.id, "still persisted")
            .await
            .unwrap();

        assert_eq!(f.messages.all().await[0].id, envelope.message.id);
        f.broker.set_available(true);
        assert_eq!(f.broker.queue_depth(f.leo.id).await, 0);
    }

    #[tokio::test]
    async fn test_mark_as_read_rules() {
        let f = fixture().await;
        let (origin, _rx) = ConnectionHandle::new(chrono::Utc::now());
        let (aries_handle, mut aries_rx) = ConnectionHandle::new(chrono::Utc::now());
        f.presence.register(f.aries.clone(), aries_handle).await;

        let sent = f
            .pipeline
            .deliver(&f.aries, &origin, f.leo.id, "read me")
            .await
            .unwrap();
        let id = sent.message.id;
        events(&mut aries_rx);

        let err = f.pipeline.mark_as_read(&f.aries, id, None).await.unwrap_err();
        assert!(matches!(err, ApplicationError::NotAuthorized));

        let err = f
            .pipeline
            .mark_as_read(&f.leo, MessageId::from(Uuid::new_v4()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::MessageNotFound));

        let first = f.pipeline.mark_as_read(&f.leo, id, None).await.unwrap();
        assert!(first.newly_read);
        let read_at = first.message.read_at.unwrap();

        let second = f.pipeline.mark_as_read(&f.leo, id, None).await.unwrap();
        assert!(!second.newly_read);
        assert_eq!(second.message.read_at, Some(read_at));

        let receipts: Vec<ServerEvent> = events(&mut aries_rx);
        assert_eq!(receipts.len(), 1);
        assert!(matches!(&receipts[0], ServerEvent::MessageRead(r) if r.read_by == f.leo.id));

        let queued = f.broker.pending(f.aries.id).await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].data.kind(), "MESSAGE_READ");
    }

    #[tokio::test]
    async fn test_first_read_is_detected_when_store_truncates_timestamps() {
        let f = fixture_with(true).await;
        let (origin, _rx) = ConnectionHandle::new(chrono::Utc::now());
        let (aries_handle, mut aries_rx) = ConnectionHandle::new(chrono::Utc::now());
        f.presence.register(f.aries.clone(), aries_handle).await;

        let mut ids = Vec::new();
        for i in 0..5 {
            let sent = f
                .pipeline
                .deliver(&f.aries, &origin, f.leo.id, &format!("message {i}"))
                .await
                .unwrap();
            ids.push(sent.message.id);
        }
        events(&mut aries_rx);

        for id in &ids {
            let outcome = f.pipeline.mark_as_read(&f.leo, *id, None).await.unwrap();
            assert!(outcome.newly_read);
            let again = f.pipeline.mark_as_read(&f.leo, *id, None).await.unwrap();
            assert!(!again.newly_read);
            assert_eq!(again.message.read_at, outcome.message.read_at);
        }

        let receipts: Vec<ServerEvent> = events(&mut aries_rx)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::MessageRead(_)))
            .collect();
        assert_eq!(receipts.len(), ids.len());
        // 回执里的时间与存储一致
        let stored = f.messages.all().await;
        for receipt in &receipts {
            let ServerEvent::MessageRead(receipt) = receipt else {
                unreachable!()
            };
            let message = stored.iter().find(|m| m.id == receipt.message_id).unwrap();
            assert_eq!(message.read_at, Some(receipt.read_at));
        }

        let read_notices = f
            .broker
            .pending(f.aries.id)
            .await
            .into_iter()
            .filter(|e| e.data.kind() == "MESSAGE_READ")
            .count();
        assert_eq!(read_notices, ids.len());
    }

    #[tokio::test]
    async fn test_read_receipt_only_reaches_the_conversation_rooms() {
        let f = fixture().await;
        let (origin, _rx) = ConnectionHandle::new(chrono::Utc::now());
        let sent = f
            .pipeline
            .deliver(&f.aries, &origin, f.leo.id, "scoped")
            .await
            .unwrap();

        let (member, mut member_rx) = ConnectionHandle::new(chrono::Utc::now());
        let (bystander, mut bystander_rx) = ConnectionHandle::new(chrono::Utc::now());
        let [room, _] = room_keys_for(f.leo.id, f.aries.id);
        let foreign = personal_room(UserId::from(Uuid::new_v4()));
        f.rooms.join_key(&member, &room).await;
        f.rooms.join_key(&bystander, &foreign).await;

        f.pipeline
            .mark_as_read(&f.leo, sent.message.id, Some(foreign))
            .await
            .unwrap();
        assert!(events(&mut bystander_rx).is_empty());

        let second = f
            .pipeline
            .deliver(&f.aries, &origin, f.leo.id, "scoped again")
            .await
            .unwrap();
        events(&mut member_rx);
        f.pipeline
            .mark_as_read(&f.leo, second.message.id, Some(room))
            .await
            .unwrap();
        let names: Vec<&str> = events(&mut member_rx).iter().map(ServerEvent::name).collect();
        assert_eq!(names, vec!["message_read"]);
    }

    #[tokio::test]
    async fn test_handle_notification_requires_live_connection() {
        let f = fixture().await;
        let (origin, _rx) = ConnectionHandle::new(chrono::Utc::now());
        f.pipeline
            .deliver(&f.aries, &origin, f.leo.id, "queued")
            .await
            .unwrap();
        let envelope = f.broker.pending(f.leo.id).await.remove(0);

        let err = f
            .pipeline
            .handle_notification(f.leo.id, &envelope)
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::RecipientOffline(_)));

        let (leo_handle, mut leo_rx) = ConnectionHandle::new(chrono::Utc::now());
        f.presence.register(f.leo.clone(), leo_handle).await;
        f.pipeline
            .handle_notification(f.leo.id, &envelope)
            .await
            .unwrap();

        let names: Vec<&str> = events(&mut leo_rx).iter().map(ServerEvent::name).collect();
        assert_eq!(
            names,
            vec![
                "broker_notification",
                "new_message_notification",
                "browser_notification"
            ]
        );
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_as_repository_error() {
        let receiver = UserProfile::new(UserId::from(Uuid::new_v4()), "bob").with_zodiac("Leo");
        let sender = UserProfile::new(UserId::from(Uuid::new_v4()), "alice").with_zodiac("Aries");

        let mut users = MockUserRepository::new();
        let found = receiver.clone();
        users
            .expect_find_by_id()
            .returning(move |_| Ok(Some(found.clone())));
        let mut messages = MockMessageRepository::new();
        messages
            .expect_create()
            .returning(|_| Err(RepositoryError::storage("connection reset")));

        let broker = MemoryNotificationBroker::default();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let pipeline = DeliveryPipeline::new(DeliveryDependencies {
            user_repository: Arc::new(users),
            message_repository: Arc::new(messages),
            broker: Arc::new(broker.clone()),
            presence: Arc::new(PresenceRegistry::new(clock.clone())),
            rooms: Arc::new(ConversationRooms::new()),
            compatibility: CompatibilityEngine::default(),
            clock,
        });

        let (origin, mut origin_rx) = ConnectionHandle::new(chrono::Utc::now());
        let err = pipeline
            .deliver(&sender, &origin, receiver.id, "hi")
            .await
            .unwrap_err();

        assert!(matches!(err, ApplicationError::Repository(_)));
        assert!(events(&mut origin_rx).is_empty());
        assert_eq!(broker.queue_depth(receiver.id).await, 0);
    }
}
