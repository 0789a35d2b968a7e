use async_trait::async_trait;
use domain::{
    ConversationSummary, Message, MessageId, RepositoryError, Timestamp, UserId, UserProfile,
};

/// 用户资料存储（只读）。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: UserId) -> Result<Option<UserProfile>, RepositoryError>;
}

/// 已读标记的结果
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    pub message: Message,
    /// 本次调用是否真正写入了已读时间
    pub newly_read: bool,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn create(&self, message: Message) -> Result<Message, RepositoryError>;

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError>;

    // 条件更新：只有 read_at 为空时才写入。是否写入由存储判定，返回的记录带存储里的时间
    async fn mark_read(
        &self,
        id: MessageId,
        read_at: Timestamp,
    ) -> Result<Option<ReadOutcome>, RepositoryError>;

    // 两人之间的全部消息，按创建时间升序
    async fn list_between(&self, a: UserId, b: UserId) -> Result<Vec<Message>, RepositoryError>;

    // 每个对话对象的最后一条消息，按时间倒序
    async fn list_conversations_for(
        &self,
        user: UserId,
    ) -> Result<Vec<ConversationSummary>, RepositoryError>;
}

/// 内存实现（用于测试）
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    #[derive(Default)]
    pub struct InMemoryUserRepository {
        users: RwLock<HashMap<UserId, UserProfile>>,
    }

    impl InMemoryUserRepository {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn insert(&self, profile: UserProfile) {
            self.users.write().await.insert(profile.id, profile);
        }
    }

    #[async_trait]
    impl UserRepository for InMemoryUserRepository {
        async fn find_by_id(&self, id: UserId) -> Result<Option<UserProfile>, RepositoryError> {
            Ok(self.users.read().await.get(&id).cloned())
        }
    }

    #[derive(Default)]
    pub struct InMemoryMessageRepository {
        messages: RwLock<Vec<Message>>,
    }

    impl InMemoryMessageRepository {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn all(&self) -> Vec<Message> {
            self.messages.read().await.clone()
        }
    }

    #[async_trait]
    impl MessageRepository for InMemoryMessageRepository {
        async fn create(&self, message: Message) -> Result<Message, RepositoryError> {
            let mut messages = self.messages.write().await;
            if messages.iter().any(|m| m.id == message.id) {
                return Err(RepositoryError::Conflict);
            }
            messages.push(message.clone());
            Ok(message)
        }

        async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
            Ok(self.messages.read().await.iter().find(|m| m.id == id).cloned())
        }

        async fn mark_read(
            &self,
            id: MessageId,
            read_at: Timestamp,
        ) -> Result<Option<ReadOutcome>, RepositoryError> {
            let mut messages = self.messages.write().await;
            let Some(message) = messages.iter_mut().find(|m| m.id == id) else {
                return Ok(None);
            };
            let newly_read = message.read_at.is_none();
            if newly_read {
                message.read_at = Some(read_at);
            }
            Ok(Some(ReadOutcome {
                message: message.clone(),
                newly_read,
            }))
        }

        async fn list_between(
            &self,
            a: UserId,
            b: UserId,
        ) -> Result<Vec<Message>, RepositoryError> {
            let mut found: Vec<Message> = self
                .messages
                .read()
                .await
                .iter()
                .filter(|m| {
                    (m.sender_id == a && m.receiver_id == b)
                        || (m.sender_id == b && m.receiver_id == a)
                })
                .cloned()
                .collect();
            found.sort_by_key(|m| m.created_at);
            Ok(found)
        }

        async fn list_conversations_for(
            &self,
            user: UserId,
        ) -> Result<Vec<ConversationSummary>, RepositoryError> {
            let messages = self.messages.read().await;
            let mut summaries: HashMap<UserId, ConversationSummary> = HashMap::new();

            for message in messages.iter().filter(|m| m.involves(user)) {
                let partner = message.counterpart_of(user);
                let unread = u32::from(message.receiver_id == user && !message.is_read());
                let entry = summaries
                    .entry(partner)
                    .or_insert_with(|| ConversationSummary {
                        partner_id: partner,
                        last_message: message.clone(),
                        unread_count: 0,
                    });
                entry.unread_count += unread;
                if message.created_at > entry.last_message.created_at {
                    entry.last_message = message.clone();
                }
            }

            let mut result: Vec<ConversationSummary> = summaries.into_values().collect();
            result.sort_by(|a, b| b.last_message.created_at.cmp(&a.last_message.created_at));
            Ok(result)
        }
    }
}
