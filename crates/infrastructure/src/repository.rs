use std::sync::Arc;

use application::repository::{MessageRepository, ReadOutcome, UserRepository};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use domain::{
    ConversationSummary, Message, MessageContent, MessageId, RepositoryError, Timestamp, UserId,
    UserProfile,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use uuid::Uuid;

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    RepositoryError::storage(err.to_string())
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, content, created_at, read_at";

#[derive(Debug, FromRow)]
struct UserRecord {
    id: Uuid,
    username: String,
    name: Option<String>,
    birthday: Option<NaiveDate>,
    zodiac_sign: Option<String>,
    horoscope: Option<String>,
    height: Option<i32>,
    weight: Option<i32>,
    interests: Vec<String>,
}

impl From<UserRecord> for UserProfile {
    fn from(value: UserRecord) -> Self {
        let mut profile = UserProfile::new(UserId::from(value.id), value.username);
        profile.name = value.name;
        profile.horoscope = value.horoscope;
        profile.height = value.height;
        profile.weight = value.weight;
        profile.interests = value.interests;
        if let Some(label) = value.zodiac_sign {
            profile = profile.with_zodiac(label);
        }
        // 没有星座标签时由生日推算
        if let Some(birthday) = value.birthday {
            profile = profile.with_birthday(birthday);
        }
        profile
    }
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: Uuid,
    sender_id: Uuid,
    receiver_id: Uuid,
    content: String,
    created_at: DateTime<Utc>,
    read_at: Option<DateTime<Utc>>,
}

impl TryFrom<MessageRecord> for Message {
    type Error = RepositoryError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        let content =
            MessageContent::new(value.content).map_err(|err| invalid_data(err.to_string()))?;
        let mut message = Message::new(
            MessageId::from(value.id),
            UserId::from(value.sender_id),
            UserId::from(value.receiver_id),
            content,
            value.created_at,
        );
        message.read_at = value.read_at;
        Ok(message)
    }
}

#[derive(Debug, FromRow)]
struct ConversationRecord {
    partner_id: Uuid,
    #[sqlx(flatten)]
    message: MessageRecord,
    unread_count: i64,
}

impl TryFrom<ConversationRecord> for ConversationSummary {
    type Error = RepositoryError;

    fn try_from(value: ConversationRecord) -> Result<Self, Self::Error> {
        Ok(ConversationSummary {
            partner_id: UserId::from(value.partner_id),
            last_message: Message::try_from(value.message)?,
            unread_count: u32::try_from(value.unread_count)
                .map_err(|err| invalid_data(err.to_string()))?,
        })
    }
}

#[derive(Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn find_by_id(&self, id: UserId) -> Result<Option<UserProfile>, RepositoryError> {
        let record = sqlx::query_as::<_, UserRecord>(
            r#"
            SELECT u.id, u.username, p.name, p.birthday, p.zodiac_sign, p.horoscope,
                   p.height, p.weight, COALESCE(p.interests, '{}') AS interests
            FROM users u
            LEFT JOIN profiles p ON p.user_id = u.id
            WHERE u.id = $1
            "#,
        )
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(record.map(UserProfile::from))
    }
}

#[derive(Clone)]
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn create(&self, message: Message) -> Result<Message, RepositoryError> {
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            INSERT INTO messages (id, sender_id, receiver_id, content, created_at, read_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(Uuid::from(message.id))
        .bind(Uuid::from(message.sender_id))
        .bind(Uuid::from(message.receiver_id))
        .bind(message.content.as_str())
        .bind(message.created_at)
        .bind(message.read_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict,
            _ => map_sqlx_err(err),
        })?;

        Message::try_from(record)
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Message::try_from).transpose()
    }

    async fn mark_read(
        &self,
        id: MessageId,
        read_at: Timestamp,
    ) -> Result<Option<ReadOutcome>, RepositoryError> {
        // 只有未读的行会被更新，RETURNING 有结果即为首次已读
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            UPDATE messages
            SET read_at = $2
            WHERE id = $1 AND read_at IS NULL
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(Uuid::from(id))
        .bind(read_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if let Some(record) = record {
            return Ok(Some(ReadOutcome {
                message: Message::try_from(record)?,
                newly_read: true,
            }));
        }

        Ok(self.find_by_id(id).await?.map(|message| ReadOutcome {
            message,
            newly_read: false,
        }))
    }

    async fn list_between(&self, a: UserId, b: UserId) -> Result<Vec<Message>, RepositoryError> {
        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE (sender_id = $1 AND receiver_id = $2)
               OR (sender_id = $2 AND receiver_id = $1)
            ORDER BY created_at ASC
            "#
        ))
        .bind(Uuid::from(a))
        .bind(Uuid::from(b))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Message::try_from).collect()
    }

    async fn list_conversations_for(
        &self,
        user: UserId,
    ) -> Result<Vec<ConversationSummary>, RepositoryError> {
        let records = sqlx::query_as::<_, ConversationRecord>(
            r#"
            WITH scoped AS (
                SELECT CASE WHEN sender_id = $1 THEN receiver_id ELSE sender_id END AS partner_id,
                       id, sender_id, receiver_id, content, created_at, read_at
                FROM messages
                WHERE sender_id = $1 OR receiver_id = $1
            ),
            latest AS (
                SELECT DISTINCT ON (partner_id) *
                FROM scoped
                ORDER BY partner_id, created_at DESC
            )
            SELECT latest.*,
                   (SELECT COUNT(*)
                    FROM messages unread
                    WHERE unread.sender_id = latest.partner_id
                      AND unread.receiver_id = $1
                      AND unread.read_at IS NULL) AS unread_count
            FROM latest
            ORDER BY latest.created_at DESC
            "#,
        )
        .bind(Uuid::from(user))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records
            .into_iter()
            .map(ConversationSummary::try_from)
            .collect()
    }
}

#[derive(Clone)]
pub struct PgStorage {
    pub pool: PgPool,
    pub user_repository: Arc<PgUserRepository>,
    pub message_repository: Arc<PgMessageRepository>,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            user_repository: Arc::new(PgUserRepository::new(pool.clone())),
            message_repository: Arc::new(PgMessageRepository::new(pool.clone())),
            pool,
        }
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
