use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{MessageContent, MessageId, Timestamp, UserId};

/// 一对一私信
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: MessageContent,
    pub created_at: Timestamp,
    pub read_at: Option<Timestamp>,
}

impl Message {
    pub fn new(
        id: MessageId,
        sender_id: UserId,
        receiver_id: UserId,
        content: MessageContent,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            sender_id,
            receiver_id,
            content,
            created_at,
            read_at: None,
        }
    }

    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }

    /// 标记已读。只有接收者可以操作；已读的消息保持原来的时间。
    pub fn mark_read(&mut self, reader: UserId, at: Timestamp) -> Result<Timestamp, DomainError> {
        if reader != self.receiver_id {
            return Err(DomainError::NotMessageReceiver);
        }
        Ok(*self.read_at.get_or_insert(at))
    }

    pub fn involves(&self, user: UserId) -> bool {
        self.sender_id == user || self.receiver_id == user
    }

    /// 对话中的另一方。
    pub fn counterpart_of(&self, user: UserId) -> UserId {
        if self.sender_id == user {
            self.receiver_id
        } else {
            self.sender_id
        }
    }
}

/// 会话列表中的一项：与某个用户的最后一条消息。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub partner_id: UserId,
    pub last_message: Message,
    /// 对方发来、尚未读的消息数
    pub unread_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn message() -> Message {
        Message::new(
            MessageId::from(Uuid::new_v4()),
            UserId::from(Uuid::new_v4()),
            UserId::from(Uuid::new_v4()),
            MessageContent::new("hi").unwrap(),
            Utc::now(),
        )
    }

    #[test]
    fn test_only_receiver_can_mark_read() {
        let mut msg = message();
        let err = msg.mark_read(msg.sender_id, Utc::now()).unwrap_err();
        assert_eq!(err, DomainError::NotMessageReceiver);
        assert!(!msg.is_read());
    }

    #[test]
    fn test_read_at_never_moves() {
        let mut msg = message();
        let first = Utc::now();
        assert_eq!(msg.mark_read(msg.receiver_id, first).unwrap(), first);

        let later = first + Duration::seconds(30);
        let earlier = first - Duration::seconds(30);
        assert_eq!(msg.mark_read(msg.receiver_id, later).unwrap(), first);
        assert_eq!(msg.mark_read(msg.receiver_id, earlier).unwrap(), first);
        assert_eq!(msg.read_at, Some(first));
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let msg = message();
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("senderId").is_some());
        assert!(json.get("readAt").unwrap().is_null());
        assert_eq!(json["content"], "hi");
    }
}
