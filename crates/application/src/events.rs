//! 实时通道上的事件格式
//!
//! 服务端事件序列化为 `{"event": "<name>", "data": {...}}`；
//! 客户端帧为 `{"id"?: n, "event": "<name>", "data": {...}}`，带 `id` 时以 `ack` 事件回执。

use domain::{
    CompatibilityResult, ConnectionId, ConversationSummary, Message, MessageId, Timestamp,
    UserId, UserProfile,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApplicationError;
use crate::notifications::BrokerNotification;

/// 服务端推送的全部事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    UserOnline(PresenceNotice),
    UserOffline(PresenceNotice),
    OnlineUsers(Vec<OnlineEntry>),
    OnlineUsersList(OnlineUsersList),
    MessageSent(MessageEnvelope),
    NewMessage(MessageEnvelope),
    MessageDelivered(MessageEnvelope),
    MessageError(MessageErrorNotice),
    MessageRead(ReadReceipt),
    UserTyping(TypingNotice),
    BrokerNotification(BrokerNotification),
    NewMessageNotification(ForwardedNotification),
    MessageReadNotification(ForwardedNotification),
    BrowserNotification(BrowserNotification),
    ConversationJoined(ConversationJoined),
    ConversationHistory(ConversationHistory),
    ConversationLeft(ConversationLeft),
    Ack { id: u64, response: Value },
}

impl ServerEvent {
    /// 事件名（与序列化后的 `event` 字段一致）。
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::UserOnline(_) => "user_online",
            ServerEvent::UserOffline(_) => "user_offline",
            ServerEvent::OnlineUsers(_) => "online_users",
            ServerEvent::OnlineUsersList(_) => "online_users_list",
            ServerEvent::MessageSent(_) => "message_sent",
            ServerEvent::NewMessage(_) => "new_message",
            ServerEvent::MessageDelivered(_) => "message_delivered",
            ServerEvent::MessageError(_) => "message_error",
            ServerEvent::MessageRead(_) => "message_read",
            ServerEvent::UserTyping(_) => "user_typing",
            ServerEvent::BrokerNotification(_) => "broker_notification",
            ServerEvent::NewMessageNotification(_) => "new_message_notification",
            ServerEvent::MessageReadNotification(_) => "message_read_notification",
            ServerEvent::BrowserNotification(_) => "browser_notification",
            ServerEvent::ConversationJoined(_) => "conversation_joined",
            ServerEvent::ConversationHistory(_) => "conversation_history",
            ServerEvent::ConversationLeft(_) => "conversation_left",
            ServerEvent::Ack { .. } => "ack",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceNotice {
    pub user_id: UserId,
    pub username: String,
    pub zodiac_sign: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub horoscope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<UserProfile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineEntry {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
}

/// 对外展示的精简资料
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicProfile {
    pub id: UserId,
    pub username: String,
    pub name: Option<String>,
    pub zodiac_sign: Option<String>,
    pub horoscope: Option<String>,
}

impl From<&UserProfile> for PublicProfile {
    fn from(profile: &UserProfile) -> Self {
        Self {
            id: profile.id,
            username: profile.username.clone(),
            name: profile.name.clone(),
            zodiac_sign: profile.zodiac_sign.clone(),
            horoscope: profile.horoscope.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    #[serde(flatten)]
    pub profile: PublicProfile,
    pub connection_id: ConnectionId,
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineUsersList {
    pub users: Vec<OnlineUser>,
    pub count: usize,
    pub timestamp: Timestamp,
}

/// 附带匹配度与星座信息的消息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    #[serde(flatten)]
    pub message: Message,
    pub compatibility: CompatibilityResult,
    pub zodiac_insight: String,
    pub daily_horoscope: Option<String>,
    pub sender_zodiac: Option<String>,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageErrorNotice {
    pub error: String,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub message_id: MessageId,
    pub read_by: UserId,
    pub read_by_username: String,
    pub read_by_zodiac: Option<String>,
    pub read_at: Timestamp,
    pub conversation_id: Option<String>,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub user_id: UserId,
    pub username: String,
    pub zodiac_sign: Option<String>,
    pub typing: bool,
    pub conversation_id: Option<String>,
    pub timestamp: Timestamp,
}

/// 经 broker 转发到客户端的通知
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardedNotification {
    #[serde(flatten)]
    pub notification: BrokerNotification,
    pub via: String,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserNotification {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<BrowserNotificationData>,
}

impl BrowserNotification {
    pub fn for_message(
        sender_username: &str,
        body: &str,
        message_id: MessageId,
        sender_id: Option<UserId>,
    ) -> Self {
        Self {
            title: format!("New message from {sender_username}"),
            body: body.to_owned(),
            icon: "/favicon.ico".to_owned(),
            tag: format!("message_{message_id}"),
            data: sender_id.map(|sender_id| BrowserNotificationData {
                message_id,
                sender_id,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserNotificationData {
    pub message_id: MessageId,
    pub sender_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationJoined {
    pub other_user: PublicProfile,
    pub room: String,
    pub compatibility: CompatibilityResult,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationHistory {
    pub messages: Vec<Message>,
    pub compatibility: CompatibilityResult,
    pub other_user_zodiac: Option<String>,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationLeft {
    pub other_user_id: UserId,
    pub room: String,
    pub timestamp: Timestamp,
}

/// `get_conversations` 返回的一项
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEntry {
    #[serde(flatten)]
    pub summary: ConversationSummary,
    pub partner: Option<PublicProfile>,
}

// ---------------------------------------------------------------------------
// 客户端 -> 服务端
// ---------------------------------------------------------------------------

/// 原始客户端帧
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    #[serde(default)]
    pub id: Option<u64>,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub receiver_id: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtherUserPayload {
    pub other_user_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub receiver_id: Option<String>,
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkAsReadPayload {
    pub message_id: Option<String>,
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPayload {
    pub user_id: Option<String>,
}

/// 解析后的客户端事件
#[derive(Debug, Clone)]
pub enum ClientEvent {
    SendMessage(SendMessagePayload),
    JoinConversation(OtherUserPayload),
    LeaveConversation(OtherUserPayload),
    TypingStart(TypingPayload),
    TypingStop(TypingPayload),
    MarkAsRead(MarkAsReadPayload),
    GetZodiacCompatibility(OtherUserPayload),
    GetOnlineUsers,
    GetUserProfile(UserPayload),
    GetConversations,
    Ping,
}

impl ClientEvent {
    pub fn parse(event: &str, data: Value) -> Result<Self, ApplicationError> {
        fn payload<T: serde::de::DeserializeOwned + Default>(
            data: Value,
        ) -> Result<T, ApplicationError> {
            if data.is_null() {
                return Ok(T::default());
            }
            serde_json::from_value(data)
                .map_err(|err| ApplicationError::validation(format!("Invalid payload: {err}")))
        }

        Ok(match event {
            "send_message" => ClientEvent::SendMessage(payload(data)?),
            "join_conversation" => ClientEvent::JoinConversation(payload(data)?),
            "leave_conversation" => ClientEvent::LeaveConversation(payload(data)?),
            "typing_start" => ClientEvent::TypingStart(payload(data)?),
            "typing_stop" => ClientEvent::TypingStop(payload(data)?),
            "mark_as_read" => ClientEvent::MarkAsRead(payload(data)?),
            "get_zodiac_compatibility" => ClientEvent::GetZodiacCompatibility(payload(data)?),
            "get_online_users" => ClientEvent::GetOnlineUsers,
            "get_user_profile" => ClientEvent::GetUserProfile(payload(data)?),
            "get_conversations" => ClientEvent::GetConversations,
            "ping" => ClientEvent::Ping,
            other => {
                return Err(ApplicationError::validation(format!(
                    "Unknown event: {other}"
                )))
            }
        })
    }
}

/// 取出必填字段；缺失或空白时返回给定的提示。
pub fn required<'a>(value: &'a Option<String>, message: &str) -> Result<&'a str, ApplicationError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ApplicationError::validation(message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_server_event_wire_shape() {
        let event = ServerEvent::Ack {
            id: 7,
            response: json!({"success": true}),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "ack");
        assert_eq!(value["data"]["id"], 7);
        assert_eq!(event.name(), "ack");
    }

    #[test]
    fn test_parse_client_event() {
        let event = ClientEvent::parse(
            "send_message",
            json!({"receiverId": "abc", "content": "hi"}),
        )
        .unwrap();
        match event {
            ClientEvent::SendMessage(p) => {
                assert_eq!(p.receiver_id.as_deref(), Some("abc"));
                assert_eq!(p.content.as_deref(), Some("hi"));
            }
            other => panic!("unexpected: {other:?}"),
        }

        assert!(matches!(
            ClientEvent::parse("ping", Value::Null).unwrap(),
            ClientEvent::Ping
        ));
        assert!(matches!(
            ClientEvent::parse("typing_start", Value::Null).unwrap(),
            ClientEvent::TypingStart(TypingPayload { receiver_id: None, .. })
        ));
        let err = ClientEvent::parse("dance", Value::Null).unwrap_err();
        assert_eq!(err.to_string(), "Unknown event: dance");
    }

    #[test]
    fn test_required_field() {
        assert_eq!(required(&Some(" x ".into()), "missing").unwrap(), "x");
        assert_eq!(
            required(&Some("  ".into()), "Receiver ID is required")
                .unwrap_err()
                .to_string(),
            "Receiver ID is required"
        );
        assert!(required(&None, "missing").is_err());
    }
}
