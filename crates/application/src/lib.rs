//! 应用层实现。
//!
//! 围绕领域模型的实时服务：在线状态、输入状态、会话房间、私信投递流水线，
//! 以及对外部适配器（身份校验、通知 broker、存储）的抽象。

pub mod clock;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod events;
pub mod gateway;
pub mod identity;
pub mod notifications;
pub mod presence;
pub mod repository;
pub mod rooms;
pub mod typing;

pub use clock::{Clock, SystemClock};
pub use connection::{ConnectionHandle, Outbound};
pub use delivery::{DeliveryDependencies, DeliveryPipeline};
pub use error::ApplicationError;
pub use events::{ClientEvent, ClientFrame, ServerEvent};
pub use gateway::{ChatGateway, ChatGatewayDependencies, Session};
pub use identity::{AuthError, IdentityVerifier};
pub use notifications::{
    BrokerError, BrokerNotification, Delivery, DeliveryOutcome, NotificationBroker,
    NotificationEnvelope, NotificationStream,
};
pub use presence::{OnlineSession, PresenceRegistry};
pub use repository::{MessageRepository, ReadOutcome, UserRepository};
pub use rooms::{is_conversation_room, personal_room, room_keys_for, ConversationRooms};
pub use typing::{TypingTracker, DEFAULT_TYPING_TIMEOUT};
