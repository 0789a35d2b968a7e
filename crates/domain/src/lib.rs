//! 星座社交实时核心的领域模型
//!
//! 包含用户资料、私信、星座数据与匹配度计算，以及各层共享的错误类型。

pub mod compatibility;
pub mod errors;
pub mod message;
pub mod user;
pub mod value_objects;
pub mod zodiac;

// 重新导出常用类型
pub use compatibility::{
    CompatibilityEngine, CompatibilityResult, ElementPair, FixedPhrase, PhraseSource,
    RandomPhrases, ScoreBucket,
};
pub use errors::{DomainError, DomainResult, RepositoryError};
pub use message::{ConversationSummary, Message};
pub use user::UserProfile;
pub use value_objects::{ConnectionId, MessageContent, MessageId, Timestamp, UserId};
pub use zodiac::{Element, ZodiacSign};
