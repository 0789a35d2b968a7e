//! 领域模型错误定义
//!
//! 领域层只关心输入是否合法、操作者是否有权操作实体；存储失败由 `RepositoryError` 表达。

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// 参数不合法
    #[error("{field}: {reason}")]
    InvalidArgument { field: String, reason: String },

    /// 无法识别的星座名称
    #[error("unknown zodiac sign: {value}")]
    UnknownZodiacSign { value: String },

    /// 只有接收者可以把消息标记为已读
    #[error("You can only mark your own messages as read")]
    NotMessageReceiver,
}

impl DomainError {
    /// 创建参数错误
    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// 创建未知星座错误
    pub fn unknown_zodiac_sign(value: impl Into<String>) -> Self {
        Self::UnknownZodiacSign {
            value: value.into(),
        }
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;

/// 仓储（外部存储）错误
///
/// "记录不存在" 用 `Ok(None)` 表达，不属于错误。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// 按主键更新时目标记录已不存在
    #[error("record not found")]
    NotFound,

    /// 唯一约束冲突
    #[error("record already exists")]
    Conflict,

    /// 存储不可用或返回了无法解析的数据
    #[error("storage error: {message}")]
    Storage { message: String },
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}
