//! 统一错误定义
//!
//! 覆盖存储、投递、配置与状态校验几类，引擎内部与各存储实现统一转换为 `OutboxError`。
//!
use crate::event::PublisherId;
use thiserror::Error;

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum OutboxError {
    // --- 存储 ---
    #[error("event store error: {reason}")]
    Store { reason: String },
    #[error("database error: {reason}")]
    Database { reason: String },

    // --- 投递 ---
    #[error("publish failed: publisher={publisher}, reason={reason}")]
    Publish {
        publisher: PublisherId,
        reason: String,
    },

    // --- 配置与状态 ---
    #[error("invalid config: {reason}")]
    Config { reason: String },
    #[error("invalid state: {reason}")]
    InvalidState { reason: String },
    #[error("invalid value: {reason}")]
    InvalidValue { reason: String },
}

impl OutboxError {
    pub fn store(reason: impl Into<String>) -> Self {
        Self::Store {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }
}

pub type OutboxResult<T> = Result<T, OutboxError>;

// 允许在基础设施层直接使用 `?` 将 sqlx 错误转换为 OutboxError
#[cfg(feature = "infra-sqlx")]
impl From<sqlx::Error> for OutboxError {
    fn from(err: sqlx::Error) -> Self {
        OutboxError::Database {
            reason: err.to_string(),
        }
    }
}

// 数据库整数列与 u64 之间的转换
#[cfg(feature = "infra-sqlx")]
impl From<std::num::TryFromIntError> for OutboxError {
    fn from(err: std::num::TryFromIntError) -> Self {
        OutboxError::InvalidValue {
            reason: err.to_string(),
        }
    }
}
