//! 错误类型
//!
//! 加锁只有一种失败：调用方放弃等待（取消或超时）。错误原样返回，不做包装。

use thiserror::Error;

/// 加锁错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LockError {
    /// 上下文被主动取消
    #[error("加锁已取消")]
    Cancelled,

    /// 上下文截止时间已过
    #[error("加锁等待超时")]
    DeadlineExceeded,
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, LockError>;

impl LockError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Cancelled => "LOCK_CANCELLED",
            Self::DeadlineExceeded => "LOCK_DEADLINE_EXCEEDED",
        }
    }

    /// 是否为可重试错误
    ///
    /// 超时意味着资源仍被占用，稍后重试可能成功；主动取消不应重试。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }

    /// 用于指标标签的结果名称
    pub(crate) fn outcome(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
        }
    }
}
