//! 加锁上下文
//!
//! 由调用方持有的取消信号与截止时间。锁本身从不创建上下文，只负责在等待时响应它。

use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::error::LockError;

/// 加锁上下文
///
/// 克隆后的上下文共享同一个取消信号；`child()` 派生的上下文会随父上下文一起取消，
/// 但取消子上下文不会影响父上下文。
#[derive(Debug, Clone)]
pub struct AcquireContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for AcquireContext {
    fn default() -> Self {
        Self::background()
    }
}

impl AcquireContext {
    /// 永不结束的上下文
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// 在 `timeout` 之后到期的上下文
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// 在 `deadline` 到期的上下文
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// 绑定外部取消信号（如请求级别的 CancellationToken）
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// 追加超时，保留更早的截止时间
    pub fn timeout(mut self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// 派生子上下文
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// 取消上下文，唤醒所有基于它的等待
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 上下文已结束时返回对应错误
    ///
    /// 取消优先于超时。
    pub fn err(&self) -> Option<LockError> {
        if self.token.is_cancelled() {
            return Some(LockError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(LockError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// 等待上下文结束，返回结束原因
    pub async fn done(&self) -> LockError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => LockError::Cancelled,
                    _ = sleep_until(deadline) => LockError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                LockError::Cancelled
            }
        }
    }
}
