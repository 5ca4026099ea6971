//! 内容存储按键互斥锁
//!
//! 为内容寻址存储提供进程内的按键独占锁：同一 key 上的写入、下载等操作串行执行，
//! 不同 key 之间互不阻塞。锁表按引用计数自动清理，不会因为历史 key 无限增长。

pub mod config;
pub mod context;
pub mod error;
pub mod lock;
pub mod observability;

pub use config::LockConfig;
pub use context::AcquireContext;
pub use error::{LockError, Result};
pub use lock::{KeyedLock, KeyedLockGuard};
