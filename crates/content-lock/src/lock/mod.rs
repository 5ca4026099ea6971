//! 按键互斥锁模块
//!
//! 提供进程内、按字符串 key 区分的独占锁实现。
//!
//! ## 设计理念
//!
//! - **按键隔离**: 不同 key 之间互不阻塞，锁表互斥量只在 O(1) 的登记操作期间持有
//! - **可取消等待**: 等待可被 `AcquireContext` 的取消信号或截止时间立即打断
//! - **引用计数清理**: 没有持有者和等待者的 key 会立即从锁表中移除
//! - **RAII 模式**: 通过 `KeyedLockGuard` 确保锁在所有退出路径上被释放
//!
//! ## 使用示例
//!
//! ```ignore
//! let locks = KeyedLock::new();
//! let ctx = AcquireContext::with_timeout(Duration::from_secs(5));
//!
//! // 获取锁
//! let guard = locks.acquire(&ctx, "sha256:abcd").await?;
//!
//! // 执行受保护的写入
//! write_blob().await?;
//!
//! // 显式释放锁（drop 时也会自动释放）
//! guard.release();
//! ```

mod keyed_lock;

pub use keyed_lock::{KeyedLock, KeyedLockGuard};
