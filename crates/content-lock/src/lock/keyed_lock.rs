//! 按键互斥锁
//!
//! 锁表将 key 映射到一个单许可信号量和引用计数。引用计数统计正在等待或已经持有
//! 该 key 的调用方数量，归零时条目立即删除。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

use crate::config::LockConfig;
use crate::context::AcquireContext;
use crate::error::{LockError, Result};
use crate::observability;

/// 单个 key 的锁条目
struct LockEntry {
    /// 单许可信号量
    semaphore: Arc<Semaphore>,
    /// 等待者与持有者数量之和
    ref_count: usize,
    /// 是否有调用方已完成加锁且尚未释放
    ///
    /// 许可可能已交给尚未被轮询的等待者，信号量的可用许可数无法区分这种状态，
    /// 因此持有状态单独记录在锁表互斥量下。
    held: bool,
}

impl LockEntry {
    fn free() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            ref_count: 0,
            held: false,
        }
    }

    fn held() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(0)),
            ref_count: 1,
            held: true,
        }
    }
}

/// 按键互斥锁
///
/// 线程安全，克隆后共享同一张锁表，可在多个任务间传递。
/// 不可重入：持有者再次对同一 key 加锁会一直等待，直到自身上下文结束。
/// 典型用法：
/// ```ignore
/// let locks = KeyedLock::new();
/// locks.lock(&ctx, &digest).await?;
/// let result = ingest(&digest).await;
/// locks.unlock(&digest);
/// ```
#[derive(Clone)]
pub struct KeyedLock {
    entries: Arc<Mutex<HashMap<String, LockEntry>>>,
    config: LockConfig,
}

impl Default for KeyedLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KeyedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLock")
            .field("entries", &self.len())
            .field("config", &self.config)
            .finish()
    }
}

impl KeyedLock {
    /// 使用默认配置创建锁表
    pub fn new() -> Self {
        Self::with_config(LockConfig::default())
    }

    /// 创建锁表
    pub fn with_config(config: LockConfig) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::with_capacity(config.initial_capacity))),
            config,
        }
    }

    /// 获取锁表配置
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// 获取 key 的独占锁
    ///
    /// 等待期间不持有锁表互斥量。上下文被取消或到期时立即返回对应错误，
    /// 返回前已归还本次调用的引用计数，调用方无需任何补偿操作。
    /// 返回的 future 在等待中被 drop 时同样会归还引用计数。
    #[instrument(skip(self, ctx))]
    pub async fn lock(&self, ctx: &AcquireContext, key: &str) -> Result<()> {
        if let Some(err) = ctx.err() {
            observability::record_lock_abandoned(err);
            debug!(key = %key, error = %err, "Lock context already done");
            return Err(err);
        }

        let started = Instant::now();
        let semaphore = self.retain(key);
        let pending = PendingRef {
            locks: self,
            key,
            armed: true,
        };

        let acquired = tokio::select! {
            biased;
            err = ctx.done() => Err(err),
            // 信号量从不关闭
            permit = semaphore.acquire() => permit.map_err(|_| LockError::Cancelled),
        };

        match acquired {
            Ok(permit) => {
                // 许可由 unlock 通过 add_permits 归还
                permit.forget();
                pending.disarm();
                self.mark_held(key);
                observability::record_lock_acquired(started.elapsed().as_secs_f64());
                debug!(key = %key, "Keyed lock acquired");
                Ok(())
            }
            Err(err) => {
                drop(pending);
                observability::record_lock_abandoned(err);
                debug!(
                    key = %key,
                    error = %err,
                    elapsed = ?started.elapsed(),
                    "Keyed lock acquisition abandoned"
                );
                Err(err)
            }
        }
    }

    /// 尝试获取锁，不等待
    ///
    /// key 已被持有时立即返回 false，不会留下新的锁表条目。
    pub fn try_lock(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(key) {
            return match entry.semaphore.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    entry.ref_count += 1;
                    entry.held = true;
                    debug!(key = %key, "Keyed lock acquired without waiting");
                    true
                }
                Err(_) => {
                    observability::record_lock_contended();
                    false
                }
            };
        }

        entries.insert(key.to_string(), LockEntry::held());
        observability::record_entry_created();
        debug!(key = %key, "Keyed lock acquired without waiting");
        true
    }

    /// 释放 key 的独占锁
    ///
    /// 唤醒至多一个等待者。key 不存在或当前没有持有者时为空操作并记录警告；
    /// 这只用于避免误用时崩溃，调用方不应依赖该行为。
    pub fn unlock(&self, key: &str) {
        let mut entries = self.entries.lock();

        let Some(entry) = entries.get_mut(key) else {
            warn!(key = %key, "Unlock called for a key with no lock entry");
            return;
        };

        if !entry.held {
            // 只有等待者没有持有者，归还许可会破坏互斥
            warn!(
                key = %key,
                ref_count = entry.ref_count,
                "Unlock called for a key that is not held"
            );
            return;
        }

        entry.held = false;
        entry.semaphore.add_permits(1);
        entry.ref_count -= 1;
        let remaining = entry.ref_count;
        if remaining == 0 {
            entries.remove(key);
            observability::record_entry_removed();
            trace!(key = %key, "Lock entry pruned");
        }

        observability::record_lock_released();
        debug!(key = %key, waiters = remaining, "Keyed lock released");
    }

    /// 获取锁并返回 RAII 守卫
    pub async fn acquire(&self, ctx: &AcquireContext, key: &str) -> Result<KeyedLockGuard> {
        self.lock(ctx, key).await?;
        Ok(KeyedLockGuard::new(self.clone(), key.to_string()))
    }

    /// 在 `timeout` 内获取锁
    pub async fn acquire_with_timeout(&self, key: &str, timeout: Duration) -> Result<KeyedLockGuard> {
        let ctx = AcquireContext::with_timeout(timeout);
        self.acquire(&ctx, key).await
    }

    /// 使用配置中的默认超时获取锁，未配置时无限等待
    pub async fn acquire_default(&self, key: &str) -> Result<KeyedLockGuard> {
        let ctx = match self.config.acquire_timeout() {
            Some(timeout) => AcquireContext::with_timeout(timeout),
            None => AcquireContext::background(),
        };
        self.acquire(&ctx, key).await
    }

    /// 尝试获取锁并返回守卫，不等待
    pub fn try_acquire(&self, key: &str) -> Option<KeyedLockGuard> {
        self.try_lock(key)
            .then(|| KeyedLockGuard::new(self.clone(), key.to_string()))
    }

    /// 当前锁表条目数
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// 锁表是否为空
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// key 是否有等待者或持有者
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// key 当前的等待者与持有者数量，无条目时返回 None
    pub fn ref_count(&self, key: &str) -> Option<usize> {
        self.entries.lock().get(key).map(|entry| entry.ref_count)
    }

    /// 登记一次引用，必要时创建条目
    fn retain(&self, key: &str) -> Arc<Semaphore> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert_with(|| {
            observability::record_entry_created();
            trace!(key = %key, "Lock entry created");
            LockEntry::free()
        });
        entry.ref_count += 1;
        Arc::clone(&entry.semaphore)
    }

    /// 记录等待者已拿到许可
    fn mark_held(&self, key: &str) {
        // 本次调用的引用尚未归还，条目必然存在
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.held = true;
        }
    }

    /// 归还一次未成功加锁的引用
    fn release_ref(&self, key: &str) {
        let mut entries = self.entries.lock();
        // 本次调用的引用尚未归还，条目必然存在
        if let Some(entry) = entries.get_mut(key) {
            entry.ref_count -= 1;
            if entry.ref_count == 0 {
                entries.remove(key);
                observability::record_entry_removed();
                trace!(key = %key, "Lock entry pruned");
            }
        }
    }
}

/// 等待中的引用
///
/// 在加锁成功前被 drop（取消、超时或整个 future 被丢弃）时归还引用计数。
struct PendingRef<'a> {
    locks: &'a KeyedLock,
    key: &'a str,
    armed: bool,
}

impl PendingRef<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingRef<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.locks.release_ref(self.key);
        }
    }
}

/// 锁守卫
///
/// 持有按键锁的 RAII 包装器。被 drop 时自动释放锁，也可以通过 `release()` 显式释放。
pub struct KeyedLockGuard {
    locks: KeyedLock,
    key: String,
    /// 标记锁是否已被释放，避免重复释放
    released: bool,
}

impl KeyedLockGuard {
    fn new(locks: KeyedLock, key: String) -> Self {
        Self {
            locks,
            key,
            released: false,
        }
    }

    /// 获取锁的 key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// 显式释放锁
    pub fn release(mut self) {
        self.released = true;
        self.locks.unlock(&self.key);
    }
}

impl std::fmt::Debug for KeyedLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLockGuard")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for KeyedLockGuard {
    fn drop(&mut self) {
        if !self.released {
            self.locks.unlock(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_unlock_prunes_entry() {
        let locks = KeyedLock::new();
        let ctx = AcquireContext::background();

        locks.lock(&ctx, "sha256:aaaa").await.expect("lock");
        assert!(locks.contains_key("sha256:aaaa"));
        assert_eq!(locks.ref_count("sha256:aaaa"), Some(1));

        locks.unlock("sha256:aaaa");
        assert!(!locks.contains_key("sha256:aaaa"));
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_empty_key_is_valid() {
        let locks = KeyedLock::new();
        let ctx = AcquireContext::background();

        locks.lock(&ctx, "").await.expect("lock empty key");
        assert!(locks.contains_key(""));
        assert!(!locks.try_lock(""));
        locks.unlock("");
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_context_leaves_no_entry() {
        let locks = KeyedLock::new();
        let ctx = AcquireContext::background();
        ctx.cancel();

        let err = locks.lock(&ctx, "blob").await.unwrap_err();
        assert_eq!(err, LockError::Cancelled);
        assert!(!locks.contains_key("blob"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_deadline_fails_even_when_free() {
        let locks = KeyedLock::new();
        let ctx = AcquireContext::with_timeout(Duration::from_millis(5));
        tokio::time::advance(Duration::from_millis(10)).await;

        let err = locks.lock(&ctx, "blob").await.unwrap_err();
        assert_eq!(err, LockError::DeadlineExceeded);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_try_lock() {
        let locks = KeyedLock::new();

        assert!(locks.try_lock("layer"));
        assert_eq!(locks.ref_count("layer"), Some(1));

        // 已被持有时失败，且不增加引用计数
        assert!(!locks.try_lock("layer"));
        assert_eq!(locks.ref_count("layer"), Some(1));

        locks.unlock("layer");
        assert!(locks.is_empty());
        assert!(locks.try_lock("layer"));
        locks.unlock("layer");
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_counts_toward_ref_count() {
        let locks = KeyedLock::new();
        let ctx = AcquireContext::background();
        locks.lock(&ctx, "manifest").await.expect("lock");

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let ctx = AcquireContext::with_timeout(Duration::from_millis(100));
                locks.lock(&ctx, "manifest").await
            })
        };

        while locks.ref_count("manifest") != Some(2) {
            tokio::task::yield_now().await;
        }

        let result = waiter.await.expect("join");
        assert_eq!(result, Err(LockError::DeadlineExceeded));
        assert_eq!(locks.ref_count("manifest"), Some(1));

        locks.unlock("manifest");
        assert!(locks.is_empty());
    }

    #[test]
    fn test_second_lock_on_held_key_stays_pending() {
        use tokio_test::{assert_pending, assert_ready_ok, task};

        let locks = KeyedLock::new();
        let ctx = AcquireContext::background();
        assert!(locks.try_lock("blob"));

        let mut second = task::spawn(locks.lock(&ctx, "blob"));
        assert_pending!(second.poll());
        assert_eq!(locks.ref_count("blob"), Some(2));

        locks.unlock("blob");
        assert!(second.is_woken());
        assert_ready_ok!(second.poll());
        drop(second);

        assert_eq!(locks.ref_count("blob"), Some(1));
        locks.unlock("blob");
        assert!(locks.is_empty());
    }

    #[test]
    fn test_dropping_pending_lock_returns_reference() {
        use tokio_test::{assert_pending, task};

        let locks = KeyedLock::new();
        let ctx = AcquireContext::background();
        assert!(locks.try_lock("blob"));

        let mut waiting = task::spawn(locks.lock(&ctx, "blob"));
        assert_pending!(waiting.poll());
        assert_eq!(locks.ref_count("blob"), Some(2));
        drop(waiting);

        assert_eq!(locks.ref_count("blob"), Some(1));
        locks.unlock("blob");
        assert!(locks.is_empty());
    }

    #[test]
    fn test_unlock_without_entry_is_noop() {
        let locks = KeyedLock::new();
        locks.unlock("missing");
        assert!(locks.is_empty());
    }

    #[test]
    fn test_double_unlock_during_handoff_is_noop() {
        use tokio_test::{assert_pending, assert_ready_ok, task};

        let locks = KeyedLock::new();
        let ctx = AcquireContext::background();
        assert!(locks.try_lock("k"));

        let mut waiter = task::spawn(locks.lock(&ctx, "k"));
        assert_pending!(waiter.poll());

        // 许可已交给等待者，但等待者尚未被轮询
        locks.unlock("k");
        locks.unlock("k");
        assert_eq!(locks.ref_count("k"), Some(1));

        assert_ready_ok!(waiter.poll());
        drop(waiter);

        // 等待者持有期间其他调用方无法获取
        assert!(!locks.try_lock("k"));
        assert_eq!(locks.ref_count("k"), Some(1));

        locks.unlock("k");
        assert!(locks.is_empty());
        assert!(locks.try_lock("k"));
        assert!(!locks.try_lock("k"));
        locks.unlock("k");
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_double_unlock_does_not_break_exclusion() {
        let locks = KeyedLock::new();
        assert!(locks.try_lock("index"));
        assert!(locks.try_lock("other"));

        locks.unlock("index");
        locks.unlock("index");
        assert_eq!(locks.len(), 1);
        assert!(!locks.contains_key("index"));

        // 重新加锁后互斥依然成立
        assert!(locks.try_lock("index"));
        assert!(!locks.try_lock("index"));
        locks.unlock("index");
        locks.unlock("other");
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_guard_release_and_drop() {
        let locks = KeyedLock::new();
        let ctx = AcquireContext::background();

        let guard = locks.acquire(&ctx, "blob").await.expect("acquire");
        assert_eq!(guard.key(), "blob");
        assert!(locks.try_acquire("blob").is_none());
        guard.release();
        assert!(locks.is_empty());

        {
            let _guard = locks.try_acquire("blob").expect("free after release");
            assert!(locks.contains_key("blob"));
        }
        assert!(locks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_default_uses_configured_timeout() {
        let locks = KeyedLock::with_config(
            LockConfig::default().with_acquire_timeout(Duration::from_millis(50)),
        );
        let _held = locks.try_acquire("blob").expect("free");

        let err = locks.acquire_default("blob").await.unwrap_err();
        assert_eq!(err, LockError::DeadlineExceeded);
        assert_eq!(locks.ref_count("blob"), Some(1));
    }

    #[test]
    fn test_debug_does_not_expose_entries() {
        let locks = KeyedLock::new();
        assert!(locks.try_lock("secret-key"));
        let rendered = format!("{:?}", locks);
        assert!(rendered.contains("entries: 1"));
        assert!(!rendered.contains("secret-key"));
        locks.unlock("secret-key");
    }
}
