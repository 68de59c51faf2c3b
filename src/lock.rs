//! 分布式互斥锁
//!
//! 基于共享存储的命名锁：`SET lock:{name} {token} NX EX {ttl}` 获取，
//! 比较删除释放。租约 TTL 限定崩溃持有者的影响范围。
//!
//! 持有者令牌为 uuid 前缀 + 持有者标签；释放时原子地比较令牌后删除，
//! 保证租约过期后被他人重新获取的锁不会被过期持有者误删。
//!
//! `try_acquire` 立即返回，从不阻塞等待。

use crate::store::{SharedStore, StoreResult, keys};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// 共享存储上的命名锁
pub struct StoreLock {
    store: Arc<dyn SharedStore>,
    key: String,
    token: String,
    ttl: Duration,
}

impl StoreLock {
    /// 创建锁句柄
    ///
    /// `name` 不含 `lock:` 前缀；`holder` 标识持有者（如消费者名），
    /// 只用于令牌可读性。
    pub fn new(store: Arc<dyn SharedStore>, name: &str, holder: &str, ttl: Duration) -> Self {
        Self {
            store,
            key: format!("{}{}", keys::LOCK_PREFIX, name),
            token: format!("{}-{}", Uuid::new_v4().simple(), holder),
            ttl,
        }
    }

    /// 非阻塞获取；已被持有时立即返回 false
    pub async fn try_acquire(&self) -> StoreResult<bool> {
        self.store.set_nx_ex(&self.key, &self.token, self.ttl).await
    }

    /// 释放锁
    ///
    /// 仅当键仍持有本句柄的令牌时删除；租约已过期且被他人重新获取
    /// 时为空操作。
    pub async fn release(&self) -> StoreResult<()> {
        let deleted = self.store.compare_and_delete(&self.key, &self.token).await?;
        if !deleted {
            tracing::warn!(key = %self.key, "Lock already expired or held by another holder");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn store() -> Arc<dyn SharedStore> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn test_second_holder_is_rejected() {
        let store = store();
        let a = StoreLock::new(store.clone(), "order:1", "c1", Duration::from_secs(30));
        let b = StoreLock::new(store.clone(), "order:1", "c2", Duration::from_secs(30));

        assert!(a.try_acquire().await.unwrap());
        assert!(!b.try_acquire().await.unwrap());

        a.release().await.unwrap();
        assert!(b.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_distinct_resources_do_not_contend() {
        let store = store();
        let a = StoreLock::new(store.clone(), "order:1", "c1", Duration::from_secs(30));
        let b = StoreLock::new(store.clone(), "order:2", "c1", Duration::from_secs(30));

        assert!(a.try_acquire().await.unwrap());
        assert!(b.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_holder_cannot_release_new_holder() {
        let store = store();
        let stale = StoreLock::new(store.clone(), "order:1", "c1", Duration::from_millis(20));
        assert!(stale.try_acquire().await.unwrap());

        // 租约过期，新持有者接管
        tokio::time::sleep(Duration::from_millis(40)).await;
        let fresh = StoreLock::new(store.clone(), "order:1", "c2", Duration::from_secs(30));
        assert!(fresh.try_acquire().await.unwrap());

        // 过期持有者的释放必须是空操作
        stale.release().await.unwrap();
        let another = StoreLock::new(store.clone(), "order:1", "c3", Duration::from_secs(30));
        assert!(!another.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let store = store();
        let lock = StoreLock::new(store.clone(), "order:1", "c1", Duration::from_secs(30));
        assert!(lock.try_acquire().await.unwrap());
        lock.release().await.unwrap();
        lock.release().await.unwrap();
    }
}
