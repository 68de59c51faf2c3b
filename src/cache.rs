//! 缓存一致性层
//!
//! 源库之上的通用读穿透缓存，三种可选策略：
//!
//! - **穿透 + 空值缓存** — 未命中回源；源库无此键时缓存短 TTL 的
//!   空值标记，吸收对不存在键的重复查询（缓存穿透防护）
//! - **互斥重建** — 未命中时竞争重建锁，同一热键并发重建收敛为
//!   单次回源；未抢到锁的读者按固定间隔重试，次数有界
//!   （缓存击穿防护，代价是阻塞读者）
//! - **逻辑过期重建** — 载荷内嵌逻辑过期时间戳；过期读立即返回
//!   旧值，同时由重建锁保证只触发一次异步重建（读路径零延迟，
//!   旧值有界）
//!
//! 所有策略共享同一序列化契约 [`CachedValue`]：只有成功写入的值
//! 才会被当作缓存命中返回。

use crate::lock::StoreLock;
use crate::store::{SharedStore, StoreError};
use crate::utils::now_millis;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// 缓存错误
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("envelope serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// 回源加载失败
    #[error("loader error: {0}")]
    Loader(#[source] anyhow::Error),

    /// 互斥重建重试次数用尽
    #[error("cache rebuild timed out after {0} attempts")]
    RebuildTimeout(u32),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// 缓存信封 - 每种实体类型一个固定模式
///
/// `payload: None` 是空值标记（缓存穿透防护）；`logical_expire_at`
/// 仅逻辑过期策略使用，Unix 毫秒。
#[derive(Debug, Serialize, Deserialize)]
pub struct CachedValue<T> {
    pub payload: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logical_expire_at: Option<i64>,
}

impl<T> CachedValue<T> {
    fn fresh(payload: Option<T>) -> Self {
        Self { payload, logical_expire_at: None }
    }

    fn with_logical_expiry(payload: T, ttl: Duration) -> Self {
        Self {
            payload: Some(payload),
            logical_expire_at: Some(now_millis() + ttl.as_millis() as i64),
        }
    }

    fn is_logically_expired(&self) -> bool {
        self.logical_expire_at.is_some_and(|at| at <= now_millis())
    }
}

/// 缓存策略参数
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// 物理 TTL
    pub ttl: Duration,
    /// 空值标记 TTL
    pub null_ttl: Duration,
    /// 重建锁租约
    pub lock_ttl: Duration,
    /// 互斥重建读者的固定重试间隔
    pub retry_interval: Duration,
    /// 互斥重建读者的最大重试次数
    pub max_rebuild_retries: u32,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(1800),
            null_ttl: Duration::from_secs(120),
            lock_ttl: Duration::from_secs(10),
            retry_interval: Duration::from_millis(50),
            max_rebuild_retries: 100,
        }
    }
}

/// 读穿透缓存客户端
#[derive(Clone)]
pub struct CacheClient {
    store: Arc<dyn SharedStore>,
    options: CacheOptions,
}

impl CacheClient {
    pub fn new(store: Arc<dyn SharedStore>, options: CacheOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    // ========== 写路径 ==========

    /// 写入带物理 TTL 的缓存值
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> CacheResult<()> {
        let json = serde_json::to_string(&CachedValue::fresh(Some(value)))?;
        self.store.set(key, &json, Some(self.options.ttl)).await?;
        Ok(())
    }

    /// 写入带逻辑过期时间的缓存值（无物理 TTL，热键常驻）
    pub async fn set_with_logical_expire<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        logical_ttl: Duration,
    ) -> CacheResult<()> {
        let json = serde_json::to_string(&CachedValue::with_logical_expiry(value, logical_ttl))?;
        self.store.set(key, &json, None).await?;
        Ok(())
    }

    /// 写穿透失效：源库更新后删除缓存键
    pub async fn invalidate(&self, key: &str) -> CacheResult<()> {
        self.store.delete(key).await?;
        Ok(())
    }

    async fn store_negative_marker(&self, key: &str) -> CacheResult<()> {
        let json = serde_json::to_string(&CachedValue::<()>::fresh(None))?;
        self.store.set(key, &json, Some(self.options.null_ttl)).await?;
        Ok(())
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<CachedValue<T>>> {
        match self.store.get(key).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    // ========== 读路径 ==========

    /// 穿透 + 空值缓存
    ///
    /// 未命中时回源；源库无此键时缓存空值标记，`null_ttl` 窗口内的
    /// 重复查询不再触达源库。
    pub async fn get_with_passthrough<T, F, Fut>(&self, key: &str, loader: F) -> CacheResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        if let Some(envelope) = self.lookup::<T>(key).await? {
            return Ok(envelope.payload);
        }

        let loaded = loader().await.map_err(CacheError::Loader)?;
        match &loaded {
            Some(value) => self.set(key, value).await?,
            None => self.store_negative_marker(key).await?,
        }
        Ok(loaded)
    }

    /// 互斥重建
    ///
    /// 未命中时竞争重建锁；抢到锁的读者二次确认后回源并回填，
    /// 其余读者按固定间隔重读，最多 `max_rebuild_retries` 次。
    pub async fn get_with_mutex<T, F, Fut>(
        &self,
        key: &str,
        lock_name: &str,
        loader: F,
    ) -> CacheResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        for _ in 0..=self.options.max_rebuild_retries {
            if let Some(envelope) = self.lookup::<T>(key).await? {
                return Ok(envelope.payload);
            }

            let lock = StoreLock::new(
                self.store.clone(),
                lock_name,
                "cache-rebuild",
                self.options.lock_ttl,
            );
            if lock.try_acquire().await? {
                // DoubleCheck：拿到锁时缓存可能已被重建
                let result = self.rebuild(key, &loader).await;
                lock.release().await?;
                return result;
            }

            tokio::time::sleep(self.options.retry_interval).await;
        }
        Err(CacheError::RebuildTimeout(self.options.max_rebuild_retries))
    }

    async fn rebuild<T, F, Fut>(&self, key: &str, loader: &F) -> CacheResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        if let Some(envelope) = self.lookup::<T>(key).await? {
            return Ok(envelope.payload);
        }
        let loaded = loader().await.map_err(CacheError::Loader)?;
        match &loaded {
            Some(value) => self.set(key, value).await?,
            None => self.store_negative_marker(key).await?,
        }
        Ok(loaded)
    }

    /// 逻辑过期重建
    ///
    /// 键缺失返回 `None`（此策略要求热键预先播种）。逻辑过期的读
    /// 立即返回旧值；抢到重建锁的读触发一次异步重建，重建完成前
    /// 其余读者继续拿旧值，读路径从不阻塞。
    pub async fn get_with_logical_expire<T, F, Fut>(
        &self,
        key: &str,
        lock_name: &str,
        logical_ttl: Duration,
        loader: F,
    ) -> CacheResult<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send,
    {
        let Some(envelope) = self.lookup::<T>(key).await? else {
            return Ok(None);
        };
        if !envelope.is_logically_expired() {
            return Ok(envelope.payload);
        }

        let lock = StoreLock::new(
            self.store.clone(),
            lock_name,
            "cache-rebuild",
            self.options.lock_ttl,
        );
        if lock.try_acquire().await? {
            // DoubleCheck：抢到锁时可能已被其他读者重建完毕
            match self.lookup::<T>(key).await? {
                Some(fresh) if !fresh.is_logically_expired() => {
                    lock.release().await?;
                    return Ok(fresh.payload);
                }
                _ => {}
            }

            let client = self.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                match loader().await {
                    Ok(Some(value)) => {
                        if let Err(e) = client.set_with_logical_expire(&key, &value, logical_ttl).await {
                            tracing::error!(key = %key, error = %e, "Cache rebuild store failed");
                        }
                    }
                    Ok(None) => {
                        tracing::warn!(key = %key, "Cache rebuild loader returned nothing, keeping stale value");
                    }
                    Err(e) => {
                        tracing::error!(key = %key, error = %e, "Cache rebuild loader failed");
                    }
                }
                if let Err(e) = lock.release().await {
                    tracing::error!(key = %key, error = %e, "Cache rebuild lock release failed");
                }
            });
        }

        // 无论是否触发重建，本次读都返回旧值
        Ok(envelope.payload)
    }
}
