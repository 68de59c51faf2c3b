//! 秒杀预订服务
//!
//! 入站路径：校验 → 缓存读券 → 窗口检查 → 铸造订单 ID →
//! 原子预订评估。评估通过即把预订记录写入持久流并立即返回
//! 订单 ID，落库由后台消费者异步完成。
//!
//! 热路径上没有分布式锁：同一优惠券的并发评估由共享存储的
//! 原子脚本线性化。

use crate::cache::CacheClient;
use crate::core::error::ReserveError;
use crate::db::repository::voucher;
use crate::db::models::Voucher;
use crate::idgen::IdWorker;
use crate::store::{ReserveCode, SharedStore, StoreError, keys};
use crate::utils::now_millis;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

use super::types::{RequestContext, Reservation};

/// 发布秒杀券的入参
#[derive(Debug, Clone)]
pub struct PublishVoucher {
    pub shop_id: i64,
    pub title: String,
    pub stock: i64,
    pub active_from: i64,
    pub active_until: i64,
}

/// 秒杀服务
#[derive(Clone)]
pub struct SeckillService {
    store: Arc<dyn SharedStore>,
    cache: CacheClient,
    id_worker: IdWorker,
    pool: SqlitePool,
    stream: String,
}

impl SeckillService {
    pub fn new(
        store: Arc<dyn SharedStore>,
        cache: CacheClient,
        id_worker: IdWorker,
        pool: SqlitePool,
        stream: String,
    ) -> Self {
        Self { store, cache, id_worker, pool, stream }
    }

    /// 预订一张优惠券
    ///
    /// 成功即返回订单 ID，调用方不等待落库。失败原因映射到固定的
    /// 用户可见消息集合，内部错误细节只进日志。
    pub async fn reserve(
        &self,
        ctx: RequestContext,
        voucher_id: i64,
    ) -> Result<Reservation, ReserveError> {
        if voucher_id <= 0 {
            return Err(ReserveError::Validation);
        }

        let voucher = self.load_voucher(voucher_id).await?;
        let Some(voucher) = voucher else {
            return Err(ReserveError::VoucherNotFound);
        };

        // 窗口检查在调用方完成；脚本只管库存与一人一单
        let now = now_millis();
        if now < voucher.active_from {
            return Err(ReserveError::NotStarted);
        }
        if now >= voucher.active_until {
            return Err(ReserveError::Ended);
        }

        let order_id = self.id_worker.next_id("order").await.map_err(|e| {
            tracing::error!(voucher_id, error = %e, "Order id mint failed");
            ReserveError::Unavailable
        })? as i64;

        let code = self
            .store
            .reserve_voucher(&self.stream, voucher_id, ctx.user_id, order_id)
            .await
            .map_err(|e| {
                match &e {
                    StoreError::StateMissing(key) => {
                        // fail closed：库存状态未知时拒绝预订，绝不回退到旧值
                        tracing::error!(voucher_id, key = %key, "Reservation refused: stock state missing");
                    }
                    _ => tracing::error!(voucher_id, error = %e, "Reservation evaluation failed"),
                }
                ReserveError::Unavailable
            })?;

        match code {
            ReserveCode::Ok => {
                tracing::info!(
                    voucher_id,
                    user_id = ctx.user_id,
                    order_id,
                    "Reservation granted"
                );
                Ok(Reservation { order_id })
            }
            ReserveCode::StockExhausted => {
                tracing::debug!(voucher_id, user_id = ctx.user_id, "Reservation refused: stock exhausted");
                Err(ReserveError::StockExhausted)
            }
            ReserveCode::DuplicateOrder => {
                tracing::debug!(voucher_id, user_id = ctx.user_id, "Reservation refused: duplicate order");
                Err(ReserveError::DuplicateOrder)
            }
            ReserveCode::VoucherInvalid => Err(ReserveError::Ended),
        }
    }

    /// 发布秒杀券：插入权威行并播种热路径库存计数
    ///
    /// 库存键带覆盖售卖窗口的 TTL。此后热路径库存只由预订脚本
    /// 递减，权威列只由落库 CAS 递减。
    pub async fn publish_voucher(&self, data: PublishVoucher) -> Result<Voucher, ReserveError> {
        let id = self.id_worker.next_id("voucher").await.map_err(|e| {
            tracing::error!(error = %e, "Voucher id mint failed");
            ReserveError::Unavailable
        })? as i64;

        let voucher = voucher::create(
            &self.pool,
            voucher::VoucherCreate {
                id,
                shop_id: data.shop_id,
                title: data.title,
                stock: data.stock,
                active_from: data.active_from,
                active_until: data.active_until,
            },
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Voucher insert failed");
            ReserveError::Unavailable
        })?;

        let ttl_millis = (voucher.active_until - now_millis()).max(1000) as u64;
        self.store
            .set(
                &keys::stock_key(voucher.id),
                &voucher.stock.to_string(),
                Some(Duration::from_millis(ttl_millis)),
            )
            .await
            .map_err(|e| {
                tracing::error!(voucher_id = voucher.id, error = %e, "Stock seed failed");
                ReserveError::Unavailable
            })?;

        tracing::info!(voucher_id = voucher.id, stock = voucher.stock, "Seckill voucher published");
        Ok(voucher)
    }

    async fn load_voucher(&self, voucher_id: i64) -> Result<Option<Voucher>, ReserveError> {
        let pool = self.pool.clone();
        self.cache
            .get_with_passthrough(&keys::voucher_cache_key(voucher_id), move || {
                let pool = pool.clone();
                async move {
                    voucher::find_by_id(&pool, voucher_id)
                        .await
                        .map_err(anyhow::Error::from)
                }
            })
            .await
            .map_err(|e| {
                tracing::error!(voucher_id, error = %e, "Voucher lookup failed");
                ReserveError::Unavailable
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheOptions;
    use crate::db::DbService;
    use crate::store::MemoryStore;

    const STREAM: &str = "stream.orders";

    async fn service() -> (SeckillService, Arc<MemoryStore>, SqlitePool) {
        let store = Arc::new(MemoryStore::new());
        let shared: Arc<dyn SharedStore> = store.clone();
        let db = DbService::open_in_memory().await.unwrap();
        let service = SeckillService::new(
            shared.clone(),
            CacheClient::new(shared.clone(), CacheOptions::default()),
            IdWorker::new(shared.clone()),
            db.pool.clone(),
            STREAM.into(),
        );
        store.ensure_group(STREAM, "g1").await.unwrap();
        (service, store, db.pool)
    }

    fn open_window() -> (i64, i64) {
        let now = now_millis();
        (now - 1_000, now + 3_600_000)
    }

    #[tokio::test]
    async fn test_validation_rejects_nonpositive_id() {
        let (service, _, _) = service().await;
        let err = service.reserve(RequestContext { user_id: 1 }, 0).await.unwrap_err();
        assert_eq!(err, ReserveError::Validation);
    }

    #[tokio::test]
    async fn test_unknown_voucher_is_not_found() {
        let (service, _, _) = service().await;
        let err = service.reserve(RequestContext { user_id: 1 }, 99).await.unwrap_err();
        assert_eq!(err, ReserveError::VoucherNotFound);
    }

    #[tokio::test]
    async fn test_window_is_enforced() {
        let (service, _, _) = service().await;
        let now = now_millis();

        let early = service
            .publish_voucher(PublishVoucher {
                shop_id: 1,
                title: "not yet".into(),
                stock: 5,
                active_from: now + 3_600_000,
                active_until: now + 7_200_000,
            })
            .await
            .unwrap();
        assert_eq!(
            service.reserve(RequestContext { user_id: 1 }, early.id).await.unwrap_err(),
            ReserveError::NotStarted
        );

        let late = service
            .publish_voucher(PublishVoucher {
                shop_id: 1,
                title: "over".into(),
                stock: 5,
                active_from: now - 7_200_000,
                active_until: now - 3_600_000,
            })
            .await
            .unwrap();
        assert_eq!(
            service.reserve(RequestContext { user_id: 1 }, late.id).await.unwrap_err(),
            ReserveError::Ended
        );
    }

    #[tokio::test]
    async fn test_reserve_grants_then_exhausts_then_dedups() {
        let (service, store, _) = service().await;
        let (from, until) = open_window();
        let voucher = service
            .publish_voucher(PublishVoucher {
                shop_id: 1,
                title: "flash".into(),
                stock: 1,
                active_from: from,
                active_until: until,
            })
            .await
            .unwrap();

        let granted = service.reserve(RequestContext { user_id: 7 }, voucher.id).await.unwrap();
        assert!(granted.order_id > 0);

        assert_eq!(
            service.reserve(RequestContext { user_id: 7 }, voucher.id).await.unwrap_err(),
            ReserveError::DuplicateOrder
        );
        assert_eq!(
            service.reserve(RequestContext { user_id: 8 }, voucher.id).await.unwrap_err(),
            ReserveError::StockExhausted
        );

        // 评估通过的预订已进入持久流
        assert_eq!(store.pending_count(STREAM, "g1").await.unwrap(), 0);
        let entry = store
            .read_group(STREAM, "g1", "c1", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(entry.is_some());
    }

    #[tokio::test]
    async fn test_missing_stock_state_fails_closed() {
        let (service, store, _) = service().await;
        let (from, until) = open_window();
        let voucher = service
            .publish_voucher(PublishVoucher {
                shop_id: 1,
                title: "flash".into(),
                stock: 5,
                active_from: from,
                active_until: until,
            })
            .await
            .unwrap();

        // 模拟库存键丢失（如 Redis 清空）
        store.delete(&keys::stock_key(voucher.id)).await.unwrap();

        assert_eq!(
            service.reserve(RequestContext { user_id: 1 }, voucher.id).await.unwrap_err(),
            ReserveError::Unavailable
        );
    }
}
