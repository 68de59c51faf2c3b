//! 订单落库消费者
//!
//! 长期后台工作者，从预订流的消费者组中拉取记录并持久化为订单。
//! 投递语义是至少一次；落库幂等（先查 (user, voucher) 是否已存在），
//! 因此重复投递不会产生重复订单。
//!
//! # 协议
//!
//! - **正常循环**：阻塞读下一条新记录（有界等待），处理成功后才 ack
//! - **恢复循环**：任何处理失败后，从头重读本消费者的 pending 列表
//!   逐条重试，清空后回到正常循环。未 ack 的记录在同一消费者身份下
//!   无限重试，这是崩溃安全的来源
//!
//! 每条记录的状态机：CREATED → DELIVERED → {MATERIALIZED | REDELIVERED → DELIVERED}

use crate::db::repository::{RepoError, order, voucher};
use crate::db::models::VoucherOrder;
use crate::lock::StoreLock;
use crate::store::{SharedStore, StoreError, StreamEntry, keys};
use crate::utils::now_millis;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::types::ReservationRecord;

/// 消费者处理错误 — 全部可重试，经恢复循环重投
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Database(#[from] RepoError),

    /// 按用户锁被占用：不 ack，留在 pending 列表等待重投
    #[error("order lock contended for user {0}")]
    LockContended(i64),
}

/// 消费者配置
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub stream: String,
    pub group: String,
    /// 组内唯一的消费者名，pending 列表按它归属
    pub consumer: String,
    /// 阻塞读上限
    pub block: Duration,
    /// 恢复循环失败后的固定退避
    pub backoff: Duration,
    /// 按用户锁租约
    pub lock_ttl: Duration,
}

/// 订单落库工作者
pub struct OrderConsumer {
    store: Arc<dyn SharedStore>,
    pool: SqlitePool,
    config: ConsumerConfig,
}

impl OrderConsumer {
    pub fn new(store: Arc<dyn SharedStore>, pool: SqlitePool, config: ConsumerConfig) -> Self {
        Self { store, pool, config }
    }

    /// 运行消费者直至取消
    pub async fn run(self, cancel: CancellationToken) {
        let c = &self.config;
        tracing::info!(
            stream = %c.stream,
            group = %c.group,
            consumer = %c.consumer,
            "Order consumer started"
        );

        // 组不存在时创建；存储暂不可用则退避重试
        while let Err(e) = self.store.ensure_group(&c.stream, &c.group).await {
            tracing::error!(error = %e, "Consumer group bootstrap failed, retrying");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(c.backoff) => {}
            }
        }

        // 上次运行可能崩溃在 ack 之前，先清空本消费者的 pending
        self.recover_pending(&cancel).await;

        while !cancel.is_cancelled() {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = self.store.read_group(&c.stream, &c.group, &c.consumer, c.block) => read,
            };
            match read {
                Ok(None) => continue,
                Ok(Some(entry)) => {
                    if let Err(e) = self.process(&entry).await {
                        tracing::error!(entry_id = %entry.id, error = %e, "Order processing failed, entering recovery");
                        self.recover_pending(&cancel).await;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Stream read failed, entering recovery");
                    self.recover_pending(&cancel).await;
                }
            }
        }
        tracing::info!(consumer = %self.config.consumer, "Order consumer stopped");
    }

    /// 恢复循环：重放本消费者所有未 ack 的记录直至清空
    async fn recover_pending(&self, cancel: &CancellationToken) {
        let c = &self.config;
        while !cancel.is_cancelled() {
            match self.store.read_pending(&c.stream, &c.group, &c.consumer).await {
                Ok(None) => {
                    tracing::debug!(consumer = %c.consumer, "Pending list drained");
                    return;
                }
                Ok(Some(entry)) => {
                    if let Err(e) = self.process(&entry).await {
                        tracing::error!(entry_id = %entry.id, error = %e, "Pending record failed, backing off");
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(c.backoff) => {}
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Pending read failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(c.backoff) => {}
                    }
                }
            }
        }
    }

    /// 处理一条投递：解析 → 落库 → ack
    ///
    /// 只有落库成功（或被判定为幂等跳过/异常丢弃）才 ack；
    /// 返回 Err 的记录留在 pending 列表等待重投。
    async fn process(&self, entry: &StreamEntry) -> Result<(), ConsumerError> {
        let c = &self.config;
        let record = match ReservationRecord::from_entry(entry) {
            Ok(record) => record,
            Err(reason) => {
                // 损坏的记录重试也不会变好：记异常并丢弃，避免卡死恢复循环
                tracing::error!(entry_id = %entry.id, reason = %reason, "ANOMALY: malformed reservation record dropped");
                self.store.ack(&c.stream, &c.group, &entry.id).await?;
                return Ok(());
            }
        };

        self.materialize(&record).await?;
        self.store.ack(&c.stream, &c.group, &record.entry_id).await?;
        Ok(())
    }

    /// 落库一条预订记录
    ///
    /// 按用户锁是脚本级一人一单之外的第二道串行化；锁被占用视为
    /// 可重试失败而非丢弃。锁在事务返回后才释放（显式两步协议）。
    pub async fn materialize(&self, record: &ReservationRecord) -> Result<(), ConsumerError> {
        let lock = StoreLock::new(
            self.store.clone(),
            &keys::order_lock_name(record.user_id),
            &self.config.consumer,
            self.config.lock_ttl,
        );
        if !lock.try_acquire().await? {
            return Err(ConsumerError::LockContended(record.user_id));
        }

        let result = self.materialize_in_tx(record).await;
        lock.release().await?;
        result
    }

    async fn materialize_in_tx(&self, record: &ReservationRecord) -> Result<(), ConsumerError> {
        let mut tx = self.pool.begin().await.map_err(RepoError::from)?;

        // 幂等：重复投递的记录直接跳过
        if order::exists_by_user_and_voucher(&mut tx, record.user_id, record.voucher_id).await? {
            tracing::info!(
                order_id = record.order_id,
                user_id = record.user_id,
                voucher_id = record.voucher_id,
                "Order already materialized, skipping redelivery"
            );
            tx.rollback().await.map_err(RepoError::from)?;
            return Ok(());
        }

        // 权威 CAS：脚本已担保资格，此处失败意味着数据被绕过脚本修改
        if !voucher::decrement_stock(&mut tx, record.voucher_id).await? {
            tracing::warn!(
                order_id = record.order_id,
                user_id = record.user_id,
                voucher_id = record.voucher_id,
                "ANOMALY: authoritative stock CAS failed after a granted reservation, dropping record"
            );
            tx.rollback().await.map_err(RepoError::from)?;
            return Ok(());
        }

        order::insert(
            &mut tx,
            &VoucherOrder {
                id: record.order_id,
                user_id: record.user_id,
                voucher_id: record.voucher_id,
                created_at: now_millis(),
            },
        )
        .await?;
        tx.commit().await.map_err(RepoError::from)?;

        tracing::info!(
            order_id = record.order_id,
            user_id = record.user_id,
            voucher_id = record.voucher_id,
            "Order materialized"
        );
        Ok(())
    }
}
