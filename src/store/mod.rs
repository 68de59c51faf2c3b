//! Shared store abstraction — 秒杀热路径的共享状态层
//!
//! Every cross-process primitive the engine relies on lives behind
//! [`SharedStore`]: TTL strings, per-voucher purchase sets, the durable
//! reservation stream with consumer groups, and the atomic reservation
//! evaluation itself.
//!
//! Two backends implement the contract:
//!
//! - [`MemoryStore`] — in-process engine with the same single-writer
//!   semantics, used by tests and single-node deployments
//! - [`RedisStore`] — Redis via connection manager, with the reservation
//!   and unlock steps as server-side Lua
//!
//! # Atomicity model
//!
//! [`SharedStore::reserve_voucher`] is the only operation that mutates the
//! hot-path stock counter and purchase set, and it does so indivisibly:
//! either all of its effects happen (decrement, set add, stream append) or
//! none do. Backends guarantee this with a Lua script (Redis) or a single
//! mutex section (memory).

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// 存储不可达或命令失败 — 调用方不得凭空编造结果
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// 库存状态键缺失 — fail closed，预订必须拒绝
    #[error("voucher state missing: {0}")]
    StateMissing(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of the atomic reservation evaluation.
///
/// The integer mapping is a stable wire contract shared with the Lua
/// script: 0 = granted, 1 = stock exhausted, 2 = duplicate order,
/// 3 = voucher outside its active window (produced by the caller-side
/// window check, never by the store).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveCode {
    Ok,
    StockExhausted,
    DuplicateOrder,
    VoucherInvalid,
}

impl ReserveCode {
    pub fn as_i64(self) -> i64 {
        match self {
            ReserveCode::Ok => 0,
            ReserveCode::StockExhausted => 1,
            ReserveCode::DuplicateOrder => 2,
            ReserveCode::VoucherInvalid => 3,
        }
    }

    pub fn from_i64(code: i64) -> Option<Self> {
        match code {
            0 => Some(ReserveCode::Ok),
            1 => Some(ReserveCode::StockExhausted),
            2 => Some(ReserveCode::DuplicateOrder),
            3 => Some(ReserveCode::VoucherInvalid),
            _ => None,
        }
    }
}

/// 预订记录的流字段名，与 Redis 端 Lua 脚本的 XADD 保持一致
pub const FIELD_USER_ID: &str = "userId";
pub const FIELD_VOUCHER_ID: &str = "voucherId";
pub const FIELD_ORDER_ID: &str = "id";

/// One entry of the reservation stream
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Store-assigned entry id, unique and increasing within the stream
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Shared store capability contract.
///
/// All methods surface infrastructure failures as [`StoreError`]; none of
/// them fabricate a success when the store cannot be reached.
#[async_trait]
pub trait SharedStore: Send + Sync {
    // ========== Strings with TTL ==========

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// SET with optional time-to-live. `None` stores without expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// SET if absent, with mandatory lease TTL. Returns whether the key was set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Delete the key only if it still holds `expected`, atomically.
    /// Returns whether a deletion happened.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    // ========== Counters ==========

    /// Atomic increment, creating the key at 0 first when absent.
    async fn incr(&self, key: &str) -> StoreResult<i64>;

    // ========== Atomic reservation ==========

    /// Indivisible reservation evaluation for one (voucher, user) pair:
    ///
    /// 1. stock key absent → `Err(StateMissing)` (fail closed)
    /// 2. stock <= 0 → `StockExhausted`
    /// 3. user already in the purchase set → `DuplicateOrder`
    /// 4. otherwise decrement stock, add user, append the reservation
    ///    record to `stream` → `Ok`
    ///
    /// 失败路径不产生任何副作用；已铸造的 order_id 不回收。
    async fn reserve_voucher(
        &self,
        stream: &str,
        voucher_id: i64,
        user_id: i64,
        order_id: i64,
    ) -> StoreResult<ReserveCode>;

    // ========== Streams with consumer groups ==========

    /// Create the stream and consumer group if missing. The group starts at
    /// the beginning of the stream so records appended before the first
    /// worker boots are still delivered. Succeeds when both already exist.
    async fn ensure_group(&self, stream: &str, group: &str) -> StoreResult<()>;

    /// Read one new entry for `consumer`, blocking up to `block`.
    /// `None` means the wait timed out with nothing to deliver.
    /// The entry becomes pending for this consumer until acked.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> StoreResult<Option<StreamEntry>>;

    /// Read one entry from this consumer's pending list, oldest first,
    /// without blocking. `None` means the pending list is empty.
    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> StoreResult<Option<StreamEntry>>;

    /// Acknowledge an entry, removing it from the pending list.
    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> StoreResult<()>;

    /// Number of delivered-but-unacked entries across the whole group.
    async fn pending_count(&self, stream: &str, group: &str) -> StoreResult<usize>;
}

/// Key naming, shared by both backends and by tests.
///
/// 键名布局沿用约定：`seckill:stock:{voucherId}`、`seckill:order:{voucherId}`、
/// `icr:{ns}:{yyyy:MM:dd}`、`lock:{name}`、`cache:voucher:{id}`。
pub mod keys {
    pub const STOCK_PREFIX: &str = "seckill:stock:";
    pub const ORDER_SET_PREFIX: &str = "seckill:order:";
    pub const ID_COUNTER_PREFIX: &str = "icr:";
    pub const LOCK_PREFIX: &str = "lock:";
    pub const VOUCHER_CACHE_PREFIX: &str = "cache:voucher:";

    /// 某优惠券的热路径库存计数
    pub fn stock_key(voucher_id: i64) -> String {
        format!("{STOCK_PREFIX}{voucher_id}")
    }

    /// 某优惠券的已购用户集合
    pub fn order_set_key(voucher_id: i64) -> String {
        format!("{ORDER_SET_PREFIX}{voucher_id}")
    }

    /// 优惠券缓存信封
    pub fn voucher_cache_key(voucher_id: i64) -> String {
        format!("{VOUCHER_CACHE_PREFIX}{voucher_id}")
    }

    /// Lock name for materializing one user's orders (`lock:` is prepended
    /// by the lock itself)
    pub fn order_lock_name(user_id: i64) -> String {
        format!("order:{user_id}")
    }

    /// Lock name guarding a voucher cache rebuild
    pub fn voucher_cache_lock_name(voucher_id: i64) -> String {
        format!("cache:voucher:{voucher_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_code_mapping_is_stable() {
        assert_eq!(ReserveCode::Ok.as_i64(), 0);
        assert_eq!(ReserveCode::StockExhausted.as_i64(), 1);
        assert_eq!(ReserveCode::DuplicateOrder.as_i64(), 2);
        assert_eq!(ReserveCode::VoucherInvalid.as_i64(), 3);

        for code in 0..4 {
            assert_eq!(ReserveCode::from_i64(code).map(ReserveCode::as_i64), Some(code));
        }
        assert_eq!(ReserveCode::from_i64(4), None);
        assert_eq!(ReserveCode::from_i64(-1), None);
    }

    #[test]
    fn test_key_naming() {
        assert_eq!(keys::stock_key(7), "seckill:stock:7");
        assert_eq!(keys::order_set_key(7), "seckill:order:7");
        assert_eq!(keys::voucher_cache_key(7), "cache:voucher:7");
        assert_eq!(keys::order_lock_name(42), "order:42");
        assert_eq!(keys::voucher_cache_lock_name(7), "cache:voucher:7");
    }
}
