//! 分布式 ID 生成器
//!
//! 全局唯一、大致按时间排序的 64 位 ID：
//!
//! ```text
//! | 32 bit: epoch_seconds - 2023-01-01 | 32 bit: 当日命名空间计数 |
//! ```
//!
//! 计数器按 `icr:{ns}:{yyyy:MM:dd}` 每日分片，同一命名空间同一天内
//! 计数不超过 2^32 时唯一；跨命名空间不可全局排序。计数器自增依赖
//! 共享存储，存储不可达时返回错误，绝不凭空编造 ID。

use crate::store::{SharedStore, StoreResult, keys};
use crate::utils::time::{counter_day, epoch_seconds};
use std::sync::Arc;

/// 自定义纪元：2023-01-01T00:00:00Z
const BEGIN_TIMESTAMP: i64 = 1_672_531_200;
/// 序列号位数
const COUNT_BITS: u32 = 32;

/// ID 生成器
#[derive(Clone)]
pub struct IdWorker {
    store: Arc<dyn SharedStore>,
}

impl IdWorker {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// 生成下一个 ID
    ///
    /// 高 32 位为相对纪元的秒数，低 32 位为当日计数；同一进程内
    /// 时钟不回拨时单调不减。
    pub async fn next_id(&self, namespace: &str) -> StoreResult<u64> {
        let timestamp = (epoch_seconds() - BEGIN_TIMESTAMP) as u64;
        let key = format!("{}{}:{}", keys::ID_COUNTER_PREFIX, namespace, counter_day());
        let count = self.store.incr(&key).await? as u64;
        Ok(timestamp << COUNT_BITS | count)
    }
}
