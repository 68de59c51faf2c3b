//! 订单流水线的记录类型

use crate::store::{FIELD_ORDER_ID, FIELD_USER_ID, FIELD_VOUCHER_ID, StreamEntry};
use serde::{Deserialize, Serialize};

/// 请求作用域上下文
///
/// 认证用户由外层显式传入，核心不依赖任何线程局部的环境状态。
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub user_id: i64,
}

/// 预订成功的返回值；落库异步进行，调用方不等待
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Reservation {
    pub order_id: i64,
}

/// 预订流中的一条记录
///
/// 生命周期：CREATED → DELIVERED → {MATERIALIZED | REDELIVERED → DELIVERED}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationRecord {
    /// 流条目 id，ack 时使用
    pub entry_id: String,
    pub order_id: i64,
    pub user_id: i64,
    pub voucher_id: i64,
}

impl ReservationRecord {
    /// 从流条目解析；字段缺失或非数字视为记录损坏
    pub fn from_entry(entry: &StreamEntry) -> Result<Self, String> {
        let field = |name: &str| -> Result<i64, String> {
            entry
                .fields
                .get(name)
                .ok_or_else(|| format!("missing field {name} in entry {}", entry.id))?
                .parse::<i64>()
                .map_err(|_| format!("non-numeric field {name} in entry {}", entry.id))
        };
        Ok(Self {
            entry_id: entry.id.clone(),
            order_id: field(FIELD_ORDER_ID)?,
            user_id: field(FIELD_USER_ID)?,
            voucher_id: field(FIELD_VOUCHER_ID)?,
        })
    }
}
