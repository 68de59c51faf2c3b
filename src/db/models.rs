//! Database Models

use serde::{Deserialize, Serialize};

/// 优惠券 (秒杀库存的权威记录)
///
/// 不变量：`stock >= 0`；仅 `active_from <= now < active_until` 时可购。
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Voucher {
    pub id: i64,
    pub shop_id: i64,
    pub title: String,
    /// 权威库存，只经落库 CAS 递减
    pub stock: i64,
    /// 开售时间 (Unix timestamp millis)
    pub active_from: i64,
    /// 停售时间 (Unix timestamp millis)
    pub active_until: i64,
    pub created_at: i64,
}

impl Voucher {
    /// 当前时刻是否在售卖窗口内
    pub fn is_active_at(&self, now: i64) -> bool {
        self.active_from <= now && now < self.active_until
    }
}

/// 优惠券订单
///
/// `(user_id, voucher_id)` 上的唯一索引是一人一单的最终保证。
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VoucherOrder {
    /// 由 ID 生成器铸造
    pub id: i64,
    pub user_id: i64,
    pub voucher_id: i64,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_window_is_half_open() {
        let voucher = Voucher {
            id: 1,
            shop_id: 1,
            title: "test".into(),
            stock: 10,
            active_from: 1000,
            active_until: 2000,
            created_at: 0,
        };
        assert!(!voucher.is_active_at(999));
        assert!(voucher.is_active_at(1000));
        assert!(voucher.is_active_at(1999));
        assert!(!voucher.is_active_at(2000));
    }
}
