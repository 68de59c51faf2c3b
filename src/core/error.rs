//! 统一错误处理
//!
//! 提供两层错误类型：
//! - [`ReserveError`] - 预订路径的用户可见结果，消息集合固定，
//!   绝不携带内部错误细节
//! - [`EngineError`] - 引擎内部错误，带 `#[from]` 转换链，细节只进日志

use crate::cache::CacheError;
use crate::db::repository::RepoError;
use crate::store::StoreError;

/// 预订请求的用户可见失败
///
/// # 稳定消息映射
///
/// | 变体 | 脚本码 | 消息 |
/// |------|--------|------|
/// | StockExhausted | 1 | stock exhausted |
/// | DuplicateOrder | 2 | duplicate order |
/// | NotStarted / Ended | 3 | seckill has not started / has ended |
///
/// `Unavailable` 覆盖一切基础设施故障；脚本的全有或全无保证
/// 此时没有任何部分副作用。
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReserveError {
    /// 入参非法，未产生任何副作用
    #[error("invalid voucher id")]
    Validation,

    /// 优惠券不存在
    #[error("voucher not found")]
    VoucherNotFound,

    /// 秒杀未开始
    #[error("seckill has not started")]
    NotStarted,

    /// 秒杀已结束
    #[error("seckill has ended")]
    Ended,

    /// 库存不足 — 终态，不重试
    #[error("stock exhausted")]
    StockExhausted,

    /// 一人一单 — 终态，不重试
    #[error("duplicate order")]
    DuplicateOrder,

    /// 基础设施故障，内部细节不外泄
    #[error("service temporarily unavailable")]
    Unavailable,
}

/// 引擎内部错误
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Database(#[from] RepoError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_facing_messages_are_stable() {
        // 对外消息是接口契约的一部分，改动即破坏兼容
        assert_eq!(ReserveError::StockExhausted.to_string(), "stock exhausted");
        assert_eq!(ReserveError::DuplicateOrder.to_string(), "duplicate order");
        assert_eq!(ReserveError::NotStarted.to_string(), "seckill has not started");
        assert_eq!(ReserveError::Ended.to_string(), "seckill has ended");
        assert_eq!(
            ReserveError::Unavailable.to_string(),
            "service temporarily unavailable"
        );
    }
}
