use std::time::Duration;

/// 引擎配置 - 秒杀订单流水线的所有配置项
///
/// # 环境变量
///
/// 所有配置项都可以通过环境变量覆盖：
///
/// | 环境变量 | 默认值 | 说明 |
/// |----------|--------|------|
/// | DB_PATH | seckill.db | SQLite 数据库路径 |
/// | REDIS_URL | redis://127.0.0.1:6379 | 共享存储地址 |
/// | ORDER_STREAM | stream.orders | 预订记录流名称 |
/// | CONSUMER_GROUP | g1 | 消费者组名称 |
/// | CONSUMER_COUNT | 1 | 消费者工作者数量 |
/// | CONSUMER_BLOCK_MS | 2000 | 流阻塞读取上限(毫秒) |
/// | PENDING_BACKOFF_MS | 20 | 恢复循环失败后的退避(毫秒) |
/// | ORDER_LOCK_TTL_SECS | 30 | 落库时的按用户锁租约(秒) |
/// | CACHE_TTL_SECS | 1800 | 缓存物理过期时间(秒) |
/// | CACHE_NULL_TTL_SECS | 120 | 空值缓存过期时间(秒) |
/// | CACHE_LOCK_TTL_SECS | 10 | 缓存重建锁租约(秒) |
/// | CACHE_RETRY_INTERVAL_MS | 50 | 互斥重建读者的重试间隔(毫秒) |
/// | CACHE_MAX_REBUILD_RETRIES | 100 | 互斥重建读者的最大重试次数 |
///
/// # 示例
///
/// ```ignore
/// DB_PATH=/data/seckill.db CONSUMER_COUNT=2 cargo run
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLite 数据库路径 (订单与优惠券的权威存储)
    pub db_path: String,
    /// 共享存储 URL
    pub redis_url: String,
    /// 预订记录流名称
    pub order_stream: String,
    /// 消费者组名称
    pub consumer_group: String,
    /// 消费者工作者数量 (每个工作者是组内一个独立命名的消费者)
    pub consumer_count: u32,
    /// 流阻塞读取上限
    pub consumer_block: Duration,
    /// 恢复循环中失败后的固定退避
    pub pending_backoff: Duration,
    /// 落库时按用户锁的租约
    pub order_lock_ttl: Duration,
    /// 缓存物理 TTL
    pub cache_ttl: Duration,
    /// 空值标记 TTL (缓存穿透防护)
    pub cache_null_ttl: Duration,
    /// 缓存重建锁租约
    pub cache_lock_ttl: Duration,
    /// 互斥重建读者的固定重试间隔
    pub cache_retry_interval: Duration,
    /// 互斥重建读者的最大重试次数
    pub cache_max_rebuild_retries: u32,
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl EngineConfig {
    /// 从环境变量加载配置
    ///
    /// 如果环境变量未设置，使用默认值
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "seckill.db".into()),
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
            order_stream: std::env::var("ORDER_STREAM").unwrap_or_else(|_| "stream.orders".into()),
            consumer_group: std::env::var("CONSUMER_GROUP").unwrap_or_else(|_| "g1".into()),
            consumer_count: env_u64("CONSUMER_COUNT", 1) as u32,
            consumer_block: Duration::from_millis(env_u64("CONSUMER_BLOCK_MS", 2000)),
            pending_backoff: Duration::from_millis(env_u64("PENDING_BACKOFF_MS", 20)),
            order_lock_ttl: Duration::from_secs(env_u64("ORDER_LOCK_TTL_SECS", 30)),
            cache_ttl: Duration::from_secs(env_u64("CACHE_TTL_SECS", 1800)),
            cache_null_ttl: Duration::from_secs(env_u64("CACHE_NULL_TTL_SECS", 120)),
            cache_lock_ttl: Duration::from_secs(env_u64("CACHE_LOCK_TTL_SECS", 10)),
            cache_retry_interval: Duration::from_millis(env_u64("CACHE_RETRY_INTERVAL_MS", 50)),
            cache_max_rebuild_retries: env_u64("CACHE_MAX_REBUILD_RETRIES", 100) as u32,
        }
    }

    /// 使用自定义值覆盖部分配置
    ///
    /// 常用于测试场景
    pub fn with_overrides(db_path: impl Into<String>, consumer_count: u32) -> Self {
        let mut config = Self::from_env();
        config.db_path = db_path.into();
        config.consumer_count = consumer_count;
        config
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_env() {
        let config = EngineConfig::from_env();
        assert_eq!(config.order_stream, "stream.orders");
        assert_eq!(config.consumer_group, "g1");
        assert_eq!(config.consumer_block, Duration::from_millis(2000));
        assert_eq!(config.pending_backoff, Duration::from_millis(20));
        assert_eq!(config.cache_retry_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_with_overrides() {
        let config = EngineConfig::with_overrides(":memory:", 3);
        assert_eq!(config.db_path, ":memory:");
        assert_eq!(config.consumer_count, 3);
    }
}
