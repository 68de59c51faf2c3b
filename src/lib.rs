//! Seckill Engine - 秒杀订单流水线
//!
//! # 架构概述
//!
//! 在高并发争抢下发放严格限量、每用户唯一的购买资格：不超卖、
//! 不重复下单、崩溃不丢单。
//!
//! - **预订** (`orders::service`): 原子评估资格并预留库存，成功即
//!   返回订单 ID，落库异步进行
//! - **落库** (`orders::consumer`): 消费者组驱动的后台工作者，
//!   至少一次投递 + 幂等持久化 + pending 恢复
//! - **共享存储** (`store`): 计数器、集合、消费者组流与原子预订
//!   脚本的能力契约，内存与 Redis 双后端
//! - **缓存一致性** (`cache`): 穿透/互斥重建/逻辑过期三策略
//! - **ID 生成** (`idgen`): 时间戳 + 每日计数的 64 位全局 ID
//! - **分布式锁** (`lock`): 带租约与持有者令牌的命名锁
//!
//! # 模块结构
//!
//! ```text
//! src/
//! ├── core/      # 配置、错误、后台任务
//! ├── store/     # 共享存储契约与双后端
//! ├── cache.rs   # 缓存一致性层
//! ├── idgen.rs   # 分布式 ID 生成器
//! ├── lock.rs    # 分布式互斥锁
//! ├── orders/    # 预订服务与落库消费者
//! ├── db/        # SQLite 权威存储
//! └── utils/     # 日志、时间工具
//! ```

pub mod cache;
pub mod core;
pub mod db;
pub mod idgen;
pub mod lock;
pub mod orders;
pub mod store;
pub mod utils;

// Re-export 公共类型
pub use cache::{CacheClient, CacheError, CacheOptions, CachedValue};
pub use core::{BackgroundTasks, EngineConfig, EngineError, ReserveError, TaskKind};
pub use db::DbService;
pub use idgen::IdWorker;
pub use lock::StoreLock;
pub use orders::{OrderConsumer, RequestContext, Reservation, SeckillService};
pub use store::{MemoryStore, RedisStore, ReserveCode, SharedStore, StoreError};

// Re-export logger functions
pub use utils::logger::{init_logger, init_logger_with_file};
