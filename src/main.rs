//! 订单落库守护进程
//!
//! 连接共享存储与 SQLite，按配置启动 N 个消费者工作者，
//! ctrl-c 后优雅排空。

use seckill_engine::orders::consumer::{ConsumerConfig, OrderConsumer};
use seckill_engine::{
    BackgroundTasks, DbService, EngineConfig, EngineError, RedisStore, SharedStore, TaskKind,
    init_logger,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    // 1. 环境与日志
    dotenv::dotenv().ok();
    init_logger();

    tracing::info!("Seckill engine starting...");

    // 2. 配置
    let config = EngineConfig::from_env();

    // 3. 权威存储与共享存储
    let db = DbService::new(&config.db_path).await?;
    let store: Arc<dyn SharedStore> = Arc::new(RedisStore::new(&config.redis_url).await?);
    tracing::info!(redis_url = %config.redis_url, "Shared store connected");

    // 4. 消费者工作者
    //
    // 消费者名必须跨重启稳定才能继承自己的 pending 列表；
    // 以 c{N} 命名，组内互不重复。
    let mut tasks = BackgroundTasks::new();
    for n in 1..=config.consumer_count.max(1) {
        let consumer = OrderConsumer::new(
            store.clone(),
            db.pool.clone(),
            ConsumerConfig {
                stream: config.order_stream.clone(),
                group: config.consumer_group.clone(),
                consumer: format!("c{n}"),
                block: config.consumer_block,
                backoff: config.pending_backoff,
                lock_ttl: config.order_lock_ttl,
            },
        );
        let token = tasks.shutdown_token();
        tasks.spawn(format!("order_consumer:c{n}"), TaskKind::Worker, async move {
            consumer.run(token).await;
        });
    }
    tracing::info!(workers = tasks.len(), "Consumer workers started");

    // 5. 等待退出信号
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| EngineError::Config(format!("Failed to listen for ctrl-c: {e}")))?;
    tracing::info!("Shutdown signal received");

    tasks.shutdown().await;
    tracing::info!("Seckill engine stopped");
    Ok(())
}
