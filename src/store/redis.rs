//! Redis shared store backend
//!
//! 通过 `ConnectionManager` 复用连接；预订评估与比较删除在服务端
//! 以 Lua 执行，借助 Redis 的单线程脚本模型获得不可分割性。
//! 流操作映射到 XGROUP / XREADGROUP / XACK / XPENDING。

use super::{ReserveCode, SharedStore, StoreError, StoreResult, StreamEntry, keys};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamPendingReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use std::time::Duration;

/// 预订评估脚本
///
/// KEYS[1] = 库存键, KEYS[2] = 已购用户集合, KEYS[3] = 预订流；
/// ARGV[1] = userId, ARGV[2] = voucherId, ARGV[3] = orderId。
///
/// 返回值：-1 库存键缺失（fail closed），其余与 [`ReserveCode`] 的
/// 线上映射一致。失败路径不执行任何写命令。
const RESERVE_SCRIPT: &str = r#"
local stock = redis.call('get', KEYS[1])
if not stock then
    return -1
end
if tonumber(stock) <= 0 then
    return 1
end
if redis.call('sismember', KEYS[2], ARGV[1]) == 1 then
    return 2
end
redis.call('incrby', KEYS[1], -1)
redis.call('sadd', KEYS[2], ARGV[1])
redis.call('xadd', KEYS[3], '*', 'userId', ARGV[1], 'voucherId', ARGV[2], 'id', ARGV[3])
return 0
"#;

/// 比较删除脚本：仅当键仍持有期望令牌时删除
const COMPARE_DELETE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
end
return 0
"#;

fn store_err(e: redis::RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Redis-backed [`SharedStore`]
#[derive(Clone)]
pub struct RedisStore {
    conn_manager: ConnectionManager,
}

impl RedisStore {
    /// 连接 Redis
    ///
    /// # Arguments
    ///
    /// * `redis_url` - 如 "redis://127.0.0.1:6379"
    pub async fn new(redis_url: &str) -> StoreResult<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| StoreError::Unavailable(format!("invalid redis url: {e}")))?;
        let conn_manager = ConnectionManager::new(client).await.map_err(store_err)?;
        Ok(Self { conn_manager })
    }

    fn entry_from_id(id: &redis::streams::StreamId) -> StoreResult<StreamEntry> {
        let mut fields = HashMap::new();
        for (name, value) in &id.map {
            let value: String = redis::from_redis_value(value)
                .map_err(|e| StoreError::Protocol(format!("non-string stream field: {e}")))?;
            fields.insert(name.clone(), value);
        }
        Ok(StreamEntry { id: id.id.clone(), fields })
    }

    /// 以组语义读一条消息；`offset` 为 ">" 读新消息、"0" 读本消费者的 pending
    async fn read_one(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        offset: &str,
        block: Option<Duration>,
    ) -> StoreResult<Option<StreamEntry>> {
        let mut conn = self.conn_manager.clone();
        let mut opts = StreamReadOptions::default().group(group, consumer).count(1);
        if let Some(block) = block {
            opts = opts.block(block.as_millis() as usize);
        }
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[offset], &opts)
            .await
            .map_err(store_err)?;
        let entry = reply
            .keys
            .iter()
            .flat_map(|k| k.ids.iter())
            .next()
            .map(Self::entry_from_id)
            .transpose()?;
        Ok(entry)
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn_manager.clone();
        conn.get(key).await.map_err(store_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn_manager.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn
                    .set_ex(key, value, ttl.as_secs().max(1))
                    .await
                    .map_err(store_err)?;
            }
            None => {
                let _: () = conn.set(key, value).await.map_err(store_err)?;
            }
        }
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn_manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.conn_manager.clone();
        let deleted: i64 = Script::new(COMPARE_DELETE_SCRIPT)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(deleted == 1)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn.del(key).await.map_err(store_err)?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.conn_manager.clone();
        conn.incr(key, 1).await.map_err(store_err)
    }

    async fn reserve_voucher(
        &self,
        stream: &str,
        voucher_id: i64,
        user_id: i64,
        order_id: i64,
    ) -> StoreResult<ReserveCode> {
        let mut conn = self.conn_manager.clone();
        let code: i64 = Script::new(RESERVE_SCRIPT)
            .key(keys::stock_key(voucher_id))
            .key(keys::order_set_key(voucher_id))
            .key(stream)
            .arg(user_id.to_string())
            .arg(voucher_id.to_string())
            .arg(order_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        if code == -1 {
            return Err(StoreError::StateMissing(keys::stock_key(voucher_id)));
        }
        ReserveCode::from_i64(code)
            .ok_or_else(|| StoreError::Protocol(format!("reservation script returned {code}")))
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> StoreResult<()> {
        let mut conn = self.conn_manager.clone();
        // MKSTREAM + 起始偏移 0：先于首个工作者写入的记录也会被投递
        let result: Result<String, _> = conn.xgroup_create_mkstream(stream, group, "0").await;
        match result {
            Ok(_) => Ok(()),
            // 组已存在时幂等成功
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(store_err(e)),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> StoreResult<Option<StreamEntry>> {
        self.read_one(stream, group, consumer, ">", Some(block)).await
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> StoreResult<Option<StreamEntry>> {
        self.read_one(stream, group, consumer, "0", None).await
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> StoreResult<()> {
        let mut conn = self.conn_manager.clone();
        let _: i64 = conn.xack(stream, group, &[entry_id]).await.map_err(store_err)?;
        Ok(())
    }

    async fn pending_count(&self, stream: &str, group: &str) -> StoreResult<usize> {
        let mut conn = self.conn_manager.clone();
        let reply: StreamPendingReply = conn.xpending(stream, group).await.map_err(store_err)?;
        Ok(reply.count())
    }
}
