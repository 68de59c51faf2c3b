//! In-memory shared store backend
//!
//! 单进程内实现与 Redis 相同的语义：带 TTL 的字符串、集合、
//! 消费者组流。所有多步操作都在同一把锁内完成，等价于 Redis
//! 脚本的单线程执行模型，因此预订评估天然不可分割。
//!
//! Used by the hermetic test suite and by single-node deployments that do
//! not want an external store.
//!
//! TTL is enforced lazily: an expired string is removed the next time any
//! operation touches its key.

use super::{
    FIELD_ORDER_ID, FIELD_USER_ID, FIELD_VOUCHER_ID, ReserveCode, SharedStore, StoreError,
    StoreResult, StreamEntry, keys,
};
use crate::utils::now_millis;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

struct StringEntry {
    value: String,
    /// Unix millis; `None` = no expiry
    expires_at: Option<i64>,
}

#[derive(Default)]
struct Group {
    /// Index of the next never-delivered entry
    cursor: usize,
    /// Delivered-but-unacked entries: entry index -> consumer name
    pending: BTreeMap<usize, String>,
}

#[derive(Default)]
struct Stream {
    next_seq: u64,
    entries: Vec<StreamEntry>,
    index_by_id: HashMap<String, usize>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Keyspace {
    strings: HashMap<String, StringEntry>,
    sets: HashMap<String, HashSet<String>>,
    streams: HashMap<String, Stream>,
}

impl Keyspace {
    fn expire_if_needed(&mut self, key: &str) {
        let expired = self
            .strings
            .get(key)
            .is_some_and(|e| e.expires_at.is_some_and(|at| at <= now_millis()));
        if expired {
            self.strings.remove(key);
        }
    }

    fn live_value(&mut self, key: &str) -> Option<String> {
        self.expire_if_needed(key);
        self.strings.get(key).map(|e| e.value.clone())
    }

    fn append(&mut self, stream: &str, fields: HashMap<String, String>) {
        let s = self.streams.entry(stream.to_string()).or_default();
        let seq = s.next_seq;
        s.next_seq += 1;
        let id = format!("{}-{}", now_millis(), seq);
        let idx = s.entries.len();
        s.index_by_id.insert(id.clone(), idx);
        s.entries.push(StreamEntry { id, fields });
    }

    fn group_mut(&mut self, stream: &str, group: &str) -> StoreResult<(&mut Vec<StreamEntry>, &mut Group)> {
        let s = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| StoreError::Protocol(format!("no such stream: {stream}")))?;
        let g = s
            .groups
            .get_mut(group)
            .ok_or_else(|| StoreError::Protocol(format!("no such group {group} on stream {stream}")))?;
        Ok((&mut s.entries, g))
    }
}

struct Inner {
    keyspace: Mutex<Keyspace>,
    /// Woken on every stream append so blocked group reads can re-check
    appended: Notify,
}

/// In-memory [`SharedStore`] backend
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                keyspace: Mutex::new(Keyspace::default()),
                appended: Notify::new(),
            }),
        }
    }

    fn try_claim_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> StoreResult<Option<StreamEntry>> {
        let mut ks = self.inner.keyspace.lock();
        let (entries, g) = ks.group_mut(stream, group)?;
        if g.cursor < entries.len() {
            let idx = g.cursor;
            g.cursor += 1;
            g.pending.insert(idx, consumer.to_string());
            return Ok(Some(entries[idx].clone()));
        }
        Ok(None)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.inner.keyspace.lock().live_value(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut ks = self.inner.keyspace.lock();
        ks.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: ttl.map(|t| now_millis() + t.as_millis() as i64),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut ks = self.inner.keyspace.lock();
        ks.expire_if_needed(key);
        if ks.strings.contains_key(key) {
            return Ok(false);
        }
        ks.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Some(now_millis() + ttl.as_millis() as i64),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut ks = self.inner.keyspace.lock();
        if ks.live_value(key).as_deref() == Some(expected) {
            ks.strings.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.keyspace.lock().strings.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut ks = self.inner.keyspace.lock();
        let current = match ks.live_value(key) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| StoreError::Protocol(format!("key {key} holds a non-integer value")))?,
            None => 0,
        };
        let next = current + 1;
        // INCR keeps the existing TTL; a fresh key has none
        match ks.strings.get_mut(key) {
            Some(entry) => entry.value = next.to_string(),
            None => {
                ks.strings.insert(
                    key.to_string(),
                    StringEntry {
                        value: next.to_string(),
                        expires_at: None,
                    },
                );
            }
        }
        Ok(next)
    }

    async fn reserve_voucher(
        &self,
        stream: &str,
        voucher_id: i64,
        user_id: i64,
        order_id: i64,
    ) -> StoreResult<ReserveCode> {
        let stock_key = keys::stock_key(voucher_id);
        let set_key = keys::order_set_key(voucher_id);
        {
            let mut ks = self.inner.keyspace.lock();
            let Some(raw) = ks.live_value(&stock_key) else {
                return Err(StoreError::StateMissing(stock_key));
            };
            let stock: i64 = raw.parse().map_err(|_| {
                StoreError::Protocol(format!("stock key {stock_key} holds a non-integer value"))
            })?;
            if stock <= 0 {
                return Ok(ReserveCode::StockExhausted);
            }
            if !ks.sets.entry(set_key).or_default().insert(user_id.to_string()) {
                return Ok(ReserveCode::DuplicateOrder);
            }
            if let Some(entry) = ks.strings.get_mut(&stock_key) {
                entry.value = (stock - 1).to_string();
            }
            let mut fields = HashMap::new();
            fields.insert(FIELD_USER_ID.to_string(), user_id.to_string());
            fields.insert(FIELD_VOUCHER_ID.to_string(), voucher_id.to_string());
            fields.insert(FIELD_ORDER_ID.to_string(), order_id.to_string());
            ks.append(stream, fields);
        }
        self.inner.appended.notify_waiters();
        Ok(ReserveCode::Ok)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> StoreResult<()> {
        let mut ks = self.inner.keyspace.lock();
        let s = ks.streams.entry(stream.to_string()).or_default();
        s.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> StoreResult<Option<StreamEntry>> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            // Register for wakeups before checking, so an append between the
            // check and the await is never missed
            let notified = self.inner.appended.notified();
            if let Some(entry) = self.try_claim_new(stream, group, consumer)? {
                return Ok(Some(entry));
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> StoreResult<Option<StreamEntry>> {
        let mut ks = self.inner.keyspace.lock();
        let (entries, g) = ks.group_mut(stream, group)?;
        let entry = g
            .pending
            .iter()
            .find(|(_, c)| c.as_str() == consumer)
            .map(|(idx, _)| entries[*idx].clone());
        Ok(entry)
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> StoreResult<()> {
        let mut ks = self.inner.keyspace.lock();
        // 与 XACK 一致：流/组/条目不存在时静默返回
        let Some(s) = ks.streams.get_mut(stream) else {
            return Ok(());
        };
        let Some(idx) = s.index_by_id.get(entry_id).copied() else {
            return Ok(());
        };
        if let Some(g) = s.groups.get_mut(group) {
            g.pending.remove(&idx);
        }
        Ok(())
    }

    async fn pending_count(&self, stream: &str, group: &str) -> StoreResult<usize> {
        let mut ks = self.inner.keyspace.lock();
        let (_, g) = ks.group_mut(stream, group)?;
        Ok(g.pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = "stream.test";
    const GROUP: &str = "g1";

    #[tokio::test]
    async fn test_string_ttl_lazy_expiry() {
        let store = MemoryStore::new();
        store.set("k", "v", Some(Duration::from_millis(20))).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_nx_ex_contention_and_expiry() {
        let store = MemoryStore::new();
        assert!(store.set_nx_ex("lock", "a", Duration::from_millis(30)).await.unwrap());
        assert!(!store.set_nx_ex("lock", "b", Duration::from_millis(30)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Lease expired, a new holder may take over
        assert!(store.set_nx_ex("lock", "b", Duration::from_millis(30)).await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_delete_checks_token() {
        let store = MemoryStore::new();
        store.set("lock", "token-a", None).await.unwrap();

        assert!(!store.compare_and_delete("lock", "token-b").await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), Some("token-a".to_string()));

        assert!(store.compare_and_delete("lock", "token-a").await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_counts_from_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("counter").await.unwrap(), 1);
        assert_eq!(store.incr("counter").await.unwrap(), 2);
        assert_eq!(store.get("counter").await.unwrap(), Some("2".to_string()));

        store.set("junk", "abc", None).await.unwrap();
        assert!(matches!(
            store.incr("junk").await,
            Err(StoreError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_reserve_fails_closed_without_stock_state() {
        let store = MemoryStore::new();
        let err = store.reserve_voucher(STREAM, 1, 100, 1001).await.unwrap_err();
        assert!(matches!(err, StoreError::StateMissing(_)));
    }

    #[tokio::test]
    async fn test_reserve_decrements_until_exhausted() {
        let store = MemoryStore::new();
        store.set(&keys::stock_key(1), "2", None).await.unwrap();
        store.ensure_group(STREAM, GROUP).await.unwrap();

        assert_eq!(store.reserve_voucher(STREAM, 1, 100, 1001).await.unwrap(), ReserveCode::Ok);
        assert_eq!(store.reserve_voucher(STREAM, 1, 101, 1002).await.unwrap(), ReserveCode::Ok);
        assert_eq!(
            store.reserve_voucher(STREAM, 1, 102, 1003).await.unwrap(),
            ReserveCode::StockExhausted
        );
        assert_eq!(store.get(&keys::stock_key(1)).await.unwrap(), Some("0".to_string()));
    }

    #[tokio::test]
    async fn test_reserve_rejects_duplicate_user() {
        let store = MemoryStore::new();
        store.set(&keys::stock_key(1), "5", None).await.unwrap();

        assert_eq!(store.reserve_voucher(STREAM, 1, 100, 1001).await.unwrap(), ReserveCode::Ok);
        assert_eq!(
            store.reserve_voucher(STREAM, 1, 100, 1002).await.unwrap(),
            ReserveCode::DuplicateOrder
        );
        // The duplicate attempt must not burn stock
        assert_eq!(store.get(&keys::stock_key(1)).await.unwrap(), Some("4".to_string()));
    }

    #[tokio::test]
    async fn test_group_delivers_in_order_and_tracks_pending() {
        let store = MemoryStore::new();
        store.set(&keys::stock_key(1), "5", None).await.unwrap();
        store.ensure_group(STREAM, GROUP).await.unwrap();

        store.reserve_voucher(STREAM, 1, 100, 1001).await.unwrap();
        store.reserve_voucher(STREAM, 1, 101, 1002).await.unwrap();

        let first = store
            .read_group(STREAM, GROUP, "c1", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.fields.get(FIELD_ORDER_ID), Some(&"1001".to_string()));
        assert_eq!(store.pending_count(STREAM, GROUP).await.unwrap(), 1);

        // Unacked entry stays on this consumer's pending list
        let pending = store.read_pending(STREAM, GROUP, "c1").await.unwrap().unwrap();
        assert_eq!(pending.id, first.id);
        // ...but not on another consumer's
        assert!(store.read_pending(STREAM, GROUP, "c2").await.unwrap().is_none());

        store.ack(STREAM, GROUP, &first.id).await.unwrap();
        assert!(store.read_pending(STREAM, GROUP, "c1").await.unwrap().is_none());
        assert_eq!(store.pending_count(STREAM, GROUP).await.unwrap(), 0);

        let second = store
            .read_group(STREAM, GROUP, "c1", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.fields.get(FIELD_ORDER_ID), Some(&"1002".to_string()));
        assert_eq!(store.pending_count(STREAM, GROUP).await.unwrap(), 1);
        store.ack(STREAM, GROUP, &second.id).await.unwrap();
        assert_eq!(store.pending_count(STREAM, GROUP).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_group_created_at_start_sees_prior_entries() {
        let store = MemoryStore::new();
        store.set(&keys::stock_key(1), "5", None).await.unwrap();
        // Entry appended before the group exists
        store.reserve_voucher(STREAM, 1, 100, 1001).await.unwrap();

        store.ensure_group(STREAM, GROUP).await.unwrap();
        let entry = store
            .read_group(STREAM, GROUP, "c1", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(entry.is_some());
    }

    #[tokio::test]
    async fn test_blocking_read_times_out_empty() {
        let store = MemoryStore::new();
        store.ensure_group(STREAM, GROUP).await.unwrap();

        let started = tokio::time::Instant::now();
        let entry = store
            .read_group(STREAM, GROUP, "c1", Duration::from_millis(40))
            .await
            .unwrap();
        assert!(entry.is_none());
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let store = MemoryStore::new();
        store.set(&keys::stock_key(1), "5", None).await.unwrap();
        store.ensure_group(STREAM, GROUP).await.unwrap();

        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer.reserve_voucher(STREAM, 1, 100, 1001).await.unwrap();
        });

        let started = tokio::time::Instant::now();
        let entry = store
            .read_group(STREAM, GROUP, "c1", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(entry.is_some());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_read_group_requires_group() {
        let store = MemoryStore::new();
        let err = store
            .read_group("stream.missing", GROUP, "c1", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Protocol(_)));
    }
}
