//! 进程内存储
//!
//! 语义与 etcd 对齐的内存实现：租约按 tokio 时钟过期，每个截止时间由一个后台任务
//! 负责清理；过期或撤销时删除绑定的 key 并向 watch 推送带旧值的 Delete 事件。
//! 支持故障注入，用于本地开发和测试。

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

use super::{KeyValue, LeaseId, Store, StoreEvent, StoreEventKind, StoreEventStream};
use crate::error::StoreError;

struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

struct LeaseState {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct WatchSubscriber {
    prefix: String,
    tx: mpsc::UnboundedSender<StoreEvent>,
}

#[derive(Default)]
struct MemoryState {
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, LeaseState>,
    next_lease: LeaseId,
    watchers: Vec<WatchSubscriber>,
}

impl MemoryState {
    fn notify(&mut self, event: StoreEvent) {
        self.watchers.retain(|w| !w.tx.is_closed());
        for watcher in &self.watchers {
            if event.key.starts_with(&watcher.prefix) {
                let _ = watcher.tx.send(event.clone());
            }
        }
    }

    fn delete_key(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        if let Some(lease) = entry.lease.and_then(|id| self.leases.get_mut(&id)) {
            lease.keys.remove(key);
        }
        self.notify(StoreEvent {
            kind: StoreEventKind::Delete,
            key: key.to_string(),
            value: Vec::new(),
            prev_value: Some(entry.value),
        });
        true
    }

    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        for key in lease.keys {
            // 只删除仍然绑定在该租约上的 key，被重新注册覆盖的不动
            if self.entries.get(&key).is_some_and(|e| e.lease == Some(id)) {
                self.delete_key(&key);
            }
        }
        true
    }

    fn expire_due(&mut self, now: Instant) {
        let due: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            debug!(lease_id = id, "memory store lease expired");
            self.drop_lease(id);
        }
    }
}

#[derive(Default)]
struct Faults {
    unavailable: AtomicBool,
    reject_grants: AtomicBool,
    reject_keep_alives: AtomicBool,
    reject_puts: AtomicBool,
    failing_keep_alives: AtomicU64,
    put_delay_ms: AtomicU64,
}

#[derive(Default)]
struct Counters {
    gets: AtomicU64,
    grants: AtomicU64,
    keep_alives: AtomicU64,
    puts: AtomicU64,
    revokes: AtomicU64,
}

/// 存储调用统计（包含失败的调用）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub gets: u64,
    pub grants: u64,
    pub keep_alives: u64,
    pub puts: u64,
    pub revokes: u64,
}

/// 进程内存储
#[derive(Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    faults: Faults,
    counters: Counters,
}

impl MemoryStore {
    /// 创建空存储
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟存储整体不可达：所有操作失败
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// 拒绝所有租约授予
    pub fn reject_grants(&self, reject: bool) {
        self.faults.reject_grants.store(reject, Ordering::SeqCst);
    }

    /// 拒绝所有续约
    pub fn reject_keep_alives(&self, reject: bool) {
        self.faults.reject_keep_alives.store(reject, Ordering::SeqCst);
    }

    /// 拒绝所有写入
    pub fn reject_puts(&self, reject: bool) {
        self.faults.reject_puts.store(reject, Ordering::SeqCst);
    }

    /// 写入生效后再等待 `delay` 才返回，模拟慢响应
    pub fn set_put_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.faults.put_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// 让接下来的 `n` 次续约失败
    pub fn fail_next_keep_alives(&self, n: u64) {
        self.faults.failing_keep_alives.store(n, Ordering::SeqCst);
    }

    /// 调用统计快照
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            gets: self.counters.gets.load(Ordering::SeqCst),
            grants: self.counters.grants.load(Ordering::SeqCst),
            keep_alives: self.counters.keep_alives.load(Ordering::SeqCst),
            puts: self.counters.puts.load(Ordering::SeqCst),
            revokes: self.counters.revokes.load(Ordering::SeqCst),
        }
    }

    /// 直接写入原始字节（不绑定租约），用于注入损坏记录
    pub async fn insert_raw(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        let mut state = self.state.lock().await;
        let key = key.into();
        let value = value.into();
        let prev = state.entries.insert(
            key.clone(),
            Entry {
                value: value.clone(),
                lease: None,
            },
        );
        state.notify(StoreEvent {
            kind: StoreEventKind::Put,
            key,
            value,
            prev_value: prev.map(|e| e.value),
        });
    }

    /// 删除单个 key，返回是否存在
    pub async fn delete(&self, key: &str) -> bool {
        self.state.lock().await.delete_key(key)
    }

    /// 立即让租约过期
    pub async fn expire_lease(&self, lease: LeaseId) -> bool {
        self.state.lock().await.drop_lease(lease)
    }

    /// 清理所有到期租约
    pub async fn reap(&self) {
        self.state.lock().await.expire_due(Instant::now());
    }

    /// 查询 key 当前绑定的租约
    pub async fn lease_of(&self, key: &str) -> Option<LeaseId> {
        let mut state = self.state.lock().await;
        state.expire_due(Instant::now());
        state.entries.get(key).and_then(|e| e.lease)
    }

    /// 当前存活的租约数量
    pub async fn lease_count(&self) -> usize {
        let mut state = self.state.lock().await;
        state.expire_due(Instant::now());
        state.leases.len()
    }

    /// 关闭所有打开的 watch 流
    pub async fn close_watches(&self) {
        self.state.lock().await.watchers.clear();
    }

    /// 在租约截止时间清理到期租约
    fn schedule_expiry(&self, deadline: Instant) {
        let state: Weak<Mutex<MemoryState>> = Arc::downgrade(&self.state);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(state) = state.upgrade() {
                state.lock().await.expire_due(Instant::now());
            }
        });
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.faults.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is unreachable".into()));
        }
        Ok(())
    }

    fn check_keep_alive_faults(&self) -> Result<(), StoreError> {
        if self.faults.reject_keep_alives.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("keep-alive rejected".into()));
        }
        let failing = self.faults.failing_keep_alives.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| n.checked_sub(1),
        );
        if failing.is_ok() {
            return Err(StoreError::Unavailable("keep-alive failed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        self.counters.gets.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let mut state = self.state.lock().await;
        state.expire_due(Instant::now());
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
            })
            .collect())
    }

    async fn grant(&self, ttl: i64) -> Result<LeaseId, StoreError> {
        self.counters.grants.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        if self.faults.reject_grants.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("lease grant rejected".into()));
        }

        let ttl = Duration::from_secs(ttl.max(1) as u64);
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.expire_due(now);
        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            LeaseState {
                ttl,
                deadline: now + ttl,
                keys: BTreeSet::new(),
            },
        );
        drop(state);

        self.schedule_expiry(now + ttl);
        trace!(lease_id = id, ttl = ?ttl, "memory store lease granted");
        Ok(id)
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<LeaseId, StoreError> {
        self.counters.keep_alives.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.check_keep_alive_faults()?;

        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.expire_due(now);
        let deadline = match state.leases.get_mut(&lease) {
            Some(entry) => {
                entry.deadline = now + entry.ttl;
                entry.deadline
            }
            None => return Err(StoreError::LeaseNotFound(lease)),
        };
        drop(state);

        self.schedule_expiry(deadline);
        Ok(lease)
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        self.counters.revokes.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let mut state = self.state.lock().await;
        state.expire_due(Instant::now());
        if state.drop_lease(lease) {
            Ok(())
        } else {
            Err(StoreError::LeaseNotFound(lease))
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<(), StoreError> {
        self.counters.puts.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        if self.faults.reject_puts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("put rejected".into()));
        }

        let mut state = self.state.lock().await;
        state.expire_due(Instant::now());
        if let Some(id) = lease {
            match state.leases.get_mut(&id) {
                Some(entry) => {
                    entry.keys.insert(key.to_string());
                }
                None => return Err(StoreError::LeaseNotFound(id)),
            }
        }

        let prev = state.entries.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                lease,
            },
        );
        if let Some(old_lease) = prev.as_ref().and_then(|e| e.lease) {
            if Some(old_lease) != lease {
                if let Some(entry) = state.leases.get_mut(&old_lease) {
                    entry.keys.remove(key);
                }
            }
        }
        state.notify(StoreEvent {
            kind: StoreEventKind::Put,
            key: key.to_string(),
            value,
            prev_value: prev.map(|e| e.value),
        });
        drop(state);

        let delay = self.faults.put_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<StoreEventStream, StoreError> {
        self.check_available()?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().await.watchers.push(WatchSubscriber {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(Box::pin(
            UnboundedReceiverStream::new(rx).map(Ok::<StoreEvent, StoreError>),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn lease_expiry_deletes_bound_keys() {
        let store = MemoryStore::new();
        let lease = store.grant(30).await.unwrap();
        store.put("/flare/a/rpc/1", b"{}".to_vec(), Some(lease)).await.unwrap();
        assert_eq!(store.get_prefix("/flare/a/").await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.get_prefix("/flare/a/").await.unwrap().is_empty());
        assert!(matches!(
            store.keep_alive_once(lease).await,
            Err(StoreError::LeaseNotFound(id)) if id == lease
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_extends_deadline() {
        let store = MemoryStore::new();
        let lease = store.grant(30).await.unwrap();
        store.put("/k", b"v".to_vec(), Some(lease)).await.unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(store.keep_alive_once(lease).await.unwrap(), lease);
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(store.get_prefix("/k").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn revoke_emits_delete_with_previous_value() {
        let store = MemoryStore::new();
        let mut events = store.watch_prefix("/svc/").await.unwrap();
        let lease = store.grant(30).await.unwrap();
        store.put("/svc/1", b"node".to_vec(), Some(lease)).await.unwrap();
        store.revoke(lease).await.unwrap();

        let put = events.next().await.unwrap().unwrap();
        assert_eq!(put.kind, StoreEventKind::Put);
        let delete = events.next().await.unwrap().unwrap();
        assert_eq!(delete.kind, StoreEventKind::Delete);
        assert_eq!(delete.prev_value.as_deref(), Some(&b"node"[..]));
    }

    #[tokio::test(start_paused = true)]
    async fn lease_expiry_notifies_watchers_on_its_own() {
        let store = MemoryStore::new();
        let mut events = store.watch_prefix("/svc/").await.unwrap();
        let lease = store.grant(30).await.unwrap();
        store.put("/svc/1", b"node".to_vec(), Some(lease)).await.unwrap();
        assert_eq!(events.next().await.unwrap().unwrap().kind, StoreEventKind::Put);

        let delete = tokio::time::timeout(Duration::from_secs(60), events.next())
            .await
            .expect("expiry should emit a delete without further store calls")
            .unwrap()
            .unwrap();
        assert_eq!(delete.kind, StoreEventKind::Delete);
        assert_eq!(delete.prev_value.as_deref(), Some(&b"node"[..]));
        assert_eq!(store.stats().gets, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn renewed_lease_outlives_its_first_deadline() {
        let store = MemoryStore::new();
        let mut events = store.watch_prefix("/svc/").await.unwrap();
        let lease = store.grant(30).await.unwrap();
        store.put("/svc/1", b"node".to_vec(), Some(lease)).await.unwrap();
        events.next().await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_secs(20)).await;
        store.keep_alive_once(lease).await.unwrap();
        // 第一次截止时间（30s）过后仍然存活，新的截止时间（50s）到期后删除
        assert!(
            tokio::time::timeout(Duration::from_secs(25), events.next())
                .await
                .is_err()
        );
        let delete = events.next().await.unwrap().unwrap();
        assert_eq!(delete.kind, StoreEventKind::Delete);
    }

    #[tokio::test]
    async fn put_with_unknown_lease_fails() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.put("/k", Vec::new(), Some(99)).await,
            Err(StoreError::LeaseNotFound(99))
        ));
    }

    #[tokio::test]
    async fn failing_keep_alives_are_counted_down() {
        let store = MemoryStore::new();
        let lease = store.grant(30).await.unwrap();
        store.fail_next_keep_alives(2);
        assert!(store.keep_alive_once(lease).await.is_err());
        assert!(store.keep_alive_once(lease).await.is_err());
        assert!(store.keep_alive_once(lease).await.is_ok());
        assert_eq!(store.stats().keep_alives, 3);
    }

    #[tokio::test]
    async fn unavailable_store_rejects_everything() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(store.get_prefix("/").await.is_err());
        assert!(store.grant(10).await.is_err());
        assert!(store.watch_prefix("/").await.is_err());
        store.set_unavailable(false);
        assert!(store.get_prefix("/").await.unwrap().is_empty());
    }
}
