//! etcd 存储后端

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions};
use futures::stream;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{KeyValue, LeaseId, Store, StoreEvent, StoreEventKind, StoreEventStream};
use crate::error::{InfraResult, StoreError};

/// etcd 存储
///
/// `Client` 内部基于 tonic channel，克隆开销很小，每次调用克隆一份以获得 `&mut`
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// 连接 etcd 集群
    pub async fn connect(endpoints: &[String], dial_timeout: Duration) -> InfraResult<Self> {
        use anyhow::Context;

        let options = ConnectOptions::new().with_connect_timeout(dial_timeout);
        let client = Client::connect(endpoints, Some(options))
            .await
            .with_context(|| format!("failed to connect to etcd at {:?}", endpoints))?;

        info!(endpoints = ?endpoints, "Connected to etcd");
        Ok(Self { client })
    }

    /// 使用已有客户端创建
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Store for EtcdStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        Ok(resp
            .kvs()
            .iter()
            .map(|kv| KeyValue {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
            })
            .collect())
    }

    async fn grant(&self, ttl: i64) -> Result<LeaseId, StoreError> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl, None).await?;
        Ok(resp.id())
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<LeaseId, StoreError> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client.lease_keep_alive(lease).await?;
        keeper.keep_alive().await?;

        match stream.message().await? {
            // etcd 对不存在的租约返回 TTL <= 0 而不是错误
            Some(resp) if resp.ttl() > 0 => Ok(resp.id()),
            Some(_) => Err(StoreError::LeaseNotFound(lease)),
            None => Err(StoreError::Unavailable(
                "lease keep-alive stream closed".into(),
            )),
        }
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client.lease_revoke(lease).await?;
        Ok(())
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        client.put(key, value, options).await?;
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<StoreEventStream, StoreError> {
        let mut client = self.client.clone();
        let options = WatchOptions::new().with_prefix().with_prev_key();
        let (watcher, watch_stream) = client.watch(prefix, Some(options)).await?;
        debug!(prefix = %prefix, watch_id = watcher.watch_id(), "etcd watch established");

        // watcher 与流一起保存在状态里，流结束前不会被释放
        let state = (watcher, watch_stream, VecDeque::<StoreEvent>::new(), false);
        let events = stream::unfold(state, |(watcher, mut watch_stream, mut pending, done)| async move {
            loop {
                if let Some(event) = pending.pop_front() {
                    return Some((Ok(event), (watcher, watch_stream, pending, done)));
                }
                if done {
                    return None;
                }
                match watch_stream.message().await {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            warn!(reason = %resp.cancel_reason(), "etcd watch canceled");
                            let err = StoreError::WatchClosed(resp.cancel_reason().to_string());
                            return Some((Err(err), (watcher, watch_stream, pending, true)));
                        }
                        for event in resp.events() {
                            let Some(kv) = event.kv() else { continue };
                            let kind = match event.event_type() {
                                EventType::Put => StoreEventKind::Put,
                                EventType::Delete => StoreEventKind::Delete,
                            };
                            pending.push_back(StoreEvent {
                                kind,
                                key: String::from_utf8_lossy(kv.key()).into_owned(),
                                value: kv.value().to_vec(),
                                prev_value: event.prev_kv().map(|prev| prev.value().to_vec()),
                            });
                        }
                    }
                    Ok(None) => return None,
                    Err(e) => {
                        return Some((Err(e.into()), (watcher, watch_stream, pending, true)));
                    }
                }
            }
        });

        Ok(Box::pin(events))
    }
}
