//! 基于协调存储的服务发现
//!
//! 节点记录写在 [`KeyCodec`] 计算出的 key 下并绑定租约；续约循环以 TTL/3 为周期
//! 刷新租约，失败时以新租约重新注册，直到被 `deregister` 取消。

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::Discovery;
use crate::discovery::lease::{CancelRegistry, KeepAliveOutcome, KeepAliveReport, LeaseHandle};
use crate::discovery::node::{Node, NodeType};
use crate::discovery::path::KeyCodec;
use crate::discovery::watcher::{NodeWatcher, spawn_dispatch};
use crate::error::{DiscoveryError, Result, StoreError};
use crate::store::{LeaseId, Store};

/// 存储后端的时间参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDiscoveryOptions {
    /// 租约 TTL
    pub ttl: Duration,
    /// 注册（授予租约 + 写入）超时
    pub register_timeout: Duration,
    /// 注销（撤销租约）超时
    pub deregister_timeout: Duration,
    /// 查询与建立 watch 的超时
    pub lookup_timeout: Duration,
    /// 单次续约超时，缺省为一个续约周期
    pub keep_alive_timeout: Option<Duration>,
    /// watch 订阅的缓冲区大小
    pub watch_buffer: usize,
}

impl Default for StoreDiscoveryOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            register_timeout: Duration::from_secs(30),
            deregister_timeout: Duration::from_secs(30),
            lookup_timeout: Duration::from_secs(10),
            keep_alive_timeout: None,
            watch_buffer: 64,
        }
    }
}

impl StoreDiscoveryOptions {
    /// 续约周期：TTL 的三分之一，租约过期前留出两次重试的余量
    pub fn tick_period(&self) -> Duration {
        (self.ttl / 3).max(Duration::from_millis(1))
    }

    /// 单次续约超时
    pub fn renew_timeout(&self) -> Duration {
        self.keep_alive_timeout.unwrap_or_else(|| self.tick_period())
    }

    fn ttl_secs(&self) -> i64 {
        i64::try_from(self.ttl.as_secs().max(1)).unwrap_or(i64::MAX)
    }
}

/// 一次前缀扫描的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeScan {
    /// 成功解析的节点
    pub nodes: Vec<Node>,
    /// 无法解析而被跳过的记录数
    pub skipped: usize,
}

/// 基于协调存储的服务发现后端
pub struct StoreDiscovery {
    store: Arc<dyn Store>,
    codec: KeyCodec,
    options: StoreDiscoveryOptions,
    registry: Arc<CancelRegistry>,
}

/// 给一次存储往返加上超时
async fn bounded<T, F>(operation: &'static str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(DiscoveryError::from),
        Err(_) => Err(DiscoveryError::timeout(operation, timeout)),
    }
}

impl StoreDiscovery {
    pub fn new(store: Arc<dyn Store>, codec: KeyCodec, options: StoreDiscoveryOptions) -> Self {
        Self {
            store,
            codec,
            options,
            registry: Arc::new(CancelRegistry::new()),
        }
    }

    /// 使用外部注入的续约注册表
    pub fn with_registry(mut self, registry: Arc<CancelRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    pub fn options(&self) -> &StoreDiscoveryOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<CancelRegistry> {
        &self.registry
    }

    /// 注册节点并把租约写入已有句柄
    pub async fn register_with(&self, node: &Node, lease: &LeaseHandle) -> Result<()> {
        let id = self.acquire(node).await?;
        lease.set(id);
        Ok(())
    }

    /// 授予新租约并写入节点记录，不修改任何句柄
    async fn acquire(&self, node: &Node) -> Result<LeaseId> {
        node.validate()?;
        let key = self.codec.key_of(node);
        let value = node.encode()?;
        let ttl = self.options.ttl_secs();

        let mut granted = None;
        let written = bounded("register", self.options.register_timeout, async {
            let lease_id = self.store.grant(ttl).await?;
            granted = Some(lease_id);
            self.store.put(&key, value, Some(lease_id)).await?;
            Ok::<_, StoreError>(lease_id)
        })
        .await;

        let lease_id = match written {
            Ok(lease_id) => lease_id,
            Err(e) => {
                // 租约已授予但记录没写成，撤销它而不是等 TTL 过期
                if let Some(lease_id) = granted {
                    warn!(
                        node_id = %node.id,
                        lease_id,
                        error = %e,
                        "Node write failed, revoking granted lease"
                    );
                    if let Err(revoke_err) = self.revoke(lease_id).await {
                        warn!(lease_id, error = %revoke_err, "Failed to revoke granted lease");
                    }
                }
                return Err(e);
            }
        };

        info!(node_id = %node.id, key = %key, lease_id, "Node registered");
        Ok(lease_id)
    }

    async fn revoke(&self, lease_id: LeaseId) -> Result<()> {
        bounded(
            "deregister",
            self.options.deregister_timeout,
            self.store.revoke(lease_id),
        )
        .await
    }

    /// 前缀扫描，返回解析成功的节点与跳过的记录数
    pub async fn scan(&self, name: &str, node_type: NodeType, tag: Option<&str>) -> Result<NodeScan> {
        let prefix = self.codec.scan_prefix(name, node_type, tag);
        let kvs = bounded(
            "node",
            self.options.lookup_timeout,
            self.store.get_prefix(&prefix),
        )
        .await?;

        let mut scan = NodeScan::default();
        for kv in kvs {
            if !KeyCodec::owns(&prefix, &kv.key) {
                continue;
            }
            match Node::decode(&kv.value) {
                Ok(node) => scan.nodes.push(node),
                Err(e) => {
                    error!(key = %kv.key, error = %e, "Node decode error");
                    scan.skipped += 1;
                }
            }
        }

        debug!(
            prefix = %prefix,
            nodes = scan.nodes.len(),
            skipped = scan.skipped,
            "Node scan finished"
        );
        Ok(scan)
    }

    async fn run_keep_alive(
        &self,
        node: &Node,
        lease: &LeaseHandle,
        token: &CancellationToken,
    ) -> Result<KeepAliveReport> {
        let period = self.options.tick_period();
        let mut ticker = interval_at(Instant::now() + period, period);
        // 续约超时时推迟下一次 tick，而不是补发
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut report = KeepAliveReport::default();

        debug!(period = ?period, "Keep-alive started");
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(?report, "Keep-alive cancelled");
                    return Ok(report);
                }
                _ = ticker.tick() => {}
            }

            let Some(lease_id) = lease.id() else {
                error!("Lease id not found, stopping keep-alive");
                return Err(DiscoveryError::LeaseNotFound {
                    node_id: node.id.clone(),
                });
            };

            let outcome = self.renew(node, lease, lease_id, token).await;
            report.record(outcome);
        }
    }

    /// 一次续约；失败时以新租约重新注册
    async fn renew(
        &self,
        node: &Node,
        lease: &LeaseHandle,
        lease_id: LeaseId,
        token: &CancellationToken,
    ) -> KeepAliveOutcome {
        let renewed = bounded(
            "keep_alive",
            self.options.renew_timeout(),
            self.store.keep_alive_once(lease_id),
        )
        .await;

        let err = match renewed {
            Ok(renewed_id) => {
                if renewed_id != lease_id && lease.replace(lease_id, renewed_id) {
                    debug!(lease_id, renewed_id, "Lease id rotated");
                }
                return KeepAliveOutcome::Renewed;
            }
            Err(e) => e,
        };

        error!(lease_id, error = %err, "Lease keep-alive failed, re-registering");
        let fresh = match self.acquire(node).await {
            Ok(fresh) => fresh,
            Err(e) => {
                error!(error = %e, "Re-registration failed, retrying on next tick");
                return KeepAliveOutcome::Failed;
            }
        };

        lease.set(fresh);
        // 重新注册期间节点已被注销：deregister 可能已经取走旧租约，新租约由这里撤销
        if token.is_cancelled() && lease.clear(fresh) {
            warn!(lease_id = fresh, "Node deregistered during re-registration, revoking fresh lease");
            if let Err(e) = self.revoke(fresh).await {
                warn!(lease_id = fresh, error = %e, "Failed to revoke fresh lease");
            }
            return KeepAliveOutcome::Failed;
        }

        warn!(lease_id = fresh, "Node re-registered under a fresh lease");
        KeepAliveOutcome::Recovered
    }
}

#[async_trait]
impl Discovery for StoreDiscovery {
    async fn register(&self, node: &Node) -> Result<LeaseHandle> {
        let lease = LeaseHandle::new();
        self.register_with(node, &lease).await?;
        Ok(lease)
    }

    async fn keep_alive(&self, node: &Node, lease: &LeaseHandle) -> Result<KeepAliveReport> {
        let ticket = self.registry.register(&node.id).await;
        let span = info_span!("keep_alive", node_id = %node.id);

        let result = self
            .run_keep_alive(node, lease, ticket.token())
            .instrument(span)
            .await;

        self.registry.release(&node.id, &ticket).await;
        result
    }

    async fn deregister(&self, node: &Node, lease: &LeaseHandle) -> Result<()> {
        if self.registry.cancel(&node.id).await {
            debug!(node_id = %node.id, "Keep-alive task cancelled");
        }

        let Some(lease_id) = lease.take() else {
            debug!(node_id = %node.id, "No lease held, node already deregistered");
            return Ok(());
        };

        match self.revoke(lease_id).await {
            Ok(()) => {
                info!(node_id = %node.id, lease_id, "Node deregistered");
                Ok(())
            }
            Err(DiscoveryError::Store(StoreError::LeaseNotFound(_))) => {
                debug!(node_id = %node.id, lease_id, "Lease already expired");
                Ok(())
            }
            Err(e) => {
                lease.restore(lease_id);
                warn!(node_id = %node.id, lease_id, error = %e, "Failed to revoke lease");
                Err(e)
            }
        }
    }

    async fn node(&self, name: &str, node_type: NodeType, tag: Option<&str>) -> Result<Vec<Node>> {
        Ok(self.scan(name, node_type, tag).await?.nodes)
    }

    async fn watch(&self, name: &str, node_type: NodeType, tag: Option<&str>) -> Result<NodeWatcher> {
        let prefix = self.codec.scan_prefix(name, node_type, tag);
        let events = bounded(
            "watch",
            self.options.lookup_timeout,
            self.store.watch_prefix(&prefix),
        )
        .await?;

        let (watcher, sink) = NodeWatcher::channel(prefix.clone(), self.options.watch_buffer);
        info!(prefix = %prefix, "Watch opened");
        spawn_dispatch(events, prefix, sink);
        Ok(watcher)
    }
}
