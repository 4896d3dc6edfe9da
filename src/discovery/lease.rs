//! 租约句柄与续约任务管理

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::store::LeaseId;

/// etcd 不会分配 0 号租约（0 即 NoLease）
const NO_LEASE: LeaseId = 0;

/// 租约句柄
///
/// 由 `register` 返回并显式传给 `keep_alive` / `deregister`。克隆共享同一个
/// 租约槽位：续约任务写入轮换后的租约 ID，注销任务从另一个任务读取并清空它。
#[derive(Debug, Clone, Default)]
pub struct LeaseHandle {
    id: Arc<AtomicI64>,
}

impl LeaseHandle {
    /// 创建一个尚未绑定租约的句柄
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前租约 ID
    pub fn id(&self) -> Option<LeaseId> {
        match self.id.load(Ordering::Acquire) {
            NO_LEASE => None,
            id => Some(id),
        }
    }

    /// 是否持有租约
    pub fn is_active(&self) -> bool {
        self.id().is_some()
    }

    pub(crate) fn set(&self, id: LeaseId) {
        self.id.store(id, Ordering::Release);
    }

    pub(crate) fn take(&self) -> Option<LeaseId> {
        match self.id.swap(NO_LEASE, Ordering::AcqRel) {
            NO_LEASE => None,
            id => Some(id),
        }
    }

    /// 仅在句柄为空时放回租约
    pub(crate) fn restore(&self, id: LeaseId) -> bool {
        self.replace(NO_LEASE, id)
    }

    /// 仅在句柄仍持有 `id` 时清空
    pub(crate) fn clear(&self, id: LeaseId) -> bool {
        self.replace(id, NO_LEASE)
    }

    /// 句柄当前值为 `current` 时替换为 `new`
    pub(crate) fn replace(&self, current: LeaseId, new: LeaseId) -> bool {
        self.id
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// 续约任务在注册表中的凭证
#[derive(Debug, Clone)]
pub struct CancelTicket {
    generation: u64,
    token: CancellationToken,
}

impl CancelTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// 节点 ID -> 续约任务取消句柄
///
/// 每个后端实例持有一份，`deregister` 通过节点 ID 找到并取消对应的续约任务。
#[derive(Debug, Default)]
pub struct CancelRegistry {
    entries: RwLock<HashMap<String, CancelTicket>>,
    generation: AtomicU64,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为节点登记新的续约任务
    ///
    /// 同一节点已有的登记被覆盖，旧任务随之取消，保证同一节点的续约串行。
    pub async fn register(&self, node_id: &str) -> CancelTicket {
        let ticket = CancelTicket {
            generation: self.generation.fetch_add(1, Ordering::Relaxed) + 1,
            token: CancellationToken::new(),
        };
        let previous = self
            .entries
            .write()
            .await
            .insert(node_id.to_string(), ticket.clone());
        if let Some(previous) = previous {
            debug!(
                node_id = %node_id,
                generation = previous.generation,
                "Superseding previous keep-alive task"
            );
            previous.token.cancel();
        }
        ticket
    }

    /// 取消并移除节点的续约任务，返回是否存在
    pub async fn cancel(&self, node_id: &str) -> bool {
        match self.entries.write().await.remove(node_id) {
            Some(ticket) => {
                ticket.token.cancel();
                true
            }
            None => false,
        }
    }

    /// 任务退出时移除自己的登记；登记已被新任务覆盖时不做任何事
    pub async fn release(&self, node_id: &str, ticket: &CancelTicket) {
        let mut entries = self.entries.write().await;
        if entries
            .get(node_id)
            .is_some_and(|current| current.generation == ticket.generation)
        {
            entries.remove(node_id);
        }
    }

    pub async fn contains(&self, node_id: &str) -> bool {
        self.entries.read().await.contains_key(node_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// 单次续约的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveOutcome {
    /// 续约成功
    Renewed,
    /// 续约失败，重新注册成功
    Recovered,
    /// 续约与重新注册都失败，等待下一次
    Failed,
}

/// 续约任务的累计统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepAliveReport {
    pub ticks: u64,
    pub renewed: u64,
    pub recovered: u64,
    pub failed: u64,
}

impl KeepAliveReport {
    pub fn record(&mut self, outcome: KeepAliveOutcome) {
        self.ticks += 1;
        match outcome {
            KeepAliveOutcome::Renewed => self.renewed += 1,
            KeepAliveOutcome::Recovered => self.recovered += 1,
            KeepAliveOutcome::Failed => self.failed += 1,
        }
    }
}
