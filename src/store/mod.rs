//! 协调存储抽象
//!
//! 服务发现只依赖这里定义的窄接口：前缀读取、租约授予/续约/撤销、
//! 绑定租约的写入以及前缀 watch。

#[cfg(feature = "etcd")]
pub mod etcd;
pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::StoreError;

#[cfg(feature = "etcd")]
pub use etcd::EtcdStore;
pub use memory::{MemoryStore, StoreStats};

/// 租约 ID
pub type LeaseId = i64;

/// 存储中的一条记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventKind {
    Put,
    Delete,
}

/// 前缀 watch 产生的单条变更
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: StoreEventKind,
    pub key: String,
    /// 新值（Delete 时为空）
    pub value: Vec<u8>,
    /// 变更前的值，要求 watch 打开“删除时携带旧值”
    pub prev_value: Option<Vec<u8>>,
}

/// watch 事件流，按存储产生的顺序逐条输出
pub type StoreEventStream = BoxStream<'static, Result<StoreEvent, StoreError>>;

/// 协调存储 trait
///
/// 所有方法都是单次往返，超时由调用方（服务发现层）控制
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// 前缀扫描
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError>;

    /// 授予租约，`ttl` 单位为秒
    async fn grant(&self, ttl: i64) -> Result<LeaseId, StoreError>;

    /// 单次续约，返回（可能轮换后的）租约 ID
    ///
    /// 租约已过期时返回 [`StoreError::LeaseNotFound`]
    async fn keep_alive_once(&self, lease: LeaseId) -> Result<LeaseId, StoreError>;

    /// 撤销租约，绑定的 key 会被立即删除
    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError>;

    /// 写入记录，可选绑定租约；同 key 的旧记录被覆盖
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<(), StoreError>;

    /// 打开前缀 watch，删除事件必须携带旧值
    async fn watch_prefix(&self, prefix: &str) -> Result<StoreEventStream, StoreError>;
}
