//! 服务发现后端抽象和实现

pub mod static_backend;
pub mod store_backend;

use async_trait::async_trait;

use crate::discovery::lease::{KeepAliveReport, LeaseHandle};
use crate::discovery::node::{Node, NodeType};
use crate::discovery::watcher::NodeWatcher;
use crate::error::Result;

pub use static_backend::StaticDiscovery;
pub use store_backend::{NodeScan, StoreDiscovery, StoreDiscoveryOptions};

/// 服务发现后端 trait
///
/// 所有服务发现后端（存储后端、静态表）都需要实现这个 trait
/// 注意：由于需要动态分发（dyn），使用 async-trait
#[async_trait]
pub trait Discovery: Send + Sync {
    /// 注册节点
    ///
    /// 申请租约并写入节点记录，覆盖同一 key 上的旧记录。
    ///
    /// # 返回
    /// 绑定了租约的句柄，续约与注销都需要它
    async fn register(&self, node: &Node) -> Result<LeaseHandle>;

    /// 持续续约，直到被 `deregister` 取消
    ///
    /// 应当在后台任务中运行。单次续约失败不会结束任务，而是尝试重新注册；
    /// 句柄中没有租约时立即返回错误。
    ///
    /// # 返回
    /// 被取消时返回各次续约的统计
    async fn keep_alive(&self, node: &Node, lease: &LeaseHandle) -> Result<KeepAliveReport>;

    /// 注销节点
    ///
    /// 取消续约任务并撤销租约。句柄中没有租约视为已注销，可重复调用。
    async fn deregister(&self, node: &Node, lease: &LeaseHandle) -> Result<()>;

    /// 查询节点
    ///
    /// # 参数
    /// * `name` - 服务名
    /// * `node_type` - 节点类型
    /// * `tag` - 标签（可选）
    ///
    /// # 返回
    /// 当前节点列表，没有节点时返回空列表
    async fn node(&self, name: &str, node_type: NodeType, tag: Option<&str>) -> Result<Vec<Node>>;

    /// 监听节点变化
    ///
    /// 存储后端的订阅只包含调用之后发生的变化，不回放历史；底层 watch
    /// 结束后订阅随之结束，需要重新调用。
    async fn watch(&self, name: &str, node_type: NodeType, tag: Option<&str>) -> Result<NodeWatcher>;
}
