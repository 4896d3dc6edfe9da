//! 节点注册器
//!
//! 注册节点、在后台持续续约，关闭时注销。

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::backend::Discovery;
use super::lease::{KeepAliveReport, LeaseHandle};
use super::node::Node;
use crate::error::{DiscoveryError, Result};

/// 节点注册器
///
/// 应该在服务关闭前显式调用 [`shutdown`](Self::shutdown)。直接丢弃时由后台任务
/// 尽力注销，丢弃发生在运行时关闭期间则只能等租约过期。
pub struct Registration {
    discovery: Arc<dyn Discovery>,
    node: Node,
    lease: LeaseHandle,
    stop: CancellationToken,
    task: Option<JoinHandle<Result<KeepAliveReport>>>,
}

impl Registration {
    /// 注册节点并启动续约任务
    pub async fn start(discovery: Arc<dyn Discovery>, node: Node) -> Result<Self> {
        let lease = discovery.register(&node).await?;
        let stop = CancellationToken::new();

        let task = {
            let discovery = discovery.clone();
            let node = node.clone();
            let lease = lease.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                let keep_alive = discovery.keep_alive(&node, &lease);
                tokio::pin!(keep_alive);
                tokio::select! {
                    biased;
                    result = &mut keep_alive => return result,
                    _ = stop.cancelled() => {}
                }
                // 续约循环可能在注销之后才登记，再注销一次取消它，然后等它自行退出
                let cleanup = discovery.deregister(&node, &lease).await;
                let report = keep_alive.await;
                cleanup.and(report)
            })
        };

        info!(
            node_id = %node.id,
            name = %node.name,
            node_type = %node.node_type,
            lease_id = ?lease.id(),
            "✅ Node registration started"
        );

        Ok(Self {
            discovery,
            node,
            lease,
            stop,
            task: Some(task),
        })
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// 当前租约句柄
    pub fn lease(&self) -> &LeaseHandle {
        &self.lease
    }

    /// 续约任务是否仍在运行
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// 优雅关闭：注销节点并等待续约任务结束
    ///
    /// 注销失败时租约留在句柄中，可以再次调用重试。
    pub async fn shutdown(&mut self) -> Result<KeepAliveReport> {
        if let Err(e) = self.discovery.deregister(&self.node, &self.lease).await {
            warn!(node_id = %self.node.id, error = %e, "⚠️ Failed to deregister node");
            return Err(e);
        }
        self.stop.cancel();

        let Some(task) = self.task.take() else {
            return Ok(KeepAliveReport::default());
        };
        let report = task
            .await
            .map_err(|e| DiscoveryError::Internal(format!("keep-alive task failed: {}", e)))??;

        info!(
            node_id = %self.node.id,
            ticks = report.ticks,
            recovered = report.recovered,
            failed = report.failed,
            "🛑 Node registration stopped"
        );
        Ok(report)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        // 没有调用 shutdown：后台任务负责注销并释放续约登记
        if self.task.take().is_some() {
            warn!(
                node_id = %self.node.id,
                "⚠️ Registration dropped without shutdown, deregistering in background"
            );
            self.stop.cancel();
        }
    }
}
