//! 静态服务发现后端
//!
//! 节点列表在构造时固定，没有注册与租约的概念，适合本地开发或固定拓扑。

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;

use super::Discovery;
use crate::config::StaticServiceConfig;
use crate::discovery::lease::{KeepAliveReport, LeaseHandle};
use crate::discovery::node::{Node, NodeEvent, NodeType};
use crate::discovery::watcher::NodeWatcher;
use crate::error::{DiscoveryError, Result};

const DEFAULT_WATCH_BUFFER: usize = 1;

/// 静态服务发现
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    services: HashMap<(String, NodeType), Vec<Node>>,
}

impl StaticDiscovery {
    pub fn new(services: HashMap<(String, NodeType), Vec<Node>>) -> Self {
        Self { services }
    }

    /// 从配置中的服务表构建
    ///
    /// 同一 (name, type) 出现多次时节点列表合并
    pub fn from_config(services: &[StaticServiceConfig]) -> Result<Self> {
        let mut table: HashMap<(String, NodeType), Vec<Node>> = HashMap::new();
        for service in services {
            let nodes = table
                .entry((service.name.clone(), service.node_type))
                .or_default();
            for entry in &service.nodes {
                let node = entry.to_node(&service.name, service.node_type);
                node.validate()?;
                nodes.push(node);
            }
        }

        debug!(services = table.len(), "Static discovery table loaded");
        Ok(Self::new(table))
    }

    /// 同步查询 (name, type) 下的全部节点，不存在时返回空列表
    pub fn service_node(&self, name: &str, node_type: NodeType) -> Vec<Node> {
        self.services
            .get(&(name.to_string(), node_type))
            .cloned()
            .unwrap_or_default()
    }

    fn matching(&self, name: &str, node_type: NodeType, tag: Option<&str>) -> Vec<Node> {
        let tag = tag.unwrap_or_default();
        self.service_node(name, node_type)
            .into_iter()
            .filter(|node| node.tag == tag)
            .collect()
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn register(&self, _node: &Node) -> Result<LeaseHandle> {
        Err(DiscoveryError::Unsupported("register on static discovery"))
    }

    async fn keep_alive(&self, _node: &Node, _lease: &LeaseHandle) -> Result<KeepAliveReport> {
        Err(DiscoveryError::Unsupported("keep_alive on static discovery"))
    }

    async fn deregister(&self, _node: &Node, _lease: &LeaseHandle) -> Result<()> {
        Err(DiscoveryError::Unsupported("deregister on static discovery"))
    }

    async fn node(&self, name: &str, node_type: NodeType, tag: Option<&str>) -> Result<Vec<Node>> {
        Ok(self.matching(name, node_type, tag))
    }

    /// 先推送一次当前节点，之后保持打开直到订阅被关闭
    async fn watch(&self, name: &str, node_type: NodeType, tag: Option<&str>) -> Result<NodeWatcher> {
        let nodes = self.matching(name, node_type, tag);
        let prefix = format!("static:{}/{}", name, node_type);
        let (watcher, sink) = NodeWatcher::channel(prefix, DEFAULT_WATCH_BUFFER);

        tokio::spawn(async move {
            if !nodes.is_empty() && !sink.send(NodeEvent::add(nodes)).await {
                return;
            }
            sink.token().cancelled().await;
        });
        Ok(watcher)
    }
}
