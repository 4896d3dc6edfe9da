//! 服务节点定义

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::DiscoveryError;

/// 节点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// RPC 服务（gRPC 等）
    Rpc,
    /// HTTP 服务
    Http,
    /// 原始 TCP 服务
    Tcp,
    /// WebSocket 服务
    WebSocket,
}

impl NodeType {
    /// 路径中使用的标识
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Rpc => "rpc",
            NodeType::Http => "http",
            NodeType::Tcp => "tcp",
            NodeType::WebSocket => "websocket",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rpc" | "grpc" => Ok(NodeType::Rpc),
            "http" => Ok(NodeType::Http),
            "tcp" => Ok(NodeType::Tcp),
            "websocket" | "ws" => Ok(NodeType::WebSocket),
            _ => Err(format!("Unknown node type: {}", s)),
        }
    }
}

/// 服务节点
///
/// 一个可被发现的服务实例。`id`、`name`、`node_type`、`tag` 创建后不再修改，
/// 租约等运行期状态由 [`LeaseHandle`](super::LeaseHandle) 单独承载。
///
/// 存储中的记录就是该结构的 JSON 序列化，读取时忽略未知字段。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    /// 实例 ID（在 name/type/tag 命名空间内唯一）
    pub id: String,

    /// 逻辑服务名
    pub name: String,

    /// 节点类型
    #[serde(rename = "type")]
    pub node_type: NodeType,

    /// 分区/环境标签，空字符串表示无标签
    #[serde(default)]
    pub tag: String,

    /// 服务地址
    #[serde(default)]
    pub host: String,

    /// 服务端口
    #[serde(default)]
    pub port: u16,

    /// 自定义元数据
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub meta: HashMap<String, String>,
}

impl Node {
    /// 创建节点，实例 ID 自动生成
    pub fn new(name: impl Into<String>, node_type: NodeType) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), name, node_type)
    }

    /// 使用指定实例 ID 创建节点
    pub fn with_id(id: impl Into<String>, name: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            node_type,
            tag: String::new(),
            host: String::new(),
            port: 0,
            meta: HashMap::new(),
        }
    }

    /// 设置标签
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// 设置地址
    pub fn address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// 添加元数据
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// 可选标签
    pub fn tag_opt(&self) -> Option<&str> {
        if self.tag.is_empty() {
            None
        } else {
            Some(&self.tag)
        }
    }

    /// `host:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 注册前校验：id、name 必填，各路径片段不能包含 `/`
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        if self.id.is_empty() {
            return Err(DiscoveryError::invalid_node("node id is empty"));
        }
        if self.name.is_empty() {
            return Err(DiscoveryError::invalid_node(format!(
                "node {} has an empty name",
                self.id
            )));
        }
        for (field, value) in [("id", &self.id), ("name", &self.name), ("tag", &self.tag)] {
            if value.contains('/') {
                return Err(DiscoveryError::invalid_node(format!(
                    "node {} {} must not contain '/': {}",
                    self.id, field, value
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, DiscoveryError> {
        serde_json::to_vec(self).map_err(|source| DiscoveryError::Encode {
            node_id: self.id.clone(),
            source,
        })
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// 节点事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Add,
    Remove,
}

/// 节点变化通知，只由 watch 产生
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEvent {
    pub event: EventKind,
    /// 受影响的节点，不为空
    pub nodes: Vec<Node>,
}

impl NodeEvent {
    pub fn add(nodes: Vec<Node>) -> Self {
        Self {
            event: EventKind::Add,
            nodes,
        }
    }

    pub fn remove(nodes: Vec<Node>) -> Self {
        Self {
            event: EventKind::Remove,
            nodes,
        }
    }
}
