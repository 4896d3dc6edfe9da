//! 节点路径编码
//!
//! 路径格式：
//! - 有标签：`/{namespace}/{name}/{tag}/{type}`
//! - 无标签：`/{namespace}/{name}/{type}`
//!
//! 节点 key 为路径加 `/{id}`。

use super::node::{Node, NodeType};

/// 路径编解码器
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCodec {
    namespace: String,
}

impl KeyCodec {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// (name, type, tag) 对应的路径前缀
    pub fn path_of(&self, name: &str, node_type: NodeType, tag: Option<&str>) -> String {
        match tag.filter(|t| !t.is_empty()) {
            Some(tag) => format!("/{}/{}/{}/{}", self.namespace, name, tag, node_type),
            None => format!("/{}/{}/{}", self.namespace, name, node_type),
        }
    }

    /// 节点的完整 key
    pub fn key_of(&self, node: &Node) -> String {
        format!(
            "{}/{}",
            self.path_of(&node.name, node.node_type, node.tag_opt()),
            node.id
        )
    }

    /// 扫描与 watch 使用的前缀（带结尾的 `/`）
    pub fn scan_prefix(&self, name: &str, node_type: NodeType, tag: Option<&str>) -> String {
        format!("{}/", self.path_of(name, node_type, tag))
    }

    /// key 是否是前缀的直接子节点
    ///
    /// 标签层缺省时，`/ns/orders/rpc/` 也会字符串匹配到标签恰好叫 `rpc` 的
    /// 节点（`/ns/orders/rpc/http/{id}`），所以要求剩余部分不含 `/`。
    pub fn owns(scan_prefix: &str, key: &str) -> bool {
        key.strip_prefix(scan_prefix)
            .is_some_and(|id| !id.is_empty() && !id.contains('/'))
    }
}

impl Default for KeyCodec {
    fn default() -> Self {
        Self::new("flare")
    }
}
