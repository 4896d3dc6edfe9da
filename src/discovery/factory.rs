//! 服务发现工厂
//!
//! 根据配置构建后端

use std::sync::Arc;
use tracing::info;

use crate::config::{BackendType, DiscoveryConfig};
use crate::discovery::backend::{Discovery, StaticDiscovery, StoreDiscovery};
use crate::error::Result;
use crate::store::{MemoryStore, Store};

/// 服务发现工厂
pub struct DiscoveryFactory;

impl DiscoveryFactory {
    /// 从配置创建服务发现后端
    pub async fn create(config: &DiscoveryConfig) -> Result<Arc<dyn Discovery>> {
        config.validate()?;

        match config.backend {
            BackendType::Etcd => Self::create_etcd(config).await,
            BackendType::Static => {
                let discovery = StaticDiscovery::from_config(&config.services)?;
                info!(services = config.services.len(), "Static discovery created");
                Ok(Arc::new(discovery))
            }
            BackendType::Memory => {
                info!(namespace = %config.namespace, "Memory discovery created");
                Ok(Self::from_store(Arc::new(MemoryStore::new()), config))
            }
        }
    }

    /// 使用已有存储创建存储后端
    pub fn from_store(store: Arc<dyn Store>, config: &DiscoveryConfig) -> Arc<dyn Discovery> {
        Arc::new(StoreDiscovery::new(
            store,
            config.codec(),
            config.store_options(),
        ))
    }

    #[cfg(feature = "etcd")]
    async fn create_etcd(config: &DiscoveryConfig) -> Result<Arc<dyn Discovery>> {
        use crate::error::{ErrorCode, InfraResultExt};
        use crate::store::EtcdStore;

        let store = EtcdStore::connect(&config.endpoints, config.dial_timeout())
            .await
            .into_discovery(ErrorCode::StoreUnavailable, "failed to create etcd discovery")?;
        info!(
            endpoints = ?config.endpoints,
            namespace = %config.namespace,
            "Etcd discovery created"
        );
        Ok(Self::from_store(Arc::new(store), config))
    }

    #[cfg(not(feature = "etcd"))]
    async fn create_etcd(_config: &DiscoveryConfig) -> Result<Arc<dyn Discovery>> {
        Err(crate::error::DiscoveryError::config(
            "etcd backend requires the `etcd` feature",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StaticNodeConfig, StaticServiceConfig};
    use crate::discovery::node::{Node, NodeType};
    use std::collections::HashMap;

    #[tokio::test]
    async fn creates_static_backend_from_services() {
        let config = DiscoveryConfig {
            backend: BackendType::Static,
            services: vec![StaticServiceConfig {
                name: "orders".into(),
                node_type: NodeType::Http,
                nodes: vec![StaticNodeConfig {
                    id: "h1".into(),
                    tag: String::new(),
                    host: "127.0.0.1".into(),
                    port: 8080,
                    meta: HashMap::new(),
                }],
            }],
            ..Default::default()
        };

        let discovery = DiscoveryFactory::create(&config).await.unwrap();
        let nodes = discovery.node("orders", NodeType::Http, None).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].endpoint(), "127.0.0.1:8080");
    }

    #[tokio::test]
    async fn memory_backend_round_trips_registration() {
        let config = DiscoveryConfig {
            backend: BackendType::Memory,
            ..Default::default()
        };
        let discovery = DiscoveryFactory::create(&config).await.unwrap();

        let node = Node::with_id("m1", "orders", NodeType::Rpc);
        let lease = discovery.register(&node).await.unwrap();
        assert_eq!(
            discovery.node("orders", NodeType::Rpc, None).await.unwrap(),
            vec![node.clone()]
        );

        discovery.deregister(&node, &lease).await.unwrap();
        assert!(discovery.node("orders", NodeType::Rpc, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = DiscoveryConfig {
            ttl: 1,
            ..Default::default()
        };
        assert!(DiscoveryFactory::create(&config).await.is_err());
    }
}
