//! 配置
//!
//! TOML 文件加载，随后可用环境变量覆盖部分字段：
//! - `DISCOVERY_BACKEND`
//! - `DISCOVERY_ENDPOINTS`（逗号分隔）
//! - `DISCOVERY_NAMESPACE`
//! - `DISCOVERY_TTL_SECONDS`

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::discovery::backend::StoreDiscoveryOptions;
use crate::discovery::node::{Node, NodeType};
use crate::discovery::path::KeyCodec;
use crate::error::{DiscoveryError, InfraResult, Result};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> InfraResult<Self> {
        use anyhow::Context;

        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// 用进程环境变量覆盖
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.discovery
            .apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn validate(&self) -> Result<()> {
        self.discovery.validate()
    }
}

/// 后端类型
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// etcd 集群
    #[default]
    Etcd,
    /// 配置文件中的静态服务表
    Static,
    /// 进程内存储，用于本地开发和测试
    Memory,
}

impl std::str::FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "etcd" => Ok(BackendType::Etcd),
            "static" | "config" => Ok(BackendType::Static),
            "memory" | "mem" => Ok(BackendType::Memory),
            _ => Err(format!("Unknown backend type: {}", s)),
        }
    }
}

/// 服务发现配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// 后端类型：etcd, static, memory
    pub backend: BackendType,

    /// etcd 地址列表
    pub endpoints: Vec<String>,

    /// key 的顶层命名空间
    pub namespace: String,

    /// 租约 TTL（秒）
    pub ttl: u64,

    /// 连接超时（秒）
    pub dial_timeout: u64,

    /// 注册超时（秒）
    pub register_timeout: u64,

    /// 注销超时（秒）
    pub deregister_timeout: u64,

    /// 查询超时（秒）
    pub lookup_timeout: u64,

    /// 单次续约超时（秒），缺省为 TTL/3
    pub keep_alive_timeout: Option<u64>,

    /// watch 订阅缓冲区大小
    pub watch_buffer: usize,

    /// 静态服务表（仅 static 后端使用）
    pub services: Vec<StaticServiceConfig>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::Etcd,
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            namespace: "flare".to_string(),
            ttl: 30,
            dial_timeout: 5,
            register_timeout: 30,
            deregister_timeout: 30,
            lookup_timeout: 10,
            keep_alive_timeout: None,
            watch_buffer: 64,
            services: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    /// 用给定的查找函数覆盖字段，便于测试时不依赖进程环境
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(backend) = lookup("DISCOVERY_BACKEND") {
            self.backend = backend.parse().map_err(DiscoveryError::config)?;
        }
        if let Some(endpoints) = lookup("DISCOVERY_ENDPOINTS") {
            self.endpoints = endpoints
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(namespace) = lookup("DISCOVERY_NAMESPACE") {
            self.namespace = namespace;
        }
        if let Some(ttl) = lookup("DISCOVERY_TTL_SECONDS") {
            self.ttl = ttl.trim().parse().map_err(|e| {
                DiscoveryError::config(format!("invalid DISCOVERY_TTL_SECONDS {:?}: {}", ttl, e))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.ttl < 3 {
            return Err(DiscoveryError::config(format!(
                "ttl must be at least 3 seconds, got {}",
                self.ttl
            )));
        }
        if self.namespace.is_empty() || self.namespace.contains('/') {
            return Err(DiscoveryError::config(format!(
                "namespace must be non-empty and contain no '/': {:?}",
                self.namespace
            )));
        }
        if self.backend == BackendType::Etcd && self.endpoints.is_empty() {
            return Err(DiscoveryError::config("etcd backend requires at least one endpoint"));
        }
        if self.watch_buffer == 0 {
            return Err(DiscoveryError::config("watch_buffer must be greater than 0"));
        }
        Ok(())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout)
    }

    pub fn codec(&self) -> KeyCodec {
        KeyCodec::new(self.namespace.clone())
    }

    /// 存储后端的时间参数
    pub fn store_options(&self) -> StoreDiscoveryOptions {
        StoreDiscoveryOptions {
            ttl: Duration::from_secs(self.ttl),
            register_timeout: Duration::from_secs(self.register_timeout),
            deregister_timeout: Duration::from_secs(self.deregister_timeout),
            lookup_timeout: Duration::from_secs(self.lookup_timeout),
            keep_alive_timeout: self.keep_alive_timeout.map(Duration::from_secs),
            watch_buffer: self.watch_buffer,
        }
    }
}

/// 静态服务表中的一项
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticServiceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub nodes: Vec<StaticNodeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticNodeConfig {
    pub id: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

impl StaticNodeConfig {
    pub fn to_node(&self, name: &str, node_type: NodeType) -> Node {
        let mut node = Node::with_id(self.id.clone(), name, node_type)
            .tag(self.tag.clone())
            .address(self.host.clone(), self.port);
        node.meta = self.meta.clone();
        node
    }
}

/// 日志格式
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// 人类可读
    #[default]
    Pretty,
    /// 结构化 JSON
    Json,
}

/// 日志输出位置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    /// 追加写入文件
    File { path: PathBuf },
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// 默认级别，`RUST_LOG` 优先
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            output: LogOutput::Stdout,
        }
    }
}
