//! Flare Discovery Library
//!
//! Pluggable service discovery client: lease based registration with a self-healing
//! keep-alive loop, prefix lookups and typed watch streams over etcd, plus a static
//! table backend sharing the same contract.

pub mod config;
pub mod error;
pub mod logging;

// 服务发现
pub mod discovery;

// 协调存储
pub mod store;

// Re-exports
pub use config::{
    BackendType, Config, DiscoveryConfig, LogConfig, LogFormat, LogOutput, StaticNodeConfig,
    StaticServiceConfig,
};
pub use error::{
    DiscoveryError, ErrorCategory, ErrorCode, InfraResult, InfraResultExt, Result, StoreError,
};
pub use logging::init_logging;

pub use discovery::{
    CancelRegistry, Discovery, DiscoveryFactory, EventKind, KeepAliveOutcome, KeepAliveReport,
    KeyCodec, LeaseHandle, Node, NodeEvent, NodeScan, NodeType, NodeWatcher, Registration,
    StaticDiscovery, StoreDiscovery, StoreDiscoveryOptions, WatchStats,
};

#[cfg(feature = "etcd")]
pub use store::EtcdStore;
pub use store::{LeaseId, MemoryStore, Store, StoreStats};
