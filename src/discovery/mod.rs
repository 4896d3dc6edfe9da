//! 服务发现模块
//!
//! 节点模型、路径编码、租约与续约、watch 订阅，以及存储后端和静态后端两种实现。

pub mod backend;
pub mod factory;
pub mod lease;
pub mod node;
pub mod path;
pub mod registration;
pub mod watcher;

pub use backend::{Discovery, NodeScan, StaticDiscovery, StoreDiscovery, StoreDiscoveryOptions};
pub use factory::DiscoveryFactory;
pub use lease::{CancelRegistry, CancelTicket, KeepAliveOutcome, KeepAliveReport, LeaseHandle};
pub use node::{EventKind, Node, NodeEvent, NodeType};
pub use path::KeyCodec;
pub use registration::Registration;
pub use watcher::{NodeWatcher, WatchStats};
