//! 服务发现统一错误类型

use super::code::ErrorCode;
use crate::store::LeaseId;
use std::time::Duration;
use thiserror::Error;

/// 存储层错误
///
/// 由 [`Store`](crate::store::Store) 实现返回，服务发现层原样向上透传
#[derive(Error, Debug)]
pub enum StoreError {
    /// 存储不可达（网络错误、节点宕机、故障注入等）
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// 租约不存在或已过期
    #[error("lease {0} not found or expired")]
    LeaseNotFound(LeaseId),

    /// watch 流被服务端取消或中断
    #[error("watch closed: {0}")]
    WatchClosed(String),

    /// etcd 客户端错误
    #[cfg(feature = "etcd")]
    #[error(transparent)]
    Etcd(#[from] etcd_client::Error),
}

impl StoreError {
    /// 获取错误代码
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::Unavailable(_) => ErrorCode::StoreUnavailable,
            StoreError::LeaseNotFound(_) => ErrorCode::LeaseExpired,
            StoreError::WatchClosed(_) => ErrorCode::WatchClosed,
            #[cfg(feature = "etcd")]
            StoreError::Etcd(_) => ErrorCode::StoreUnavailable,
        }
    }
}

/// 服务发现错误
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// 存储错误（原样透传）
    #[error(transparent)]
    Store(#[from] StoreError),

    /// 存储往返超时
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// 续约时节点上没有租约（未注册或已注销）
    #[error("lease id not found for node {node_id}")]
    LeaseNotFound { node_id: String },

    /// 节点字段不合法
    #[error("invalid node: {0}")]
    InvalidNode(String),

    /// 节点序列化失败
    #[error("failed to encode node {node_id}: {source}")]
    Encode {
        node_id: String,
        #[source]
        source: serde_json::Error,
    },

    /// 后端不支持该操作
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),

    /// 配置错误
    #[error("configuration error: {0}")]
    Config(String),

    /// 后台任务异常退出
    #[error("internal error: {0}")]
    Internal(String),
}

impl DiscoveryError {
    /// 创建超时错误
    pub fn timeout(operation: &'static str, timeout: Duration) -> Self {
        DiscoveryError::Timeout { operation, timeout }
    }

    /// 创建配置错误
    pub fn config(msg: impl Into<String>) -> Self {
        DiscoveryError::Config(msg.into())
    }

    /// 创建节点校验错误
    pub fn invalid_node(msg: impl Into<String>) -> Self {
        DiscoveryError::InvalidNode(msg.into())
    }

    /// 获取错误代码
    pub fn code(&self) -> ErrorCode {
        match self {
            DiscoveryError::Store(err) => err.code(),
            DiscoveryError::Timeout { .. } => ErrorCode::StoreTimeout,
            DiscoveryError::LeaseNotFound { .. } => ErrorCode::LeaseNotFound,
            DiscoveryError::InvalidNode(_) => ErrorCode::InvalidNode,
            DiscoveryError::Encode { .. } => ErrorCode::SerializationError,
            DiscoveryError::Unsupported(_) => ErrorCode::OperationNotSupported,
            DiscoveryError::Config(_) => ErrorCode::ConfigurationError,
            DiscoveryError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, DiscoveryError>;
