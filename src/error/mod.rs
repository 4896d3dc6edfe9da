//! Flare Discovery 错误处理模块
//!
//! 提供统一的错误类型、错误代码分类以及基础设施错误转换

pub mod code;
pub mod discovery_error;

// 重新导出公共类型
pub use code::{ErrorCategory, ErrorCode};
pub use discovery_error::{DiscoveryError, Result, StoreError};

/// 基础设施层默认使用的结果类型
pub type InfraResult<T> = anyhow::Result<T>;

/// 将基础设施错误转换为 `DiscoveryError`
pub fn map_infra_error<E, S>(error: E, code: ErrorCode, message: S) -> DiscoveryError
where
    E: std::fmt::Display,
    S: Into<String>,
{
    let message = format!("{}: {}", message.into(), error);
    match code {
        ErrorCode::StoreUnavailable | ErrorCode::StoreTimeout => {
            DiscoveryError::Store(StoreError::Unavailable(message))
        }
        ErrorCode::InvalidNode => DiscoveryError::InvalidNode(message),
        _ => DiscoveryError::Config(message),
    }
}

/// `InfraResult` 的辅助扩展，用于快速转换为统一的服务发现错误类型
pub trait InfraResultExt<T> {
    fn into_discovery<S>(self, code: ErrorCode, message: S) -> Result<T>
    where
        S: Into<String>;
}

impl<T> InfraResultExt<T> for InfraResult<T> {
    fn into_discovery<S>(self, code: ErrorCode, message: S) -> Result<T>
    where
        S: Into<String>,
    {
        // `{:#}` 保留 anyhow 的上下文链
        self.map_err(|err| map_infra_error(format!("{:#}", err), code, message))
    }
}
