//! 错误代码和错误类别定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// 错误代码枚举
///
/// 错误代码按类别分组，每个类别占用1000个代码范围：
/// - 1000-1999: 存储连接相关错误
/// - 2000-2999: 租约相关错误
/// - 3000-3999: 注册相关错误
/// - 6000-6999: 系统相关错误
/// - 8000-8999: 序列化相关错误
/// - 9000-9999: 通用错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ErrorCode {
    // ============================================================
    // 存储连接相关错误 (1000-1999)
    // ============================================================
    StoreUnavailable = 1000,
    StoreTimeout = 1001,
    WatchClosed = 1002,

    // ============================================================
    // 租约相关错误 (2000-2999)
    // ============================================================
    LeaseNotFound = 2000,
    LeaseExpired = 2001,

    // ============================================================
    // 注册相关错误 (3000-3999)
    // ============================================================
    InvalidNode = 3000,

    // ============================================================
    // 系统相关错误 (6000-6999)
    // ============================================================
    ConfigurationError = 6000,
    InternalError = 6001,

    // ============================================================
    // 序列化相关错误 (8000-8999)
    // ============================================================
    SerializationError = 8000,

    // ============================================================
    // 通用错误 (9000-9999)
    // ============================================================
    OperationNotSupported = 9002,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ErrorCode {
    /// 获取错误代码的数字值
    #[inline]
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// 从数字值创建错误代码
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            1000 => Some(ErrorCode::StoreUnavailable),
            1001 => Some(ErrorCode::StoreTimeout),
            1002 => Some(ErrorCode::WatchClosed),
            2000 => Some(ErrorCode::LeaseNotFound),
            2001 => Some(ErrorCode::LeaseExpired),
            3000 => Some(ErrorCode::InvalidNode),
            6000 => Some(ErrorCode::ConfigurationError),
            6001 => Some(ErrorCode::InternalError),
            8000 => Some(ErrorCode::SerializationError),
            9002 => Some(ErrorCode::OperationNotSupported),
            _ => None,
        }
    }

    /// 获取错误代码的英文标识符
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::StoreUnavailable => "STORE_UNAVAILABLE",
            ErrorCode::StoreTimeout => "STORE_TIMEOUT",
            ErrorCode::WatchClosed => "WATCH_CLOSED",
            ErrorCode::LeaseNotFound => "LEASE_NOT_FOUND",
            ErrorCode::LeaseExpired => "LEASE_EXPIRED",
            ErrorCode::InvalidNode => "INVALID_NODE",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::SerializationError => "SERIALIZATION_ERROR",
            ErrorCode::OperationNotSupported => "OPERATION_NOT_SUPPORTED",
        }
    }

    /// 获取错误代码的类别
    pub fn category(&self) -> ErrorCategory {
        match self.as_u32() {
            1000..=1999 => ErrorCategory::Connection,
            2000..=2999 => ErrorCategory::Lease,
            3000..=3999 => ErrorCategory::Registration,
            6000..=6999 => ErrorCategory::System,
            8000..=8999 => ErrorCategory::Serialization,
            _ => ErrorCategory::General,
        }
    }

    /// 判断是否为可重试的错误
    ///
    /// 存储不可用、超时以及租约失效都可以通过重新注册恢复
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::StoreUnavailable
                | ErrorCode::StoreTimeout
                | ErrorCode::WatchClosed
                | ErrorCode::LeaseExpired
        )
    }
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Connection,
    Lease,
    Registration,
    System,
    Serialization,
    General,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Connection => write!(f, "CONNECTION"),
            ErrorCategory::Lease => write!(f, "LEASE"),
            ErrorCategory::Registration => write!(f, "REGISTRATION"),
            ErrorCategory::System => write!(f, "SYSTEM"),
            ErrorCategory::Serialization => write!(f, "SERIALIZATION"),
            ErrorCategory::General => write!(f, "GENERAL"),
        }
    }
}
