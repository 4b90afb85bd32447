//! 错误分类
//!
//! 各层使用各自的窄错误类型（[`TransportError`]、[`StorageError`]、
//! [`CompressionError`]、[`ProtocolError`]），在到达编排层时统一转换为
//! [`ShareError`]。只有编排层决定一个错误是终止性的还是触发回退。

use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::storage::StorageError;
use crate::transfer::CompressionError;
use crate::transport::TransportError;

/// 一次分享尝试可能遇到的错误
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShareError {
    /// 中继不可达或协商失败
    #[error("connection error: {0}")]
    Connection(String),
    /// 连接或接收超时
    #[error("timed out: {0}")]
    Timeout(String),
    /// 控制帧格式错误或顺序错误
    #[error("protocol error: {0}")]
    Protocol(String),
    /// 存储网关操作失败
    #[error("storage error: {0}")]
    Storage(String),
    /// 压缩或解压失败
    #[error("compression error: {0}")]
    Compression(String),
    /// 当前状态不允许该操作
    #[error("invalid operation: {0}")]
    InvalidState(String),
}

impl From<TransportError> for ShareError {
    fn from(e: TransportError) -> Self {
        ShareError::Connection(e.to_string())
    }
}

impl From<StorageError> for ShareError {
    fn from(e: StorageError) -> Self {
        ShareError::Storage(e.to_string())
    }
}

impl From<CompressionError> for ShareError {
    fn from(e: CompressionError) -> Self {
        ShareError::Compression(e.to_string())
    }
}

impl From<ProtocolError> for ShareError {
    fn from(e: ProtocolError) -> Self {
        ShareError::Protocol(e.to_string())
    }
}
