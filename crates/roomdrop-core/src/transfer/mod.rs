//! 分块传输协议
//!
//! 在已建立的直连通道上传输一个命名的二进制负载:
//! - `file-meta` 描述负载（压缩后大小、MIME 类型、是否压缩）
//! - 若干不超过 [`CHUNK_SIZE`] 的二进制块，按发送顺序交付
//! - `file-end` 结束当前传输
//!
//! 接收端在 [`RECEIVE_TIMEOUT`] 内收不到下一块或结束帧即判定超时。

pub mod compression;
pub mod receiver;
pub mod sender;

pub use compression::{CompressionError, compress, decompress, should_compress};
pub use receiver::{ReceivedFile, ReceiverEvent, TransferReceiver};
pub use sender::{FrameSink, PreparedPayload, chunk_ranges, percent, send_payload};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 单块最大字节数 (64 KiB)
pub const CHUNK_SIZE: usize = 64 * 1024;

/// 接收超时，每收到 `file-meta` 或数据块时刷新
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// 传输描述符（`file-meta` 载荷）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferDescriptor {
    pub name: String,
    /// 压缩后的字节数
    pub size: u64,
    pub mime_type: String,
    pub is_compressed: bool,
}

/// 传输参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSettings {
    pub chunk_size: usize,
    pub receive_timeout: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            receive_timeout: RECEIVE_TIMEOUT,
        }
    }
}
