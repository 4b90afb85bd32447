//! 接收端状态机
//!
//! 同步实现，时间由调用方显式传入，便于在测试中控制。驱动循环见
//! [`crate::share::ShareReceiver`]。

use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};
use std::time::Duration;
use tokio::time::Instant;

use super::TransferDescriptor;
use super::compression::decompress;
use super::sender::percent;
use crate::error::ShareError;
use crate::protocol::ProtocolError;

/// 接收完成的文件（已解压）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub descriptor: TransferDescriptor,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverEvent {
    Started(TransferDescriptor),
    Progress {
        name: String,
        received: u64,
        total: u64,
        percent: u8,
    },
    Completed(ReceivedFile),
    TimedOut {
        name: String,
    },
    Failed {
        name: String,
        error: ShareError,
    },
}

struct ActiveTransfer {
    descriptor: TransferDescriptor,
    chunks: Vec<Bytes>,
    received: u64,
    deadline: Instant,
}

/// 单个传输的接收状态，同一时间最多一个活动描述符
pub struct TransferReceiver {
    timeout: Duration,
    active: Option<ActiveTransfer>,
}

impl TransferReceiver {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            active: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// 当前活动传输的描述符
    pub fn descriptor(&self) -> Option<&TransferDescriptor> {
        self.active.as_ref().map(|a| &a.descriptor)
    }

    pub fn received_bytes(&self) -> u64 {
        self.active.as_ref().map_or(0, |a| a.received)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.active.as_ref().map(|a| a.deadline)
    }

    /// 开始新传输，未完成的旧传输被丢弃
    pub fn on_meta(&mut self, descriptor: TransferDescriptor, now: Instant) -> ReceiverEvent {
        if let Some(previous) = self.active.take() {
            warn!(
                "Discarding unfinished transfer {} ({} of {} bytes) superseded by {}",
                previous.descriptor.name,
                previous.received,
                previous.descriptor.size,
                descriptor.name
            );
        }

        info!(
            "Receiving {} ({} bytes, compressed={})",
            descriptor.name, descriptor.size, descriptor.is_compressed
        );
        // 空文件在 meta 到达时就已收满
        let deadline = if descriptor.size == 0 {
            now + self.timeout / 2
        } else {
            now + self.timeout
        };
        self.active = Some(ActiveTransfer {
            descriptor: descriptor.clone(),
            chunks: Vec::new(),
            received: 0,
            deadline,
        });
        ReceiverEvent::Started(descriptor)
    }

    /// 追加一个数据块并刷新截止时间
    ///
    /// 已收满预期字节但仍未见 `file-end` 时，截止时间缩短为一半。
    pub fn on_chunk(&mut self, chunk: Bytes, now: Instant) -> Result<ReceiverEvent, ProtocolError> {
        let timeout = self.timeout;
        let active = self.active.as_mut().ok_or(ProtocolError::OrphanChunk)?;

        active.received += chunk.len() as u64;
        active.chunks.push(chunk);

        let total = active.descriptor.size;
        active.deadline = if active.received >= total {
            now + timeout / 2
        } else {
            now + timeout
        };

        Ok(ReceiverEvent::Progress {
            name: active.descriptor.name.clone(),
            received: active.received,
            total,
            percent: percent(active.received, total),
        })
    }

    /// 处理 `file-end`，名称不匹配时忽略
    pub fn on_end(&mut self, name: &str) -> Result<ReceiverEvent, ProtocolError> {
        let matches = self
            .active
            .as_ref()
            .is_some_and(|a| a.descriptor.name == name);
        if !matches {
            return Err(ProtocolError::MismatchedEnd {
                expected: self.descriptor().map(|d| d.name.clone()),
                got: name.to_string(),
            });
        }

        let Some(active) = self.active.take() else {
            return Err(ProtocolError::OrphanChunk);
        };
        if active.received != active.descriptor.size {
            warn!(
                "Transfer {} ended with {} bytes, descriptor declared {}",
                name, active.received, active.descriptor.size
            );
        }

        let mut buffer = BytesMut::with_capacity(usize::try_from(active.received).unwrap_or(0));
        for chunk in &active.chunks {
            buffer.extend_from_slice(chunk);
        }
        let assembled = buffer.freeze();

        let data = if active.descriptor.is_compressed {
            match decompress(&assembled) {
                Ok(raw) => Bytes::from(raw),
                Err(e) => {
                    return Ok(ReceiverEvent::Failed {
                        name: active.descriptor.name,
                        error: e.into(),
                    });
                }
            }
        } else {
            assembled
        };

        debug!("Transfer {} complete, {} bytes delivered", name, data.len());
        Ok(ReceiverEvent::Completed(ReceivedFile {
            descriptor: active.descriptor,
            data,
        }))
    }

    /// 截止时间到达后调用；若已超时则清空状态
    pub fn on_deadline(&mut self, now: Instant) -> Option<ReceiverEvent> {
        let expired = self.active.as_ref().is_some_and(|a| now >= a.deadline);
        if !expired {
            return None;
        }

        let active = self.active.take()?;
        warn!(
            "Transfer {} timed out after {} of {} bytes",
            active.descriptor.name, active.received, active.descriptor.size
        );
        Some(ReceiverEvent::TimedOut {
            name: active.descriptor.name,
        })
    }

    /// 本地取消，清空状态并解除计时
    pub fn abort(&mut self) {
        if let Some(active) = self.active.take() {
            info!("Aborted transfer {}", active.descriptor.name);
        }
    }
}
