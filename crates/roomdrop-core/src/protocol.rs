//! 线上消息格式
//!
//! 中继通道和直连数据通道共用同一种信封:
//!
//! - 控制帧: JSON 文本 `{"type": ..., "payload": ...}`，
//!   类型为 `signal | text | file-meta | file-end | r2-file-share | user-joined`
//! - 数据块: 原始二进制帧，不带序号，依赖通道的有序交付

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::storage::StoredObjectMeta;
use crate::transfer::TransferDescriptor;

/// 协议错误，记录日志后忽略，不影响会话
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed control frame: {0}")]
    Malformed(String),
    #[error("binary chunk received without an active transfer")]
    OrphanChunk,
    #[error("file-end for {got:?} does not match active transfer {expected:?}")]
    MismatchedEnd { expected: Option<String>, got: String },
}

/// `file-end` 载荷
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEnd {
    pub name: String,
}

/// 控制帧信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Envelope {
    /// 协商片段 (offer / answer / ICE candidate)，对中继不透明
    #[serde(rename = "signal")]
    Signal(Value),
    #[serde(rename = "text")]
    Text(String),
    #[serde(rename = "file-meta")]
    FileMeta(TransferDescriptor),
    #[serde(rename = "file-end")]
    FileEnd(FileEnd),
    /// 指向已上传到存储网关的对象
    #[serde(rename = "r2-file-share")]
    R2FileShare(StoredObjectMeta),
    /// 仅用于观测，双方正常通信不依赖它
    #[serde(rename = "user-joined")]
    UserJoined,
}

impl Envelope {
    /// 解析 JSON 文本控制帧
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        self.to_text().map(Frame::Text)
    }

    pub fn file_end(name: &str) -> Self {
        Envelope::FileEnd(FileEnd {
            name: name.to_string(),
        })
    }

    /// 用于日志的类型名
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Signal(_) => "signal",
            Envelope::Text(_) => "text",
            Envelope::FileMeta(_) => "file-meta",
            Envelope::FileEnd(_) => "file-end",
            Envelope::R2FileShare(_) => "r2-file-share",
            Envelope::UserJoined => "user-joined",
        }
    }
}

/// 通道上的一帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(t) => t.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
