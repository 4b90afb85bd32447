//! 点对点传输抽象
//!
//! [`PeerTransport`] 包装一条直连通道，只在协商阶段借助信令中继。
//! 具体的连接方式由 [`PeerConnector`] 决定:
//!
//! - [`WebRtcConnector`]: WebSocket 信令 + WebRTC 数据通道
//! - [`MemoryConnector`]: 进程内配对，用于测试

pub mod memory;
pub mod peer;
pub mod signaling;
pub mod state;
pub mod webrtc;

pub use memory::MemoryConnector;
pub use peer::{PeerTransport, TransportEvent};
pub use signaling::SignalingClient;
pub use state::{TransportInput, TransportNotice, TransportState};
pub use webrtc::WebRtcConnector;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::Frame;

/// 公共 STUN 服务器
pub const STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun.cloudflare.com:3478",
];

pub const DATA_CHANNEL_LABEL: &str = "roomdrop";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("signaling connection failed: {0}")]
    Signaling(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("peer connection failed")]
    PeerFailed,
    #[error("transport closed")]
    Closed,
}

/// 本端角色，创建时确定，之后不再协商
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn is_initiator(self) -> bool {
        self == Role::Initiator
    }
}

/// 底层连接上报的事件
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// 数据通道已打开
    Open,
    Frame(Frame),
    Failed(TransportError),
    Closed,
}

/// 已创建的直连通道
#[async_trait]
pub trait DataLink: Send + Sync {
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// 同时释放直连和信令连接
    async fn close(&self);
}

/// 建立直连的方式
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// 打开到房间的信令连接并创建直连
    ///
    /// 返回时信令已连通、本地连接已创建；协商完成后通过 `events` 上报
    /// [`LinkEvent::Open`]。
    async fn dial(
        &self,
        room_id: &str,
        role: Role,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Arc<dyn DataLink>, TransportError>;
}
