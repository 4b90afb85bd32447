//! Roomdrop Core Library
//!
//! 按房间号的点对点文件分享: 双方在信令中继上交换协商消息，建立 WebRTC
//! 数据通道后直接传输；直连失败时可以把文件上传到存储网关，对端再按指针下载。
//!
//! # 模块
//!
//! - **relay**: 信令中继，按房间转发 WebSocket 消息
//! - **transport**: PeerTransport、WebRTC 与内存连接器
//! - **transfer**: 分块传输协议、压缩
//! - **storage**: 存储网关接口、HTTP 与内存实现、过期清理
//! - **share**: 分享状态机、发送编排、接收会话
//! - **notice**: 用户可见的提示
//!
//! # 使用示例
//!
//! ## 发送文件
//!
//! ```ignore
//! use roomdrop_core::{ChannelShareCallback, HttpGateway, ShareItem, ShareOrchestrator, WebRtcConnector};
//!
//! let (callback, mut events) = ChannelShareCallback::new();
//! let orchestrator = ShareOrchestrator::new(
//!     Arc::new(WebRtcConnector::new("ws://127.0.0.1:8787")),
//!     Arc::new(HttpGateway::new("http://127.0.0.1:8788")?),
//!     ShareSettings::default(),
//!     Arc::new(callback),
//! );
//! orchestrator.share(ShareItem::from_path(&path).await?, "room-42").await?;
//! ```
//!
//! ## 接收文件
//!
//! ```ignore
//! let (receiver, mut events) =
//!     ShareReceiver::join(Arc::new(WebRtcConnector::new(relay)), "room-42", TransferSettings::default());
//! while let Some(event) = events.recv().await {
//!     // ReceiveEvent::Transfer(ReceiverEvent::Completed(file)) => 保存 file.data
//! }
//! ```

pub mod config;
pub mod error;
pub mod notice;
pub mod protocol;
pub mod relay;
pub mod share;
pub mod storage;
pub mod transfer;
pub mod transport;

pub use config::AppSettings;
pub use error::ShareError;
pub use notice::{Notice, NoticeBoard, NoticeLevel};
pub use protocol::{Envelope, Frame, ProtocolError};

// Relay re-exports
pub use relay::{RelayServer, RoomRegistry};

// Share re-exports
pub use share::{
    ChannelShareCallback, ReceiveEvent, ShareEvent, ShareItem, ShareOrchestrator, ShareProgress,
    ShareProgressCallback, ShareReceiver, ShareSettings, ShareState,
};

// Storage re-exports
pub use storage::{HttpGateway, MemoryGateway, StorageError, StorageGateway, StoredObjectMeta};

// Transfer re-exports
pub use transfer::{ReceivedFile, ReceiverEvent, TransferDescriptor, TransferSettings};

// Transport re-exports
pub use transport::{MemoryConnector, PeerConnector, PeerTransport, TransportError, WebRtcConnector};
