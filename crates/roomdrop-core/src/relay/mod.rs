//! 信令中继
//!
//! 按房间号把每个 WebSocket 会话收到的文本或二进制消息原样转发给同房间的
//! 其他会话，不解析内容，不回显给发送者。

pub mod room;
pub mod server;

pub use room::{RelayFrame, RoomRegistry, SessionHandle, SessionId};
pub use server::RelayServer;
