//! 分享流程
//!
//! - [`ShareOrchestrator`]: 发送方，直连优先，字节失败时回退到存储上传
//! - [`ShareReceiver`]: 接收方，加入房间并组装收到的文件

pub mod orchestrator;
pub mod receiver;
pub mod state;

pub use orchestrator::{
    CONNECT_TIMEOUT, ChannelShareCallback, POINTER_GRACE, ProgressPhase, ShareEvent, ShareItem,
    ShareOrchestrator, ShareProgress, ShareProgressCallback, ShareSettings,
};
pub use receiver::{ReceiveEvent, ShareReceiver};
pub use state::{ItemKind, ShareInput, ShareState, transition};
