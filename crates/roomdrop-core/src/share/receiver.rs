//! 接收端会话
//!
//! 以响应方身份加入房间，把直连通道上的控制帧和数据块交给
//! [`TransferReceiver`]，并把结果作为 [`ReceiveEvent`] 上报。

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::ShareError;
use crate::protocol::{Envelope, Frame};
use crate::storage::StoredObjectMeta;
use crate::transfer::{ReceiverEvent, TransferReceiver, TransferSettings};
use crate::transport::{PeerConnector, PeerTransport, Role, TransportEvent, TransportState};

#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveEvent {
    Connected,
    Transfer(ReceiverEvent),
    /// 对端分享了一个存储对象
    Pointer(StoredObjectMeta),
    Text(String),
    Failed(ShareError),
    Closed,
}

pub struct ShareReceiver {
    transport: Arc<PeerTransport>,
    pump: JoinHandle<()>,
}

impl ShareReceiver {
    pub fn join(
        connector: Arc<dyn PeerConnector>,
        room_id: &str,
        settings: TransferSettings,
    ) -> (Self, mpsc::UnboundedReceiver<ReceiveEvent>) {
        let (transport, events) = PeerTransport::connect(connector, room_id, Role::Responder);
        let transport = Arc::new(transport);
        let (tx, rx) = mpsc::unbounded_channel();

        let pump = tokio::spawn(pump(
            events,
            TransferReceiver::new(settings.receive_timeout),
            tx,
        ));
        (Self { transport, pump }, rx)
    }

    pub fn room_id(&self) -> &str {
        self.transport.room_id()
    }

    pub fn state(&self) -> TransportState {
        self.transport.state()
    }

    pub async fn close(&self) {
        self.pump.abort();
        self.transport.destroy().await;
    }
}

impl Drop for ShareReceiver {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump(
    mut events: mpsc::Receiver<TransportEvent>,
    mut receiver: TransferReceiver,
    tx: mpsc::UnboundedSender<ReceiveEvent>,
) {
    loop {
        let deadline = receiver.deadline();
        let event = tokio::select! {
            event = events.recv() => event,
            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                if let Some(timed_out) = receiver.on_deadline(Instant::now()) {
                    let _ = tx.send(ReceiveEvent::Transfer(timed_out));
                }
                continue;
            }
        };

        let Some(event) = event else {
            debug!("Transport event stream ended");
            break;
        };

        match event {
            TransportEvent::Connected => {
                info!("Receiver connected");
                let _ = tx.send(ReceiveEvent::Connected);
            }
            TransportEvent::Frame(frame) => {
                if let Some(event) = on_frame(&mut receiver, frame) {
                    let _ = tx.send(event);
                }
            }
            TransportEvent::Failed(e) => {
                receiver.abort();
                let _ = tx.send(ReceiveEvent::Failed(e.into()));
                break;
            }
            TransportEvent::Closed => {
                receiver.abort();
                let _ = tx.send(ReceiveEvent::Closed);
                break;
            }
        }
    }
}

fn on_frame(receiver: &mut TransferReceiver, frame: Frame) -> Option<ReceiveEvent> {
    let now = Instant::now();
    let result = match frame {
        Frame::Binary(chunk) => receiver.on_chunk(chunk, now).map(ReceiveEvent::Transfer),
        Frame::Text(text) => match Envelope::parse(&text) {
            Ok(Envelope::FileMeta(descriptor)) => {
                Ok(ReceiveEvent::Transfer(receiver.on_meta(descriptor, now)))
            }
            Ok(Envelope::FileEnd(end)) => receiver.on_end(&end.name).map(ReceiveEvent::Transfer),
            Ok(Envelope::R2FileShare(meta)) => Ok(ReceiveEvent::Pointer(meta)),
            Ok(Envelope::Text(text)) => Ok(ReceiveEvent::Text(text)),
            Ok(other) => {
                debug!("Ignoring {} frame on data channel", other.kind());
                return None;
            }
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Ignoring frame: {}", e);
            None
        }
    }
}
