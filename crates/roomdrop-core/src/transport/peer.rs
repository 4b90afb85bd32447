//! PeerTransport
//!
//! 持有一条 [`DataLink`]，把底层事件经过状态机后转发给上层。
//! `Connected`、`Failed`、`Closed` 各自最多上报一次，终止后不再转发任何帧。

use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::state::{TransportInput, TransportNotice, TransportState, transition};
use super::{DataLink, LinkEvent, PeerConnector, Role, TransportError};
use crate::protocol::Frame;
use crate::transfer::FrameSink;

const EVENT_BUFFER: usize = 256;
const LINK_BUFFER: usize = 256;

/// 上报给上层的传输事件
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Frame(Frame),
    Failed(TransportError),
    Closed,
}

struct Shared {
    state: TransportState,
    link: Option<Arc<dyn DataLink>>,
}

pub struct PeerTransport {
    room_id: String,
    role: Role,
    shared: Arc<Mutex<Shared>>,
    cancel: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PeerTransport {
    /// 开始连接房间，立即返回
    ///
    /// 连接结果通过返回的事件流上报。
    pub fn connect(
        connector: Arc<dyn PeerConnector>,
        room_id: &str,
        role: Role,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let shared = Arc::new(Mutex::new(Shared {
            state: TransportState::Connecting,
            link: None,
        }));
        let cancel = CancellationToken::new();

        info!("Connecting to room {} as {:?}", room_id, role);
        let handle = tokio::spawn(pump(
            connector,
            room_id.to_string(),
            role,
            shared.clone(),
            cancel.clone(),
            events_tx,
        ));

        let transport = Self {
            room_id: room_id.to_string(),
            role,
            shared,
            cancel,
            pump: Mutex::new(Some(handle)),
        };
        (transport, events_rx)
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> TransportState {
        lock(&self.shared).state
    }

    /// 发送一帧；不在 `Connected` 状态时记录日志并返回 `false`
    pub async fn send(&self, frame: Frame) -> bool {
        let link = {
            let shared = lock(&self.shared);
            if !shared.state.can_send() {
                warn!(
                    "Dropping {} byte frame: transport for room {} is {:?}",
                    frame.len(),
                    self.room_id,
                    shared.state
                );
                return false;
            }
            shared.link.clone()
        };
        let Some(link) = link else {
            return false;
        };

        match link.send(frame).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Send failed on room {}: {}", self.room_id, e);
                false
            }
        }
    }

    /// 释放直连与信令连接，可重复调用
    pub async fn destroy(&self) {
        self.cancel.cancel();
        if let Some(handle) = lock(&self.pump).take() {
            handle.abort();
        }

        let link = {
            let mut shared = lock(&self.shared);
            shared.state = transition(shared.state, TransportInput::Destroy).next;
            shared.link.take()
        };
        if let Some(link) = link {
            debug!("Destroying transport for room {}", self.room_id);
            link.close().await;
        }
    }
}

impl Drop for PeerTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = lock(&self.pump).take() {
            handle.abort();
        }
        let link = lock(&self.shared).link.take();
        if let (Some(link), Ok(runtime)) = (link, tokio::runtime::Handle::try_current()) {
            runtime.spawn(async move { link.close().await });
        }
    }
}

#[async_trait]
impl FrameSink for PeerTransport {
    async fn send_frame(&self, frame: Frame) -> bool {
        self.send(frame).await
    }
}

/// 应用一次状态转换，返回需要上报的通知
fn apply(shared: &Mutex<Shared>, input: TransportInput) -> (TransportState, Option<TransportNotice>) {
    let mut shared = lock(shared);
    let step = transition(shared.state, input);
    shared.state = step.next;
    (step.next, step.notice)
}

async fn pump(
    connector: Arc<dyn PeerConnector>,
    room_id: String,
    role: Role,
    shared: Arc<Mutex<Shared>>,
    cancel: CancellationToken,
    events: mpsc::Sender<TransportEvent>,
) {
    let (link_tx, mut link_rx) = mpsc::channel(LINK_BUFFER);

    let dialed = tokio::select! {
        _ = cancel.cancelled() => return,
        result = connector.dial(&room_id, role, link_tx) => result,
    };
    let link = match dialed {
        Ok(link) => link,
        Err(e) => {
            warn!("Dial failed for room {}: {}", room_id, e);
            if let (_, Some(TransportNotice::Failed)) = apply(&shared, TransportInput::LinkFailed) {
                let _ = events.send(TransportEvent::Failed(e)).await;
            }
            return;
        }
    };

    // 守卫不能跨越 await
    let terminal = {
        let mut guard = lock(&shared);
        if guard.state.is_terminal() {
            true
        } else {
            guard.link = Some(link.clone());
            false
        }
    };
    if terminal {
        link.close().await;
        return;
    }

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = link_rx.recv() => event,
        };

        let (input, error) = match event {
            Some(LinkEvent::Open) => (TransportInput::LinkOpened, None),
            Some(LinkEvent::Frame(frame)) => {
                let open = lock(&shared).state.can_send();
                if open {
                    let _ = events.send(TransportEvent::Frame(frame)).await;
                } else {
                    debug!("Dropping frame received outside Connected state");
                }
                continue;
            }
            Some(LinkEvent::Failed(e)) => (TransportInput::LinkFailed, Some(e)),
            Some(LinkEvent::Closed) | None => (TransportInput::LinkClosed, None),
        };

        let (next, notice) = apply(&shared, input);
        match notice {
            Some(TransportNotice::Connected) => {
                info!("Transport connected in room {}", room_id);
                let _ = events.send(TransportEvent::Connected).await;
            }
            Some(TransportNotice::Failed) => {
                let error = error.unwrap_or(TransportError::Closed);
                warn!("Transport failed in room {}: {}", room_id, error);
                let _ = events.send(TransportEvent::Failed(error)).await;
            }
            Some(TransportNotice::Closed) => {
                info!("Transport closed in room {}", room_id);
                let _ = events.send(TransportEvent::Closed).await;
            }
            None => {}
        }

        if next.is_terminal() {
            let link = lock(&shared).link.take();
            if let Some(link) = link {
                link.close().await;
            }
            return;
        }
    }
}
