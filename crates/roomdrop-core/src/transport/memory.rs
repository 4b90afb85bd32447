//! 进程内连接器
//!
//! 同一房间内先后两次 `dial` 互相配对，双方同时收到 [`LinkEvent::Open`]。
//! 测试可以用 [`MemoryConnector::sever`] 模拟连接中途断开。

use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::{DataLink, LinkEvent, PeerConnector, Role, TransportError};
use crate::protocol::Frame;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Network {
    rooms: HashMap<String, Vec<Arc<MemoryLink>>>,
    dials: usize,
}

#[derive(Clone, Default)]
pub struct MemoryConnector {
    network: Arc<Mutex<Network>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 累计 `dial` 次数
    pub fn dial_count(&self) -> usize {
        lock(&self.network).dials
    }

    /// 所有房间中尚未关闭的连接数
    pub fn live_links(&self) -> usize {
        lock(&self.network)
            .rooms
            .values()
            .flatten()
            .filter(|link| !link.is_closed())
            .count()
    }

    pub fn live_links_in(&self, room_id: &str) -> usize {
        lock(&self.network)
            .rooms
            .get(room_id)
            .map(|links| links.iter().filter(|link| !link.is_closed()).count())
            .unwrap_or(0)
    }

    /// 切断房间内所有连接，每一端都收到 `Failed(PeerFailed)`
    ///
    /// 返回被切断的连接数。
    pub fn sever(&self, room_id: &str) -> usize {
        let network = lock(&self.network);
        let Some(links) = network.rooms.get(room_id) else {
            return 0;
        };
        let mut severed = 0;
        for link in links {
            if link.closed.swap(true, Ordering::SeqCst) {
                continue;
            }
            lock(&link.peer).take();
            let _ = link
                .own
                .try_send(LinkEvent::Failed(TransportError::PeerFailed));
            severed += 1;
        }
        debug!("Severed {} links in room {}", severed, room_id);
        severed
    }
}

#[async_trait]
impl PeerConnector for MemoryConnector {
    async fn dial(
        &self,
        room_id: &str,
        role: Role,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Arc<dyn DataLink>, TransportError> {
        let mut network = lock(&self.network);
        network.dials += 1;

        let link = Arc::new(MemoryLink {
            own: events,
            peer: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let links = network.rooms.entry(room_id.to_string()).or_default();
        links.retain(|l| !l.is_closed());
        if let Some(other) = links.iter().find(|l| lock(&l.peer).is_none()) {
            *lock(&other.peer) = Some(link.own.clone());
            *lock(&link.peer) = Some(other.own.clone());
            let _ = other.own.try_send(LinkEvent::Open);
            let _ = link.own.try_send(LinkEvent::Open);
            debug!("Paired {:?} in room {}", role, room_id);
        } else {
            debug!("{:?} waiting in room {}", role, room_id);
        }
        links.push(link.clone());

        Ok(link)
    }
}

pub struct MemoryLink {
    own: mpsc::Sender<LinkEvent>,
    peer: Mutex<Option<mpsc::Sender<LinkEvent>>>,
    closed: AtomicBool,
}

impl MemoryLink {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataLink for MemoryLink {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let peer = lock(&self.peer)
            .clone()
            .ok_or_else(|| TransportError::SendFailed("peer not connected".to_string()))?;
        peer.send(LinkEvent::Frame(frame))
            .await
            .map_err(|_| TransportError::SendFailed("peer went away".to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(peer) = lock(&self.peer).take() else {
            return;
        };
        // 排在已发出的帧之后
        if let Err(TrySendError::Full(event)) = peer.try_send(LinkEvent::Closed) {
            tokio::spawn(async move {
                let _ = peer.send(event).await;
            });
        }
    }
}
