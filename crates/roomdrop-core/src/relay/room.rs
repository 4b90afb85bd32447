//! 房间与会话
//!
//! 每个房间由一个任务独占其会话集合，命令按到达顺序处理。
//! [`RoomRegistry`] 在加入和离开时持有注册表锁，最后一个会话离开后移除房间。

use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc, oneshot};

pub type SessionId = u64;

/// 每个会话的出站队列长度
pub const SESSION_QUEUE: usize = 256;

/// 中继转发的原始消息，内容不做解析
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Text(String),
    Binary(Vec<u8>),
}

enum RoomCommand {
    Join {
        id: SessionId,
        outbound: mpsc::Sender<RelayFrame>,
        reply: oneshot::Sender<usize>,
    },
    Leave {
        id: SessionId,
        reply: oneshot::Sender<usize>,
    },
    Broadcast {
        from: SessionId,
        frame: RelayFrame,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
}

#[derive(Clone)]
struct RoomHandle {
    commands: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    fn spawn(room_id: String) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_room(room_id, rx));
        Self { commands }
    }

    async fn request(&self, command: impl FnOnce(oneshot::Sender<usize>) -> RoomCommand) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(command(reply)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

async fn run_room(room_id: String, mut commands: mpsc::UnboundedReceiver<RoomCommand>) {
    let mut sessions: BTreeMap<SessionId, mpsc::Sender<RelayFrame>> = BTreeMap::new();

    while let Some(command) = commands.recv().await {
        match command {
            RoomCommand::Join { id, outbound, reply } => {
                sessions.insert(id, outbound);
                debug!("Session {} joined room {} ({} open)", id, room_id, sessions.len());
                let _ = reply.send(sessions.len());
            }
            RoomCommand::Leave { id, reply } => {
                sessions.remove(&id);
                debug!("Session {} left room {} ({} open)", id, room_id, sessions.len());
                let _ = reply.send(sessions.len());
            }
            RoomCommand::Broadcast { from, frame } => {
                for (id, outbound) in &sessions {
                    if *id == from {
                        continue;
                    }
                    if let Err(e) = outbound.try_send(frame.clone()) {
                        warn!("Dropping frame for session {} in room {}: {}", id, room_id, e);
                    }
                }
            }
            RoomCommand::Count { reply } => {
                let _ = reply.send(sessions.len());
            }
        }
    }

    debug!("Room {} task finished", room_id);
}

#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<Mutex<BTreeMap<String, RoomHandle>>>,
    next_id: Arc<AtomicU64>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册会话，房间不存在时创建
    pub async fn join(&self, room_id: &str, outbound: mpsc::Sender<RelayFrame>) -> SessionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut rooms = self.rooms.lock().await;

        let room = rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                info!("Opening room {}", room_id);
                RoomHandle::spawn(room_id.to_string())
            })
            .clone();
        room.request(|reply| RoomCommand::Join {
            id,
            outbound,
            reply,
        })
        .await;

        SessionHandle {
            id,
            room_id: room_id.to_string(),
            room,
            registry: self.clone(),
        }
    }

    async fn leave(&self, room_id: &str, id: SessionId) {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.get(room_id) else {
            return;
        };
        let remaining = room.request(|reply| RoomCommand::Leave { id, reply }).await;
        if remaining == 0 {
            rooms.remove(room_id);
            info!("Closing empty room {}", room_id);
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// 房间内的会话数，房间不存在时为 0
    pub async fn session_count(&self, room_id: &str) -> usize {
        let room = self.rooms.lock().await.get(room_id).cloned();
        match room {
            Some(room) => room.request(|reply| RoomCommand::Count { reply }).await,
            None => 0,
        }
    }
}

/// 一个已注册的会话
pub struct SessionHandle {
    id: SessionId,
    room_id: String,
    room: RoomHandle,
    registry: RoomRegistry,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// 转发给房间内其他所有会话
    pub fn broadcast(&self, frame: RelayFrame) {
        let _ = self.room.commands.send(RoomCommand::Broadcast {
            from: self.id,
            frame,
        });
    }

    pub async fn leave(self) {
        self.registry.leave(&self.room_id, self.id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let registry = RoomRegistry::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let (tx_c, mut rx_c) = mpsc::channel(8);
        let a = registry.join("r", tx_a).await;
        let _b = registry.join("r", tx_b).await;
        let _c = registry.join("r", tx_c).await;

        a.broadcast(RelayFrame::Text("hello".to_string()));
        a.broadcast(RelayFrame::Binary(vec![1, 2, 3]));

        for rx in [&mut rx_b, &mut rx_c] {
            assert_eq!(rx.recv().await, Some(RelayFrame::Text("hello".to_string())));
            assert_eq!(rx.recv().await, Some(RelayFrame::Binary(vec![1, 2, 3])));
        }
        settle().await;
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let registry = RoomRegistry::new();
        let (tx_a, _rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let a = registry.join("one", tx_a).await;
        let _b = registry.join("two", tx_b).await;

        a.broadcast(RelayFrame::Text("x".to_string()));
        settle().await;
        assert!(rx_b.try_recv().is_err());
        assert_eq!(registry.room_count().await, 2);
    }

    #[tokio::test]
    async fn test_last_leave_removes_room() {
        let registry = RoomRegistry::new();
        let (tx_a, _rx_a) = mpsc::channel(8);
        let (tx_b, _rx_b) = mpsc::channel(8);
        let a = registry.join("r", tx_a).await;
        let b = registry.join("r", tx_b).await;
        assert_eq!(registry.session_count("r").await, 2);

        a.leave().await;
        assert_eq!(registry.session_count("r").await, 1);
        assert_eq!(registry.room_count().await, 1);

        b.leave().await;
        assert_eq!(registry.session_count("r").await, 0);
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_full_queue_does_not_block_others() {
        let registry = RoomRegistry::new();
        let (tx_a, _rx_a) = mpsc::channel(8);
        let (tx_slow, _rx_slow) = mpsc::channel(1);
        let (tx_fast, mut rx_fast) = mpsc::channel(8);
        let a = registry.join("r", tx_a).await;
        let _slow = registry.join("r", tx_slow).await;
        let _fast = registry.join("r", tx_fast).await;

        for i in 0..3u8 {
            a.broadcast(RelayFrame::Binary(vec![i]));
        }
        for i in 0..3u8 {
            assert_eq!(rx_fast.recv().await, Some(RelayFrame::Binary(vec![i])));
        }
    }

    #[tokio::test]
    async fn test_concurrent_join_leave_keeps_count() {
        let registry = RoomRegistry::new();
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (tx, _rx) = mpsc::channel(1);
                let session = registry.join("busy", tx).await;
                tokio::task::yield_now().await;
                session.leave().await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(registry.room_count().await, 0);
    }
}
