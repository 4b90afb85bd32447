//! 中继 HTTP/WebSocket 服务
//!
//! - `GET /signal/{room_id}` 升级为 WebSocket 并加入房间
//! - 缺少房间号或不是升级请求时返回 400
//! - `GET /health` 返回 `ok`

use axum::{
    Router,
    extract::ws::rejection::WebSocketUpgradeRejection,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{any, get},
};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::room::{RelayFrame, RoomRegistry, SESSION_QUEUE};

#[derive(Clone, Default)]
pub struct RelayServer {
    registry: RoomRegistry,
}

impl RelayServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/signal", any(missing_room))
            .route("/signal/", any(missing_room))
            .route("/signal/:room_id", get(signal_handler))
            .with_state(self.registry.clone())
    }

    /// 绑定地址并在后台提供服务，返回实际监听地址
    pub async fn bind(&self, addr: &str) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let app = self.router();

        info!("Signaling relay listening on {}", local);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Relay server error: {}", e);
            }
        });

        Ok(local)
    }

    /// 在当前任务中提供服务直到出错
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!("Signaling relay listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn missing_room() -> (StatusCode, &'static str) {
    (StatusCode::BAD_REQUEST, "missing room id")
}

async fn signal_handler(
    Path(room_id): Path<String>,
    State(registry): State<RoomRegistry>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if room_id.trim().is_empty() {
        return missing_room().await.into_response();
    }
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            debug!("Rejected non-upgrade request for room {}: {}", room_id, rejection);
            return (StatusCode::BAD_REQUEST, "expected websocket upgrade").into_response();
        }
    };

    upgrade.on_upgrade(move |socket| run_session(socket, registry, room_id))
}

async fn run_session(socket: WebSocket, registry: RoomRegistry, room_id: String) {
    let (mut sink, mut stream) = socket.split();
    let (outbound, rx) = mpsc::channel(SESSION_QUEUE);
    let session = registry.join(&room_id, outbound).await;
    info!("Session {} connected to room {}", session.id(), room_id);

    let writer = tokio::spawn(async move {
        let mut frames = ReceiverStream::new(rx);
        while let Some(frame) = frames.next().await {
            let msg = match frame {
                RelayFrame::Text(text) => Message::Text(text),
                RelayFrame::Binary(data) => Message::Binary(data),
            };
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => session.broadcast(RelayFrame::Text(text)),
            Ok(Message::Binary(data)) => session.broadcast(RelayFrame::Binary(data)),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Session {} read error: {}", session.id(), e);
                break;
            }
        }
    }

    let id = session.id();
    session.leave().await;
    writer.abort();
    info!("Session {} disconnected from room {}", id, room_id);
}
