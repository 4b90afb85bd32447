//! 信令客户端
//!
//! 通过中继的 WebSocket 交换协商片段。连接打开后先发送一次 `user-joined`，
//! 之后只转发 `signal` 与 `user-joined` 帧，其余帧记录日志后丢弃。

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use super::TransportError;
use crate::protocol::Envelope;

/// `signal` 帧的载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Negotiation {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: RTCIceCandidateInit },
}

impl Negotiation {
    pub fn into_envelope(self) -> Result<Envelope, TransportError> {
        serde_json::to_value(&self)
            .map(Envelope::Signal)
            .map_err(|e| TransportError::Negotiation(e.to_string()))
    }
}

/// 房间的信令地址 `{relay}/signal/{room_id}`
///
/// `http(s)` 地址会转换为 `ws(s)`。
pub fn room_url(relay_url: &str, room_id: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(relay_url).map_err(|e| TransportError::Signaling(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" => Some("ws"),
        "https" => Some("wss"),
        "ws" | "wss" => None,
        other => {
            return Err(TransportError::Signaling(format!(
                "unsupported relay scheme {other}"
            )));
        }
    };
    if let Some(scheme) = scheme {
        url.set_scheme(scheme)
            .map_err(|()| TransportError::Signaling(format!("cannot use {scheme} for {relay_url}")))?;
    }
    url.path_segments_mut()
        .map_err(|()| TransportError::Signaling(format!("invalid relay url {relay_url}")))?
        .pop_if_empty()
        .extend(["signal", room_id]);
    Ok(url)
}

#[derive(Clone)]
pub struct SignalingClient {
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl SignalingClient {
    /// 连接到房间，返回客户端和入站信封流
    ///
    /// 中继断开或调用 [`close`](Self::close) 后入站流结束。
    pub async fn connect(
        relay_url: &str,
        room_id: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Envelope>), TransportError> {
        let url = room_url(relay_url, room_id)?;
        info!("Connecting to signaling relay {}", url);
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Signaling(e.to_string()))?;
        let (mut write, mut read) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Envelope>();
        let cancel = CancellationToken::new();

        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let text = tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    text = out_rx.recv() => text,
                };
                let Some(text) = text else { break };
                if let Err(e) = write.send(Message::Text(text)).await {
                    warn!("Signaling write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
            debug!("Signaling writer finished");
        });

        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    msg = read.next() => msg,
                };
                match msg {
                    Some(Ok(Message::Text(text))) => match Envelope::parse(&text) {
                        Ok(envelope @ (Envelope::Signal(_) | Envelope::UserJoined)) => {
                            if in_tx.send(envelope).is_err() {
                                break;
                            }
                        }
                        Ok(other) => {
                            debug!("Ignoring {} frame on signaling channel", other.kind())
                        }
                        Err(e) => warn!("Dropping signaling frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Signaling read failed: {}", e);
                        break;
                    }
                }
            }
            debug!("Signaling reader finished");
        });

        let client = Self {
            outbound: out_tx,
            cancel,
        };
        client.send(&Envelope::UserJoined)?;
        Ok((client, in_rx))
    }

    pub fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let text = envelope
            .to_text()
            .map_err(|e| TransportError::Signaling(e.to_string()))?;
        self.outbound
            .send(text)
            .map_err(|_| TransportError::Signaling("signaling connection closed".to_string()))
    }

    pub fn send_negotiation(&self, negotiation: Negotiation) -> Result<(), TransportError> {
        self.send(&negotiation.into_envelope()?)
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.outbound.is_closed()
    }
}
