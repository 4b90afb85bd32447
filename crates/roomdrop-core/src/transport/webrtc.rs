//! WebRTC 连接器
//!
//! 信令经由中继，ICE 候选逐个交换（trickle）。发起方创建有序数据通道并发出
//! offer；应答方在 `on_data_channel` 中接收通道并回复 answer。远端描述设置前
//! 到达的候选先缓存，设置后统一添加。

use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::signaling::{Negotiation, SignalingClient};
use super::{DATA_CHANNEL_LABEL, DataLink, LinkEvent, PeerConnector, Role, STUN_SERVERS, TransportError};
use crate::protocol::{Envelope, Frame};

type ChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn negotiation_error(e: webrtc::Error) -> TransportError {
    TransportError::Negotiation(e.to_string())
}

pub struct WebRtcConnector {
    relay_url: String,
    stun_servers: Vec<String>,
}

impl WebRtcConnector {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            stun_servers: STUN_SERVERS.iter().map(ToString::to_string).collect(),
        }
    }

    pub fn with_stun_servers(mut self, servers: Vec<String>) -> Self {
        self.stun_servers = servers;
        self
    }

    async fn new_peer_connection(&self) -> Result<RTCPeerConnection, TransportError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(negotiation_error)?;
        let registry =
            register_default_interceptors(Registry::new(), &mut media).map_err(negotiation_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        api.new_peer_connection(config)
            .await
            .map_err(negotiation_error)
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn dial(
        &self,
        room_id: &str,
        role: Role,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Arc<dyn DataLink>, TransportError> {
        let (signaling, inbound) = SignalingClient::connect(&self.relay_url, room_id).await?;
        let pc = match self.new_peer_connection().await {
            Ok(pc) => Arc::new(pc),
            Err(e) => {
                signaling.close();
                return Err(e);
            }
        };

        let channel: ChannelSlot = Arc::new(Mutex::new(None));
        let opened = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let ice_signaling = signaling.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let signaling = ice_signaling.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        if let Err(e) =
                            signaling.send_negotiation(Negotiation::Candidate { candidate: init })
                        {
                            debug!("Dropping local ICE candidate: {}", e);
                        }
                    }
                    Err(e) => warn!("Failed to encode ICE candidate: {}", e),
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                debug!("Peer connection state: {:?}", state);
                if state == RTCPeerConnectionState::Failed {
                    let _ = events
                        .send(LinkEvent::Failed(TransportError::PeerFailed))
                        .await;
                }
            })
        }));

        let link = Arc::new(WebRtcLink {
            pc: pc.clone(),
            channel: channel.clone(),
            signaling: signaling.clone(),
            cancel: cancel.clone(),
        });

        let local_offer = match role {
            Role::Initiator => {
                let setup = async {
                    let init = RTCDataChannelInit {
                        ordered: Some(true),
                        ..Default::default()
                    };
                    let dc = pc.create_data_channel(DATA_CHANNEL_LABEL, Some(init)).await?;
                    wire_channel(&dc, events.clone(), opened.clone());
                    *lock(&channel) = Some(dc);

                    let offer = pc.create_offer(None).await?;
                    let sdp = offer.sdp.clone();
                    pc.set_local_description(offer).await?;
                    Ok::<_, webrtc::Error>(sdp)
                }
                .await;

                let sdp = match setup {
                    Ok(sdp) => sdp,
                    Err(e) => {
                        link.close().await;
                        return Err(negotiation_error(e));
                    }
                };
                if let Err(e) = signaling.send_negotiation(Negotiation::Offer { sdp: sdp.clone() }) {
                    link.close().await;
                    return Err(e);
                }
                Some(sdp)
            }
            Role::Responder => {
                let dc_events = events.clone();
                let dc_slot = channel.clone();
                let dc_opened = opened.clone();
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let events = dc_events.clone();
                    let slot = dc_slot.clone();
                    let opened = dc_opened.clone();
                    Box::pin(async move {
                        info!("Received data channel '{}'", dc.label());
                        wire_channel(&dc, events, opened);
                        *lock(&slot) = Some(dc);
                    })
                }));
                None
            }
        };

        tokio::spawn(negotiate(
            Negotiator {
                pc,
                role,
                signaling,
                events,
                opened,
                local_offer,
                remote_set: false,
                pending: Vec::new(),
            },
            inbound,
            cancel,
        ));

        Ok(link)
    }
}

fn wire_channel(dc: &Arc<RTCDataChannel>, events: mpsc::Sender<LinkEvent>, opened: Arc<AtomicBool>) {
    let label = dc.label().to_string();

    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        let events = open_events.clone();
        let opened = opened.clone();
        let label = label.clone();
        Box::pin(async move {
            info!("Data channel '{}' open", label);
            opened.store(true, Ordering::SeqCst);
            let _ = events.send(LinkEvent::Open).await;
        })
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = message_events.clone();
        Box::pin(async move {
            let frame = if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => Frame::Text(text),
                    Err(e) => {
                        warn!("Dropping non UTF-8 text message: {}", e);
                        return;
                    }
                }
            } else {
                Frame::Binary(msg.data)
            };
            let _ = events.send(LinkEvent::Frame(frame)).await;
        })
    }));

    let close_events = events.clone();
    dc.on_close(Box::new(move || {
        let events = close_events.clone();
        Box::pin(async move {
            debug!("Data channel closed");
            let _ = events.send(LinkEvent::Closed).await;
        })
    }));

    dc.on_error(Box::new(move |e: webrtc::Error| {
        let events = events.clone();
        Box::pin(async move {
            warn!("Data channel error: {}", e);
            let _ = events
                .send(LinkEvent::Failed(TransportError::PeerFailed))
                .await;
        })
    }));
}

struct Negotiator {
    pc: Arc<RTCPeerConnection>,
    role: Role,
    signaling: SignalingClient,
    events: mpsc::Sender<LinkEvent>,
    opened: Arc<AtomicBool>,
    local_offer: Option<String>,
    remote_set: bool,
    pending: Vec<RTCIceCandidateInit>,
}

impl Negotiator {
    async fn on_envelope(&mut self, envelope: Envelope) -> Result<(), TransportError> {
        match envelope {
            Envelope::UserJoined => {
                info!("Peer joined the room");
                // 对方晚于 offer 加入时重发
                if let (Role::Initiator, false, Some(sdp)) =
                    (self.role, self.remote_set, &self.local_offer)
                {
                    debug!("Re-sending offer");
                    self.signaling
                        .send_negotiation(Negotiation::Offer { sdp: sdp.clone() })?;
                }
                Ok(())
            }
            Envelope::Signal(value) => match serde_json::from_value::<Negotiation>(value) {
                Ok(negotiation) => self.on_negotiation(negotiation).await,
                Err(e) => {
                    warn!("Ignoring unrecognised signal payload: {}", e);
                    Ok(())
                }
            },
            other => {
                debug!("Ignoring {} on signaling channel", other.kind());
                Ok(())
            }
        }
    }

    async fn on_negotiation(&mut self, negotiation: Negotiation) -> Result<(), TransportError> {
        match negotiation {
            Negotiation::Offer { sdp } => {
                if self.role.is_initiator() || self.remote_set {
                    debug!("Ignoring unexpected offer");
                    return Ok(());
                }
                let offer = RTCSessionDescription::offer(sdp).map_err(negotiation_error)?;
                self.pc
                    .set_remote_description(offer)
                    .await
                    .map_err(negotiation_error)?;
                self.remote_set = true;
                self.flush_candidates().await;

                let answer = self.pc.create_answer(None).await.map_err(negotiation_error)?;
                let sdp = answer.sdp.clone();
                self.pc
                    .set_local_description(answer)
                    .await
                    .map_err(negotiation_error)?;
                self.signaling.send_negotiation(Negotiation::Answer { sdp })
            }
            Negotiation::Answer { sdp } => {
                if !self.role.is_initiator() || self.remote_set {
                    debug!("Ignoring unexpected answer");
                    return Ok(());
                }
                let answer = RTCSessionDescription::answer(sdp).map_err(negotiation_error)?;
                self.pc
                    .set_remote_description(answer)
                    .await
                    .map_err(negotiation_error)?;
                self.remote_set = true;
                self.flush_candidates().await;
                Ok(())
            }
            Negotiation::Candidate { candidate } => {
                if self.remote_set {
                    self.add_candidate(candidate).await;
                } else {
                    self.pending.push(candidate);
                }
                Ok(())
            }
        }
    }

    async fn flush_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            debug!("Applying {} buffered ICE candidates", pending.len());
        }
        for candidate in pending {
            self.add_candidate(candidate).await;
        }
    }

    async fn add_candidate(&self, candidate: RTCIceCandidateInit) {
        // 单个候选无效不影响其余候选
        if let Err(e) = self.pc.add_ice_candidate(candidate).await {
            warn!("Rejected remote ICE candidate: {}", e);
        }
    }
}

async fn negotiate(
    mut negotiator: Negotiator,
    mut inbound: mpsc::UnboundedReceiver<Envelope>,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => return,
            envelope = inbound.recv() => envelope,
        };
        let Some(envelope) = envelope else {
            if negotiator.opened.load(Ordering::SeqCst) {
                debug!("Signaling closed after data channel opened");
            } else {
                let _ = negotiator
                    .events
                    .send(LinkEvent::Failed(TransportError::Signaling(
                        "relay closed before negotiation finished".to_string(),
                    )))
                    .await;
            }
            return;
        };

        if let Err(e) = negotiator.on_envelope(envelope).await {
            warn!("Negotiation failed: {}", e);
            let _ = negotiator.events.send(LinkEvent::Failed(e)).await;
            return;
        }
    }
}

pub struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    channel: ChannelSlot,
    signaling: SignalingClient,
    cancel: CancellationToken,
}

#[async_trait]
impl DataLink for WebRtcLink {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let dc = lock(&self.channel)
            .clone()
            .ok_or_else(|| TransportError::SendFailed("data channel not ready".to_string()))?;
        let result = match frame {
            Frame::Text(text) => dc.send_text(text).await,
            Frame::Binary(data) => dc.send(&data).await,
        };
        result
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.signaling.close();
        let channel = lock(&self.channel).take();
        if let Some(dc) = channel {
            if let Err(e) = dc.close().await {
                debug!("Data channel close: {}", e);
            }
        }
        if let Err(e) = self.pc.close().await {
            debug!("Peer connection close: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_stun_servers() {
        let connector = WebRtcConnector::new("ws://127.0.0.1:1");
        assert_eq!(connector.stun_servers.len(), STUN_SERVERS.len());

        let connector = connector.with_stun_servers(vec!["stun:example.org:3478".to_string()]);
        assert_eq!(connector.stun_servers, vec!["stun:example.org:3478"]);
    }

    #[tokio::test]
    async fn test_dial_unreachable_relay_fails() {
        let connector = WebRtcConnector::new("ws://127.0.0.1:1");
        let (tx, _rx) = mpsc::channel(4);
        let result = connector.dial("room", Role::Initiator, tx).await;
        assert!(matches!(result, Err(TransportError::Signaling(_))));
    }
}
