use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{PeerBackend, PeerBackendFactory, PeerEvent, PeerState};
use crate::error::SessionError;
use crate::models::{PairingSession, Role};

/// Label of the channel carrying direction/capture commands.
const COMMAND_CHANNEL: &str = "commands";
/// Label of the channel carrying JPEG viewfinder frames.
const VIDEO_CHANNEL: &str = "video-frames";

type ChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

fn map_state(state: RTCPeerConnectionState) -> Option<PeerState> {
    match state {
        RTCPeerConnectionState::Connecting => Some(PeerState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerState::Failed),
        // New is the manager's starting point and Closed is only reached
        // through destroy; neither is a backend-driven transition.
        _ => None,
    }
}

/// Builds `webrtc`-crate backends.
#[derive(Debug, Clone)]
pub struct RtcBackendFactory {
    pub ice_servers: Vec<String>,
}

#[async_trait]
impl PeerBackendFactory for RtcBackendFactory {
    async fn create(
        &self,
        session: &PairingSession,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerBackend>, SessionError> {
        let backend = RtcBackend::connect(self.ice_servers.clone(), session.role, events).await?;
        Ok(Arc::new(backend))
    }
}

/// Peer connection over the `webrtc` crate with two data channels: commands
/// and video frames. The offerer (camera) creates both channels up front;
/// the answerer adopts them as they are announced.
pub struct RtcBackend {
    pc: Arc<RTCPeerConnection>,
    command_dc: ChannelSlot,
    video_dc: ChannelSlot,
}

impl RtcBackend {
    async fn connect(
        ice_servers: Vec<String>,
        role: Role,
        event_tx: mpsc::Sender<PeerEvent>,
    ) -> Result<Self, SessionError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| SessionError::NegotiationFailed(format!("codec registration: {e}")))?;

        let mut registry = webrtc::interceptor::registry::Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| SessionError::NegotiationFailed(format!("interceptor registry: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_servers,
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| SessionError::NegotiationFailed(format!("peer connection: {e}")))?,
        );

        let command_dc: ChannelSlot = Arc::new(Mutex::new(None));
        let video_dc: ChannelSlot = Arc::new(Mutex::new(None));

        let state_tx = event_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            Box::pin(async move {
                info!("peer connection state: {state}");
                if let Some(mapped) = map_state(state) {
                    let _ = tx.send(PeerEvent::StateChanged(mapped)).await;
                }
            })
        }));

        let ice_tx = event_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = ice_tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            if let Ok(json) = serde_json::to_string(&init) {
                                let _ = tx.send(PeerEvent::LocalCandidate(json)).await;
                            }
                        }
                        Err(e) => warn!("failed to serialize ICE candidate: {e}"),
                    }
                }
            })
        }));

        if role == Role::Camera {
            let cmd = pc
                .create_data_channel(COMMAND_CHANNEL, None)
                .await
                .map_err(|e| SessionError::NegotiationFailed(format!("command channel: {e}")))?;
            Self::adopt_channel(&command_dc, &event_tx, cmd, true);

            let vid = pc
                .create_data_channel(VIDEO_CHANNEL, None)
                .await
                .map_err(|e| SessionError::NegotiationFailed(format!("video channel: {e}")))?;
            Self::adopt_channel(&video_dc, &event_tx, vid, false);
        }

        // The answerer adopts channels the offerer announced.
        let dc_event_tx = event_tx.clone();
        let dc_command = command_dc.clone();
        let dc_video = video_dc.clone();
        pc.on_data_channel(Box::new(move |dc| {
            let tx = dc_event_tx.clone();
            let command_slot = dc_command.clone();
            let video_slot = dc_video.clone();
            Box::pin(async move {
                info!("received data channel '{}'", dc.label());
                match dc.label() {
                    COMMAND_CHANNEL => Self::adopt_channel(&command_slot, &tx, dc, true),
                    VIDEO_CHANNEL => Self::adopt_channel(&video_slot, &tx, dc, false),
                    other => debug!("ignoring unknown data channel '{other}'"),
                }
            })
        }));

        Ok(Self {
            pc,
            command_dc,
            video_dc,
        })
    }

    /// Store the channel for sending and wire its handlers.
    fn adopt_channel(
        slot: &ChannelSlot,
        event_tx: &mpsc::Sender<PeerEvent>,
        dc: Arc<RTCDataChannel>,
        is_command: bool,
    ) {
        let slot_store = slot.clone();
        let dc_store = dc.clone();
        tokio::spawn(async move {
            slot_store.lock().await.replace(dc_store);
        });

        if is_command {
            let open_tx = event_tx.clone();
            dc.on_open(Box::new(move || {
                let tx = open_tx.clone();
                Box::pin(async move {
                    let _ = tx.send(PeerEvent::CommandChannelOpen).await;
                })
            }));
        }

        let msg_tx = event_tx.clone();
        dc.on_message(Box::new(move |msg| {
            let tx = msg_tx.clone();
            Box::pin(async move {
                let event = if is_command {
                    PeerEvent::CommandData(msg.data)
                } else {
                    PeerEvent::VideoData(msg.data)
                };
                let _ = tx.send(event).await;
            })
        }));
    }

    async fn open_channel(slot: &ChannelSlot) -> Result<Arc<RTCDataChannel>, SessionError> {
        let dc = slot
            .lock()
            .await
            .clone()
            .ok_or_else(|| SessionError::Transport("data channel not negotiated".into()))?;
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(SessionError::Transport("data channel not open".into()));
        }
        Ok(dc)
    }
}

#[async_trait]
impl PeerBackend for RtcBackend {
    async fn create_offer(&self) -> Result<String, SessionError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| SessionError::NegotiationFailed(format!("create offer: {e}")))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| SessionError::NegotiationFailed(format!("set local description: {e}")))?;
        serde_json::to_string(&offer).map_err(|e| SessionError::Transport(e.to_string()))
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String, SessionError> {
        let offer: RTCSessionDescription = serde_json::from_str(sdp)
            .map_err(|e| SessionError::NegotiationFailed(format!("parse offer: {e}")))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| SessionError::NegotiationFailed(format!("set remote description: {e}")))?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| SessionError::NegotiationFailed(format!("create answer: {e}")))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| SessionError::NegotiationFailed(format!("set local description: {e}")))?;
        serde_json::to_string(&answer).map_err(|e| SessionError::Transport(e.to_string()))
    }

    async fn accept_answer(&self, sdp: &str) -> Result<(), SessionError> {
        let answer: RTCSessionDescription = serde_json::from_str(sdp)
            .map_err(|e| SessionError::NegotiationFailed(format!("parse answer: {e}")))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| SessionError::NegotiationFailed(format!("set remote description: {e}")))
    }

    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), SessionError> {
        let init: RTCIceCandidateInit = serde_json::from_str(candidate)
            .map_err(|e| SessionError::NegotiationFailed(format!("parse candidate: {e}")))?;
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| SessionError::NegotiationFailed(format!("add candidate: {e}")))
    }

    async fn send_command_data(&self, data: Bytes) -> Result<(), SessionError> {
        let dc = Self::open_channel(&self.command_dc).await?;
        dc.send(&data)
            .await
            .map(|_| ())
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    async fn send_video_data(&self, data: Bytes) -> Result<(), SessionError> {
        let dc = Self::open_channel(&self.video_dc).await?;
        dc.send(&data)
            .await
            .map(|_| ())
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("error closing peer connection: {e}");
        }
    }
}
