use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{PeerBackend, PeerBackendFactory, PeerEvent, PeerState};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::events::{AppEvent, EventSender};
use crate::media::{MediaSource, MediaSourceFactory};
use crate::models::{CommandFrame, CommandKind, PairingSession, Role, VideoFrame};
use crate::signaling::transport::SignalingTransport;
use crate::signaling::{SignalBody, SignalingChannel, SignalingMessage};
use crate::singleflight::SingleFlight;

/// Max data channel message size (under the 16KB SCTP limit).
const MAX_DC_MSG_SIZE: usize = 15_000;
/// Chunk header: 'C' + frame_id(4) + total_chunks(2) + chunk_index(2).
const CHUNK_HEADER_SIZE: usize = 9;
/// Payload prefix on every frame: width(4) + height(4), then JPEG bytes.
const FRAME_HEADER_SIZE: usize = 8;
/// Max payload data per chunk.
const MAX_CHUNK_DATA: usize = MAX_DC_MSG_SIZE - CHUNK_HEADER_SIZE;

/// Per-negotiation bookkeeping. Candidates that arrive before the remote
/// description are buffered here and flushed once it lands; dropping them
/// instead is a classic way to never converge.
#[derive(Default)]
struct Negotiation {
    remote_desc_applied: bool,
    pending_candidates: Vec<String>,
    /// Camera: set once the remote answer is applied; stops the offer loop.
    answer_applied: bool,
    /// Director: the offer we answered and the answer we produced. The
    /// answer is re-sent when the same offer shows up again (lost answer);
    /// a different offer starts a replacement negotiation.
    answered: Option<(String, String)>,
}

/// Everything owned by one init/destroy cycle.
struct ActiveConnection {
    generation: u64,
    session: PairingSession,
    channel: Arc<SignalingChannel>,
    backend: Arc<dyn PeerBackend>,
    negotiation: Arc<Mutex<Negotiation>>,
    media: Option<Box<dyn MediaSource>>,
    last_frame: Arc<SyncMutex<Option<VideoFrame>>>,
    flash_on: bool,
    cmd_seq_out: u64,
    cmd_seq_in: u64,
    peer_pump: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    config: SessionConfig,
    event_tx: EventSender,
    transport: Arc<dyn SignalingTransport>,
    backends: Arc<dyn PeerBackendFactory>,
    media: Arc<dyn MediaSourceFactory>,
    /// Liveness token. Every init captures the value it bumped to; destroy
    /// bumps again, so pumps and callbacks of a superseded instance compare
    /// stale and go quiet instead of corrupting the new one.
    generation: AtomicU64,
    state: SyncMutex<PeerState>,
    active: Mutex<Option<ActiveConnection>>,
    flight: SingleFlight<Result<(), SessionError>>,
}

/// Owns the peer connection for one session: negotiation over the signaling
/// channel, the state machine, local media, and the command/video data
/// paths. Healing is not this type's job: `disconnected`/`failed` only
/// leave through an explicit `destroy` + fresh `init` from the lifecycle
/// controller.
#[derive(Clone)]
pub struct PeerManager {
    inner: Arc<Inner>,
}

impl PeerManager {
    pub fn new(
        config: SessionConfig,
        event_tx: EventSender,
        transport: Arc<dyn SignalingTransport>,
        backends: Arc<dyn PeerBackendFactory>,
        media: Arc<dyn MediaSourceFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                event_tx,
                transport,
                backends,
                media,
                generation: AtomicU64::new(0),
                state: SyncMutex::new(PeerState::New),
                active: Mutex::new(None),
                flight: SingleFlight::new(),
            }),
        }
    }

    /// Open the signaling channel, acquire media (camera role) and start
    /// negotiating. Concurrent calls coalesce into the in-flight attempt;
    /// calling again after a completed init without a `destroy` in between
    /// is rejected with `AlreadyInitializing`.
    ///
    /// Every state transition is delivered on the event bus exactly once,
    /// in order, starting with `connecting`.
    pub async fn init(
        &self,
        session: &PairingSession,
        is_reconnect: bool,
    ) -> Result<(), SessionError> {
        let inner = self.inner.clone();
        let session = session.clone();
        self.inner
            .flight
            .run(move || init_inner(inner, session, is_reconnect))
            .await
    }

    /// Tear down media, the backend and the signaling subscription, and
    /// transition to `closed`. Idempotent, and safe while an `init` is
    /// still in flight: the stale init observes the generation bump and
    /// abandons.
    pub async fn destroy(&self) {
        let inner = &self.inner;
        inner.generation.fetch_add(1, Ordering::SeqCst);
        let conn = inner.active.lock().await.take();
        if let Some(conn) = conn {
            info!(session_id = %conn.session.session_id, "destroying peer connection");
            conn.peer_pump.abort();
            for task in &conn.tasks {
                task.abort();
            }
            if let Some(media) = &conn.media {
                media.stop();
            }
            conn.backend.close().await;
            conn.channel.close().await;
        }

        let mut st = inner.state.lock();
        if !st.is_closed() {
            *st = PeerState::Closed;
            let _ = inner.event_tx.send(AppEvent::ConnectionStateChanged {
                state: PeerState::Closed,
            });
        }
    }

    /// Send a command to the paired device. Prefers the command data
    /// channel; falls back to the signaling channel when it is not open.
    /// Never gated on media or connection state, since direction guidance
    /// stays useful while video is still negotiating or has failed.
    pub async fn send_command(&self, kind: CommandKind) -> Result<(), SessionError> {
        let (backend, channel, frame) = {
            let mut active = self.inner.active.lock().await;
            let conn = active.as_mut().ok_or(SessionError::Closed)?;
            conn.cmd_seq_out += 1;
            (
                conn.backend.clone(),
                conn.channel.clone(),
                CommandFrame {
                    seq: conn.cmd_seq_out,
                    kind,
                },
            )
        };
        let data =
            serde_json::to_vec(&frame).map_err(|e| SessionError::Transport(e.to_string()))?;
        match backend.send_command_data(Bytes::from(data)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!("command channel unavailable ({e}); falling back to signaling");
                channel.send(SignalBody::Command(frame)).await
            }
        }
    }

    /// Toggle local video production without touching the connection.
    pub async fn set_video_enabled(&self, enabled: bool) {
        let active = self.inner.active.lock().await;
        if let Some(media) = active.as_ref().and_then(|c| c.media.as_deref()) {
            info!("local video {}", if enabled { "enabled" } else { "paused" });
            media.set_enabled(enabled);
        }
    }

    pub fn state(&self) -> PeerState {
        *self.inner.state.lock()
    }
}

impl Inner {
    fn stale(&self, gen: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != gen
    }

    /// Apply a state transition for generation `gen`, emitting it exactly
    /// once. Stale generations and invalid transitions are dropped.
    fn transition(&self, gen: u64, to: PeerState) {
        if self.stale(gen) {
            debug!("suppressing transition to {to} from a superseded instance");
            return;
        }
        let mut st = self.state.lock();
        if !st.can_transition(to) {
            debug!("ignoring invalid transition {} -> {to}", *st);
            return;
        }
        info!("peer connection {} -> {to}", *st);
        *st = to;
        let _ = self
            .event_tx
            .send(AppEvent::ConnectionStateChanged { state: to });
    }

    /// Restart the machine for a replacement negotiation: surface the drop
    /// if we were connected, then run `connecting` again.
    fn reset_for_renegotiation(&self, gen: u64) {
        if self.stale(gen) {
            return;
        }
        {
            let mut st = self.state.lock();
            if *st == PeerState::Connected {
                *st = PeerState::Disconnected;
                let _ = self.event_tx.send(AppEvent::ConnectionStateChanged {
                    state: PeerState::Disconnected,
                });
            }
            *st = PeerState::New;
        }
        self.transition(gen, PeerState::Connecting);
    }

    async fn current_backend(&self, gen: u64) -> Option<Arc<dyn PeerBackend>> {
        let active = self.active.lock().await;
        active
            .as_ref()
            .filter(|c| c.generation == gen)
            .map(|c| c.backend.clone())
    }

    async fn current_channel(&self, gen: u64) -> Option<Arc<SignalingChannel>> {
        let active = self.active.lock().await;
        active
            .as_ref()
            .filter(|c| c.generation == gen)
            .map(|c| c.channel.clone())
    }

    async fn current_negotiation(&self, gen: u64) -> Option<Arc<Mutex<Negotiation>>> {
        let active = self.active.lock().await;
        active
            .as_ref()
            .filter(|c| c.generation == gen)
            .map(|c| c.negotiation.clone())
    }

    /// Apply an inbound command frame. Duplicate or out-of-date sequence
    /// numbers are dropped, so redundant delivery over both paths cannot
    /// double-apply a capture.
    async fn handle_command(self: &Arc<Self>, gen: u64, frame: CommandFrame) {
        let mut active = self.active.lock().await;
        let Some(conn) = active.as_mut().filter(|c| c.generation == gen) else {
            return;
        };
        if frame.seq <= conn.cmd_seq_in {
            debug!("dropping duplicate command seq {}", frame.seq);
            return;
        }
        conn.cmd_seq_in = frame.seq;

        match frame.kind {
            CommandKind::Direction { direction } => {
                let _ = self
                    .event_tx
                    .send(AppEvent::DirectionReceived { direction });
            }
            CommandKind::Capture => {
                let _ = self.event_tx.send(AppEvent::CaptureRequested);
                if conn.session.role.is_camera() {
                    let grabbed = conn.last_frame.lock().clone();
                    match grabbed {
                        Some(frame) => {
                            let _ = self.event_tx.send(AppEvent::PhotoCaptured(frame));
                        }
                        None => warn!("capture requested but no frame available yet"),
                    }
                }
            }
            CommandKind::FlashToggle => {
                if conn.session.role.is_camera() {
                    conn.flash_on = !conn.flash_on;
                    if let Some(media) = conn.media.as_deref() {
                        media.set_flash(conn.flash_on);
                    }
                    let _ = self.event_tx.send(AppEvent::FlashToggled {
                        on: conn.flash_on,
                    });
                } else {
                    debug!("ignoring flash-toggle on the director side");
                }
            }
        }
    }
}

async fn init_inner(
    inner: Arc<Inner>,
    session: PairingSession,
    is_reconnect: bool,
) -> Result<(), SessionError> {
    if session.is_expired() {
        return Err(SessionError::SessionExpired);
    }
    {
        let active = inner.active.lock().await;
        if active.is_some() {
            return Err(SessionError::AlreadyInitializing);
        }
    }

    let gen = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
    *inner.state.lock() = PeerState::New;
    inner.transition(gen, PeerState::Connecting);
    info!(
        session_id = %session.session_id,
        role = ?session.role,
        is_reconnect,
        "initializing peer connection"
    );

    let (channel, messages) = match SignalingChannel::open(
        inner.transport.clone(),
        &session,
        inner.config.channel_open_timeout,
    )
    .await
    {
        Ok(opened) => opened,
        Err(e) => {
            inner.transition(gen, PeerState::Failed);
            return Err(e);
        }
    };
    let channel = Arc::new(channel);

    let (peer_tx, peer_rx) = mpsc::channel(256);
    let backend = match inner.backends.create(&session, peer_tx).await {
        Ok(backend) => backend,
        Err(e) => {
            channel.close().await;
            inner.transition(gen, PeerState::Failed);
            return Err(e);
        }
    };

    // Media failure degrades to a command-only session; the director can
    // still steer blind and the error is surfaced once.
    let mut media = None;
    let mut frames = None;
    if session.role.is_camera() {
        match inner.media.open(&inner.config.camera) {
            Ok((source, rx)) => {
                media = Some(source);
                frames = Some(rx);
            }
            Err(e) => {
                warn!("local media unavailable: {e}");
                let _ = inner.event_tx.send(AppEvent::Error(e));
            }
        }
    }

    let last_frame = Arc::new(SyncMutex::new(None));
    let negotiation = Arc::new(Mutex::new(Negotiation::default()));
    let role = session.role;

    {
        let mut active = inner.active.lock().await;
        if inner.stale(gen) {
            drop(active);
            backend.close().await;
            channel.close().await;
            if let Some(media) = &media {
                media.stop();
            }
            return Err(SessionError::Closed);
        }
        *active = Some(ActiveConnection {
            generation: gen,
            session: session.clone(),
            channel: channel.clone(),
            backend: backend.clone(),
            negotiation: negotiation.clone(),
            media,
            last_frame: last_frame.clone(),
            flash_on: false,
            cmd_seq_out: 0,
            cmd_seq_in: 0,
            peer_pump: tokio::spawn(peer_pump(inner.clone(), gen, peer_rx)),
            tasks: Vec::new(),
        });
    }

    let mut tasks = vec![
        tokio::spawn(signal_pump(inner.clone(), gen, role, messages)),
        tokio::spawn(negotiation_watchdog(inner.clone(), gen)),
    ];
    if let Some(frames) = frames {
        tasks.push(tokio::spawn(frame_pump(
            inner.clone(),
            gen,
            frames,
            last_frame,
        )));
    }
    if role.is_camera() {
        tasks.push(tokio::spawn(offer_loop(inner.clone(), gen)));
    }

    let mut active = inner.active.lock().await;
    match active.as_mut() {
        Some(conn) if conn.generation == gen => {
            conn.tasks = tasks;
            Ok(())
        }
        _ => {
            for task in &tasks {
                task.abort();
            }
            Err(SessionError::Closed)
        }
    }
}

/// Camera: send the offer until an answer is applied. Signaling is lossy
/// and the director may subscribe late, so one shot is not enough.
async fn offer_loop(inner: Arc<Inner>, gen: u64) {
    let Some(backend) = inner.current_backend(gen).await else {
        return;
    };
    let offer = match backend.create_offer().await {
        Ok(offer) => offer,
        Err(e) => {
            warn!("failed to create offer: {e}");
            let _ = inner.event_tx.send(AppEvent::Error(e));
            inner.transition(gen, PeerState::Failed);
            return;
        }
    };

    loop {
        if inner.stale(gen) {
            return;
        }
        if let Some(negotiation) = inner.current_negotiation(gen).await {
            if negotiation.lock().await.answer_applied {
                return;
            }
        } else {
            return;
        }
        match inner.current_channel(gen).await {
            Some(channel) => {
                let _ = channel.send(SignalBody::Offer { sdp: offer.clone() }).await;
            }
            None => return,
        }
        tokio::time::sleep(inner.config.offer_retry_interval).await;
    }
}

/// Fail the attempt if `connected` is never reached.
async fn negotiation_watchdog(inner: Arc<Inner>, gen: u64) {
    tokio::time::sleep(inner.config.negotiation_timeout).await;
    if inner.stale(gen) {
        return;
    }
    let still_connecting = *inner.state.lock() == PeerState::Connecting;
    if still_connecting {
        warn!(
            "negotiation did not converge within {:?}",
            inner.config.negotiation_timeout
        );
        let _ = inner.event_tx.send(AppEvent::Error(SessionError::NegotiationFailed(
            "negotiation timed out".into(),
        )));
        inner.transition(gen, PeerState::Failed);
    }
}

/// Dispatch inbound signaling for one connection generation.
async fn signal_pump(
    inner: Arc<Inner>,
    gen: u64,
    role: Role,
    mut messages: mpsc::Receiver<SignalingMessage>,
) {
    while let Some(msg) = messages.recv().await {
        if inner.stale(gen) {
            return;
        }
        match msg.body {
            SignalBody::Offer { sdp } => {
                if role != Role::Director {
                    continue;
                }
                handle_offer(&inner, gen, sdp).await;
            }
            SignalBody::Answer { sdp } => {
                if role != Role::Camera {
                    continue;
                }
                let (Some(backend), Some(negotiation)) = (
                    inner.current_backend(gen).await,
                    inner.current_negotiation(gen).await,
                ) else {
                    return;
                };
                let mut neg = negotiation.lock().await;
                if neg.answer_applied {
                    continue;
                }
                match backend.accept_answer(&sdp).await {
                    Ok(()) => {
                        neg.answer_applied = true;
                        neg.remote_desc_applied = true;
                        flush_candidates(&backend, &mut neg).await;
                    }
                    Err(e) => {
                        warn!("failed to apply answer: {e}");
                        let _ = inner.event_tx.send(AppEvent::Error(e));
                    }
                }
            }
            SignalBody::IceCandidate { candidate } => {
                let (Some(backend), Some(negotiation)) = (
                    inner.current_backend(gen).await,
                    inner.current_negotiation(gen).await,
                ) else {
                    return;
                };
                let mut neg = negotiation.lock().await;
                if neg.remote_desc_applied {
                    if let Err(e) = backend.add_remote_candidate(&candidate).await {
                        debug!("failed to apply candidate: {e}");
                    }
                } else {
                    // Early candidate: hold it until the description lands.
                    neg.pending_candidates.push(candidate);
                }
            }
            SignalBody::Command(frame) => {
                inner.handle_command(gen, frame).await;
            }
        }
    }
}

/// Director side of the offer. First offer: answer it. Same offer again:
/// the answer was lost, re-send it. Different offer: the camera rebuilt its
/// connection, so replace the backend and answer fresh.
async fn handle_offer(inner: &Arc<Inner>, gen: u64, sdp: String) {
    let (Some(backend), Some(negotiation), Some(channel)) = (
        inner.current_backend(gen).await,
        inner.current_negotiation(gen).await,
        inner.current_channel(gen).await,
    ) else {
        return;
    };

    let mut neg = negotiation.lock().await;
    match &neg.answered {
        Some((offer_sdp, answer_sdp)) if *offer_sdp == sdp => {
            let answer = answer_sdp.clone();
            drop(neg);
            let _ = channel.send(SignalBody::Answer { sdp: answer }).await;
        }
        Some(_) => {
            drop(neg);
            renegotiate(inner, gen, sdp).await;
        }
        None => match backend.accept_offer(&sdp).await {
            Ok(answer) => {
                neg.remote_desc_applied = true;
                flush_candidates(&backend, &mut neg).await;
                neg.answered = Some((sdp, answer.clone()));
                drop(neg);
                let _ = channel.send(SignalBody::Answer { sdp: answer }).await;
            }
            Err(e) => {
                warn!("failed to answer offer: {e}");
                let _ = inner.event_tx.send(AppEvent::Error(e));
            }
        },
    }
}

/// Replace the backend in response to a fresh offer mid-session. This is a
/// reaction to the remote peer's explicit re-init, not self-healing.
async fn renegotiate(inner: &Arc<Inner>, gen: u64, offer_sdp: String) {
    info!("fresh offer received mid-session; replacing peer backend");
    let (session, channel) = {
        let active = inner.active.lock().await;
        let Some(conn) = active.as_ref().filter(|c| c.generation == gen) else {
            return;
        };
        (conn.session.clone(), conn.channel.clone())
    };

    let (peer_tx, peer_rx) = mpsc::channel(256);
    let backend = match inner.backends.create(&session, peer_tx).await {
        Ok(backend) => backend,
        Err(e) => {
            warn!("failed to create replacement backend: {e}");
            let _ = inner.event_tx.send(AppEvent::Error(e));
            return;
        }
    };
    let answer = match backend.accept_offer(&offer_sdp).await {
        Ok(answer) => answer,
        Err(e) => {
            warn!("failed to answer replacement offer: {e}");
            let _ = inner.event_tx.send(AppEvent::Error(e));
            backend.close().await;
            return;
        }
    };

    let (old_backend, negotiation) = {
        let mut active = inner.active.lock().await;
        let Some(conn) = active.as_mut().filter(|c| c.generation == gen) else {
            backend.close().await;
            return;
        };
        conn.peer_pump.abort();
        conn.peer_pump = tokio::spawn(peer_pump(inner.clone(), gen, peer_rx));
        let old = std::mem::replace(&mut conn.backend, backend);
        (old, conn.negotiation.clone())
    };

    {
        let mut neg = negotiation.lock().await;
        *neg = Negotiation {
            remote_desc_applied: true,
            answered: Some((offer_sdp, answer.clone())),
            ..Negotiation::default()
        };
    }
    old_backend.close().await;

    inner.reset_for_renegotiation(gen);
    tokio::spawn(negotiation_watchdog(inner.clone(), gen));
    let _ = channel.send(SignalBody::Answer { sdp: answer }).await;
}

/// Pump backend events for one backend instance.
async fn peer_pump(inner: Arc<Inner>, gen: u64, mut events: mpsc::Receiver<PeerEvent>) {
    let mut assembler = ChunkAssembler::default();
    while let Some(event) = events.recv().await {
        if inner.stale(gen) {
            return;
        }
        match event {
            PeerEvent::StateChanged(state) => inner.transition(gen, state),
            PeerEvent::LocalCandidate(candidate) => {
                if let Some(channel) = inner.current_channel(gen).await {
                    let _ = channel.send(SignalBody::IceCandidate { candidate }).await;
                }
            }
            PeerEvent::CommandChannelOpen => debug!("command channel open"),
            PeerEvent::CommandData(data) => match serde_json::from_slice::<CommandFrame>(&data) {
                Ok(frame) => inner.handle_command(gen, frame).await,
                Err(e) => debug!("undecodable command frame: {e}"),
            },
            PeerEvent::VideoData(data) => {
                if let Some(frame) = assembler.push(&data) {
                    let _ = inner.event_tx.send(AppEvent::RemoteFrame(frame));
                }
            }
        }
    }
}

/// Camera: pump local frames to the preview bus and over the video channel.
async fn frame_pump(
    inner: Arc<Inner>,
    gen: u64,
    mut frames: mpsc::Receiver<VideoFrame>,
    last_frame: Arc<SyncMutex<Option<VideoFrame>>>,
) {
    let mut frame_id: u32 = 0;
    while let Some(frame) = frames.recv().await {
        if inner.stale(gen) {
            return;
        }
        *last_frame.lock() = Some(frame.clone());
        let _ = inner.event_tx.send(AppEvent::LocalPreviewFrame(frame.clone()));

        let Some(backend) = inner.current_backend(gen).await else {
            return;
        };
        send_frame(backend.as_ref(), frame_id, &frame).await;
        frame_id = frame_id.wrapping_add(1);
    }
}

/// Ship one frame over the video channel, chunking above the SCTP limit.
async fn send_frame(backend: &dyn PeerBackend, frame_id: u32, frame: &VideoFrame) {
    let mut payload = Vec::with_capacity(FRAME_HEADER_SIZE + frame.jpeg.len());
    payload.extend_from_slice(&frame.width.to_le_bytes());
    payload.extend_from_slice(&frame.height.to_le_bytes());
    payload.extend_from_slice(&frame.jpeg);

    if 1 + payload.len() <= MAX_DC_MSG_SIZE {
        let mut msg = Vec::with_capacity(1 + payload.len());
        msg.push(b'F');
        msg.extend_from_slice(&payload);
        if let Err(e) = backend.send_video_data(Bytes::from(msg)).await {
            debug!("failed to send frame: {e}");
        }
        return;
    }

    let total_chunks = payload.len().div_ceil(MAX_CHUNK_DATA) as u16;
    for chunk_index in 0..total_chunks {
        let start = chunk_index as usize * MAX_CHUNK_DATA;
        let end = usize::min(start + MAX_CHUNK_DATA, payload.len());

        let mut msg = Vec::with_capacity(CHUNK_HEADER_SIZE + (end - start));
        msg.push(b'C');
        msg.extend_from_slice(&frame_id.to_le_bytes());
        msg.extend_from_slice(&total_chunks.to_le_bytes());
        msg.extend_from_slice(&chunk_index.to_le_bytes());
        msg.extend_from_slice(&payload[start..end]);

        if let Err(e) = backend.send_video_data(Bytes::from(msg)).await {
            debug!(
                "failed to send chunk {}/{total_chunks}: {e}",
                chunk_index + 1
            );
        }
    }
}

fn decode_frame_payload(payload: &[u8]) -> Option<VideoFrame> {
    if payload.len() < FRAME_HEADER_SIZE {
        return None;
    }
    let width = u32::from_le_bytes(payload[0..4].try_into().ok()?);
    let height = u32::from_le_bytes(payload[4..8].try_into().ok()?);
    Some(VideoFrame {
        jpeg: payload[FRAME_HEADER_SIZE..].to_vec(),
        width,
        height,
    })
}

/// Reassembles chunked frames; partial frames older than a small window are
/// discarded so one lost chunk cannot leak memory forever.
#[derive(Default)]
struct ChunkAssembler {
    pending: HashMap<u32, (u16, HashMap<u16, Vec<u8>>)>,
}

impl ChunkAssembler {
    fn push(&mut self, data: &[u8]) -> Option<VideoFrame> {
        match data.first()? {
            b'F' => decode_frame_payload(&data[1..]),
            b'C' => {
                if data.len() < CHUNK_HEADER_SIZE {
                    return None;
                }
                let frame_id = u32::from_le_bytes(data[1..5].try_into().ok()?);
                let total_chunks = u16::from_le_bytes(data[5..7].try_into().ok()?);
                let chunk_index = u16::from_le_bytes(data[7..9].try_into().ok()?);
                let chunk = data[CHUNK_HEADER_SIZE..].to_vec();

                self.cleanup(frame_id);

                let entry = self
                    .pending
                    .entry(frame_id)
                    .or_insert_with(|| (total_chunks, HashMap::new()));
                entry.1.insert(chunk_index, chunk);

                if entry.1.len() == total_chunks as usize {
                    let (_, chunks) = self.pending.remove(&frame_id)?;
                    let mut payload = Vec::new();
                    for i in 0..total_chunks {
                        payload.extend_from_slice(chunks.get(&i)?);
                    }
                    decode_frame_payload(&payload)
                } else {
                    None
                }
            }
            other => {
                debug!("unknown video channel message type: {other}");
                None
            }
        }
    }

    /// Keep only partials within a small window of the current frame id.
    fn cleanup(&mut self, current_frame_id: u32) {
        self.pending
            .retain(|id, _| current_frame_id.wrapping_sub(*id) < 4);
    }
}

async fn flush_candidates(backend: &Arc<dyn PeerBackend>, neg: &mut Negotiation) {
    for candidate in neg.pending_candidates.drain(..) {
        if let Err(e) = backend.add_remote_candidate(&candidate).await {
            debug!("failed to apply buffered candidate: {e}");
        }
    }
}
