use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::events::{AppEvent, EventSender};
use crate::models::PairingSession;
use crate::peer::{PeerManager, PeerState};

/// App foreground/background phases, pushed by the embedding platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppPhase {
    Foreground,
    Background,
}

/// Source of app phase transitions. Kept as a trait so the controller never
/// touches a platform API directly.
pub trait AppStateSource: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<AppPhase>;
}

/// Manually driven app state, for tests, the demo, and platform bridges.
pub struct ManualAppState {
    tx: watch::Sender<AppPhase>,
}

impl ManualAppState {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(AppPhase::Foreground);
        Self { tx }
    }

    pub fn set_phase(&self, phase: AppPhase) {
        let _ = self.tx.send(phase);
    }
}

impl Default for ManualAppState {
    fn default() -> Self {
        Self::new()
    }
}

impl AppStateSource for ManualAppState {
    fn subscribe(&self) -> watch::Receiver<AppPhase> {
        self.tx.subscribe()
    }
}

/// Commands accepted by a running lifecycle controller.
#[derive(Debug)]
pub enum LifecycleCommand {
    /// User-triggered reconnect; bypasses the backgrounding/network latches
    /// and resets the attempt counter.
    Reconnect,
    /// Unmount: destroy the connection and exit the loop.
    Shutdown,
}

/// Derived, never-persisted state of one mounted session.
#[derive(Debug, Clone, Default)]
pub struct LifecycleState {
    pub is_connecting: bool,
    pub is_reconnecting: bool,
    /// Monotonic within a run of attempts; reset to 0 on reaching
    /// `connected` and on a manual reconnect.
    pub reconnect_attempt: u32,
    pub last_disconnect_reason: Option<String>,
    /// Latched on background transition, cleared once a reconnect has been
    /// scheduled on the following foreground.
    pub was_backgrounded: bool,
    /// Whether this session ever reached `connected`.
    pub was_connected: bool,
}

/// Why a reconnect was scheduled; picks the settle delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconnectReason {
    Foreground,
    NetworkRestored,
    Manual,
}

/// Reconcile app phase transitions, connection-manager events and manual
/// commands into one coherent sequence of peer-manager calls.
///
/// Scheduling discipline: there is a single pending reconnect deadline;
/// scheduling another overwrites it (only the latest fires) and unmounting
/// cancels it. Peer errors never schedule anything here; reconnects are
/// driven only by the rules below or by an explicit user command.
#[allow(clippy::too_many_arguments)]
pub async fn run_lifecycle(
    manager: PeerManager,
    session: PairingSession,
    config: SessionConfig,
    connection: ConnectionManager,
    mut app_rx: watch::Receiver<AppPhase>,
    mut cmd_rx: mpsc::Receiver<LifecycleCommand>,
    event_tx: EventSender,
    state_tx: watch::Sender<LifecycleState>,
) {
    let mut conn_rx = connection.subscribe();
    let mut bus_rx = event_tx.subscribe();
    let mut st = LifecycleState::default();
    let mut pending: Option<(Instant, ReconnectReason)> = None;
    let mut app_alive = true;

    // Initial connect.
    st.is_connecting = true;
    let _ = state_tx.send(st.clone());
    if let Err(e) = manager.init(&session, false).await {
        warn!("initial connect failed: {e}");
        let _ = event_tx.send(AppEvent::Error(e));
    }
    st.is_connecting = false;
    let _ = state_tx.send(st.clone());

    loop {
        let deadline = pending.map(|(at, _)| at);
        tokio::select! {
            _ = tokio::time::sleep_until(
                deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))
            ), if deadline.is_some() => {
                let Some((_, reason)) = pending.take() else { continue };
                st.is_reconnecting = true;
                st.reconnect_attempt += 1;
                let _ = state_tx.send(st.clone());
                info!(?reason, attempt = st.reconnect_attempt, "reconnecting");
                let _ = event_tx.send(AppEvent::Reconnecting { attempt: st.reconnect_attempt });

                manager.destroy().await;
                if let Err(e) = manager.init(&session, true).await {
                    warn!("reconnect attempt failed: {e}");
                    let _ = event_tx.send(AppEvent::Error(e));
                }
            }

            changed = app_rx.changed(), if app_alive => {
                if changed.is_err() {
                    app_alive = false;
                    continue;
                }
                let phase = *app_rx.borrow_and_update();
                match phase {
                    AppPhase::Background => {
                        info!("app moved to background");
                        if session.role.is_camera() && config.pause_video_on_background {
                            // Pause tracks only: the connection and command
                            // path survive, and no renegotiation is needed
                            // on return.
                            manager.set_video_enabled(false).await;
                        }
                        st.was_backgrounded = true;
                        let _ = state_tx.send(st.clone());
                    }
                    AppPhase::Foreground => {
                        info!("app moved to foreground");
                        // Tracks first: cheap and immediate.
                        manager.set_video_enabled(true).await;
                        if st.was_connected
                            && st.was_backgrounded
                            && st.reconnect_attempt < config.max_reconnect_attempts
                        {
                            pending = Some((
                                Instant::now() + config.foreground_settle,
                                ReconnectReason::Foreground,
                            ));
                        }
                        st.was_backgrounded = false;
                        let _ = state_tx.send(st.clone());
                    }
                }
            }

            event = conn_rx.recv() => match event {
                Ok(ConnectionEvent::NetworkChanged { is_connected }) => {
                    if is_connected {
                        if st.was_connected
                            && st.reconnect_attempt < config.max_reconnect_attempts
                        {
                            pending = Some((
                                Instant::now() + config.network_settle,
                                ReconnectReason::NetworkRestored,
                            ));
                        }
                    } else {
                        st.last_disconnect_reason = Some("network lost".into());
                        let _ = state_tx.send(st.clone());
                    }
                }
                Ok(ConnectionEvent::SessionExpired) => {
                    pending = None;
                    manager.destroy().await;
                    st.last_disconnect_reason = Some("session expired".into());
                    let _ = state_tx.send(st.clone());
                    let _ = event_tx.send(AppEvent::SessionExpired);
                    // Fatal for this mount: re-pairing is required.
                    break;
                }
                Ok(ConnectionEvent::ReconnectSucceeded) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("lifecycle lagged {n} connection events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },

            cmd = cmd_rx.recv() => match cmd {
                Some(LifecycleCommand::Reconnect) => {
                    info!("manual reconnect requested");
                    st.reconnect_attempt = 0;
                    let _ = state_tx.send(st.clone());
                    pending = Some((
                        Instant::now() + config.manual_settle,
                        ReconnectReason::Manual,
                    ));
                }
                Some(LifecycleCommand::Shutdown) | None => {
                    pending = None;
                    manager.destroy().await;
                    break;
                }
            },

            event = bus_rx.recv() => match event {
                Ok(AppEvent::ConnectionStateChanged { state }) => match state {
                    PeerState::Connected => {
                        st.was_connected = true;
                        st.reconnect_attempt = 0;
                        st.last_disconnect_reason = None;
                        if st.is_reconnecting {
                            st.is_reconnecting = false;
                            let _ = event_tx.send(AppEvent::Reconnected);
                            connection.report_reconnect_success();
                        }
                        let _ = state_tx.send(st.clone());
                    }
                    PeerState::Disconnected => {
                        st.last_disconnect_reason = Some("peer connection disconnected".into());
                        let _ = state_tx.send(st.clone());
                    }
                    PeerState::Failed => {
                        st.last_disconnect_reason = Some("peer connection failed".into());
                        let _ = state_tx.send(st.clone());
                    }
                    _ => {}
                },
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    debug!("lifecycle lagged {n} app events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!("lifecycle controller exited");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::config::CameraConfig;
    use crate::events::create_event_bus;
    use crate::media::pattern::TestPatternFactory;
    use crate::models::Role;
    use crate::peer::memory::MemoryBackendFactory;
    use crate::signaling::transport::{MemoryHub, SignalingTransport};

    fn test_config() -> SessionConfig {
        SessionConfig {
            channel_open_timeout: Duration::from_millis(500),
            negotiation_timeout: Duration::from_secs(5),
            offer_retry_interval: Duration::from_millis(30),
            foreground_settle: Duration::from_millis(80),
            network_settle: Duration::from_millis(120),
            manual_settle: Duration::from_millis(40),
            max_reconnect_attempts: 5,
            pause_video_on_background: true,
            ice_servers: Vec::new(),
            camera: CameraConfig {
                fps: 30,
                width: 16,
                height: 16,
                ..Default::default()
            },
        }
    }

    fn session(role: Role) -> PairingSession {
        let (me, peer) = match role {
            Role::Camera => ("cam", "dir"),
            Role::Director => ("dir", "cam"),
        };
        PairingSession {
            session_id: "sess-lc".into(),
            my_device_id: me.into(),
            paired_device_id: peer.into(),
            role,
            expires_at: Utc::now() + chrono::Duration::minutes(10),
        }
    }

    struct Harness {
        manager: PeerManager,
        events: crate::events::EventReceiver,
        app: ManualAppState,
        network: Arc<crate::connection::ManualNetwork>,
        cmd_tx: mpsc::Sender<LifecycleCommand>,
        _task: tokio::task::JoinHandle<()>,
    }

    /// Spin up a camera lifecycle plus a bare director manager over memory
    /// transports; returns the camera harness and the director (kept alive
    /// by the caller so it answers across camera reconnects).
    async fn connected_pair() -> (Harness, PeerManager) {
        let hub = Arc::new(MemoryHub::new());
        let backends = Arc::new(MemoryBackendFactory::new());
        let config = test_config();

        let (dir_tx, _dir_rx) = create_event_bus();
        let director = PeerManager::new(
            config.clone(),
            dir_tx,
            hub.clone() as Arc<dyn SignalingTransport>,
            backends.clone(),
            Arc::new(TestPatternFactory),
        );
        director.init(&session(Role::Director), false).await.unwrap();

        let (event_tx, events) = create_event_bus();
        let manager = PeerManager::new(
            config.clone(),
            event_tx.clone(),
            hub.clone() as Arc<dyn SignalingTransport>,
            backends.clone(),
            Arc::new(TestPatternFactory),
        );
        let connection = ConnectionManager::new();
        let network = Arc::new(crate::connection::ManualNetwork::new(true));
        let _net_task = connection.watch_network(network.as_ref());
        let app = ManualAppState::new();
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (state_tx, _state_rx) = watch::channel(LifecycleState::default());

        let task = tokio::spawn(run_lifecycle(
            manager.clone(),
            session(Role::Camera),
            config,
            connection,
            app.subscribe(),
            cmd_rx,
            event_tx,
            state_tx,
        ));

        (
            Harness {
                manager,
                events,
                app,
                network,
                cmd_tx,
                _task: task,
            },
            director,
        )
    }

    async fn wait_for_state(
        events: &mut crate::events::EventReceiver,
        want: PeerState,
        within: Duration,
    ) {
        tokio::time::timeout(within, async {
            loop {
                if let Ok(AppEvent::ConnectionStateChanged { state }) = events.recv().await {
                    if state == want {
                        return;
                    }
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("did not reach {want} in time"));
    }

    #[tokio::test]
    async fn background_foreground_schedules_exactly_one_reconnect() {
        let (mut harness, _director) = connected_pair().await;
        wait_for_state(&mut harness.events, PeerState::Connected, Duration::from_secs(3)).await;

        harness.app.set_phase(AppPhase::Background);
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Foreground events in quick succession: only the latest scheduled
        // attempt may fire.
        harness.app.set_phase(AppPhase::Foreground);
        harness.app.set_phase(AppPhase::Background);
        harness.app.set_phase(AppPhase::Foreground);

        // Count every Reconnecting event until the session is connected
        // again and the settle window has long passed.
        let mut reconnecting = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        let mut reconnected = false;
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(300), harness.events.recv()).await {
                Ok(Ok(AppEvent::Reconnecting { .. })) => reconnecting += 1,
                Ok(Ok(AppEvent::ConnectionStateChanged {
                    state: PeerState::Connected,
                })) => reconnected = true,
                Ok(Ok(_)) => {}
                Ok(Err(_)) => break,
                Err(_) if reconnected => break,
                Err(_) => {}
            }
        }
        assert!(reconnected, "must reconnect after foreground settle");
        assert_eq!(reconnecting, 1, "only the latest timer may fire");

        harness.cmd_tx.send(LifecycleCommand::Shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn network_restore_triggers_reconnect_after_settle() {
        let (mut harness, _director) = connected_pair().await;
        wait_for_state(&mut harness.events, PeerState::Connected, Duration::from_secs(3)).await;

        harness.network.set_connected(false);
        tokio::time::sleep(Duration::from_millis(30)).await;
        harness.network.set_connected(true);

        // Settle delay for network restore, then destroy + init again.
        wait_for_state(&mut harness.events, PeerState::Closed, Duration::from_secs(3)).await;
        wait_for_state(&mut harness.events, PeerState::Connected, Duration::from_secs(3)).await;

        harness.cmd_tx.send(LifecycleCommand::Shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn manual_reconnect_bypasses_latches() {
        let (mut harness, _director) = connected_pair().await;
        wait_for_state(&mut harness.events, PeerState::Connected, Duration::from_secs(3)).await;

        // No backgrounding, no network change: a manual request still cycles.
        harness.cmd_tx.send(LifecycleCommand::Reconnect).await.unwrap();
        wait_for_state(&mut harness.events, PeerState::Closed, Duration::from_secs(3)).await;
        wait_for_state(&mut harness.events, PeerState::Connected, Duration::from_secs(3)).await;

        harness.manager.destroy().await;
        harness.cmd_tx.send(LifecycleCommand::Shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn session_expiry_is_fatal_and_not_retried() {
        let hub = Arc::new(MemoryHub::new());
        let backends = Arc::new(MemoryBackendFactory::new());
        let config = test_config();

        let (event_tx, mut events) = create_event_bus();
        let manager = PeerManager::new(
            config.clone(),
            event_tx.clone(),
            hub as Arc<dyn SignalingTransport>,
            backends,
            Arc::new(TestPatternFactory),
        );
        let connection = ConnectionManager::new();
        let app = ManualAppState::new();
        let (_cmd_tx, cmd_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(LifecycleState::default());

        let mut sess = session(Role::Camera);
        sess.expires_at = Utc::now() + chrono::Duration::milliseconds(300);
        let expiry = connection.watch_expiry(&sess);

        let task = tokio::spawn(run_lifecycle(
            manager,
            sess,
            config,
            connection,
            app.subscribe(),
            cmd_rx,
            event_tx,
            state_tx,
        ));

        let saw_expired = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if let Ok(AppEvent::SessionExpired) = events.recv().await {
                    return true;
                }
            }
        })
        .await
        .unwrap_or(false);
        assert!(saw_expired);

        // The controller exits instead of retrying.
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("lifecycle must exit on expiry")
            .unwrap();
        assert_eq!(
            state_rx.borrow().last_disconnect_reason.as_deref(),
            Some("session expired")
        );
        expiry.abort();
    }
}
