//! End-to-end session scenarios over the in-process transports: both roles
//! negotiating through the signaling fabric, video flowing camera to
//! director, commands surviving a dead media path, and the lifecycle
//! controller healing a backgrounded session.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use shuttr::media::pattern::TestPatternFactory;
use shuttr::pairing::PairingStore;
use shuttr::peer::memory::MemoryBackendFactory;
use shuttr::{
    create_event_bus, start_session, AppEvent, AppPhase, CommandKind, ConnectionManager,
    Direction, EventReceiver, LifecycleCommand, ManualAppState, MemoryHub, MemoryPairingStore,
    PairingSession, PeerManager, PeerState, Role, SessionConfig, SignalingTransport,
};

fn test_config(role: Role) -> SessionConfig {
    SessionConfig {
        channel_open_timeout: Duration::from_millis(500),
        negotiation_timeout: Duration::from_secs(5),
        offer_retry_interval: Duration::from_millis(30),
        foreground_settle: Duration::from_millis(80),
        network_settle: Duration::from_millis(120),
        manual_settle: Duration::from_millis(40),
        camera: shuttr::CameraConfig {
            fps: 30,
            width: 16,
            height: 16,
            ..Default::default()
        },
        ..SessionConfig::for_role(role)
    }
}

fn session(session_id: &str, role: Role) -> PairingSession {
    let (me, peer) = match role {
        Role::Camera => ("cam-device", "dir-device"),
        Role::Director => ("dir-device", "cam-device"),
    };
    PairingSession {
        session_id: session_id.into(),
        my_device_id: me.into(),
        paired_device_id: peer.into(),
        role,
        expires_at: Utc::now() + chrono::Duration::minutes(10),
    }
}

fn manager(
    role: Role,
    hub: &Arc<MemoryHub>,
    backends: &Arc<MemoryBackendFactory>,
) -> (PeerManager, EventReceiver) {
    let (event_tx, events) = create_event_bus();
    let manager = PeerManager::new(
        test_config(role),
        event_tx,
        hub.clone() as Arc<dyn SignalingTransport>,
        backends.clone(),
        Arc::new(TestPatternFactory),
    );
    (manager, events)
}

async fn wait_for(events: &mut EventReceiver, mut pred: impl FnMut(&AppEvent) -> bool) {
    use tokio::sync::broadcast::error::RecvError;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return,
                Ok(_) => {}
                // Frame events outpace a slow test receiver; skipped
                // backlog is fine here.
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event");
}

#[tokio::test]
async fn both_roles_reach_connected_with_an_exact_camera_sequence() {
    let hub = Arc::new(MemoryHub::new());
    let backends = Arc::new(MemoryBackendFactory::new());
    let (camera, mut camera_events) = manager(Role::Camera, &hub, &backends);
    let (director, mut director_events) = manager(Role::Director, &hub, &backends);

    let camera_session = session("sess-conn", Role::Camera);
    let director_session = session("sess-conn", Role::Director);
    let (a, b) = tokio::join!(
        camera.init(&camera_session, false),
        director.init(&director_session, false),
    );
    a.unwrap();
    b.unwrap();

    // The camera's transition sequence is exactly connecting, connected.
    let mut camera_states = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while camera_states.last() != Some(&PeerState::Connected) {
            if let Ok(AppEvent::ConnectionStateChanged { state }) = camera_events.recv().await {
                camera_states.push(state);
            }
        }
    })
    .await
    .expect("camera never connected");
    assert_eq!(
        camera_states,
        vec![PeerState::Connecting, PeerState::Connected]
    );

    wait_for(&mut director_events, |event| {
        matches!(
            event,
            AppEvent::ConnectionStateChanged {
                state: PeerState::Connected
            }
        )
    })
    .await;

    camera.destroy().await;
    director.destroy().await;
}

#[tokio::test]
async fn video_flows_and_capture_grabs_the_latest_frame() {
    let hub = Arc::new(MemoryHub::new());
    let backends = Arc::new(MemoryBackendFactory::new());
    let (camera, mut camera_events) = manager(Role::Camera, &hub, &backends);
    let (director, mut director_events) = manager(Role::Director, &hub, &backends);

    camera
        .init(&session("sess-video", Role::Camera), false)
        .await
        .unwrap();
    director
        .init(&session("sess-video", Role::Director), false)
        .await
        .unwrap();

    // Viewfinder frames reach the director.
    wait_for(&mut director_events, |event| {
        matches!(event, AppEvent::RemoteFrame(frame) if !frame.jpeg.is_empty())
    })
    .await;

    // The shutter: the camera surfaces the request and the grabbed frame.
    director.send_command(CommandKind::Capture).await.unwrap();
    wait_for(&mut camera_events, |event| {
        matches!(event, AppEvent::CaptureRequested)
    })
    .await;
    wait_for(&mut camera_events, |event| {
        matches!(event, AppEvent::PhotoCaptured(frame) if !frame.jpeg.is_empty())
    })
    .await;

    // Direction guidance lands on the camera's overlay.
    director
        .send_command(CommandKind::Direction {
            direction: Direction::Closer,
        })
        .await
        .unwrap();
    wait_for(&mut camera_events, |event| {
        matches!(
            event,
            AppEvent::DirectionReceived {
                direction: Direction::Closer
            }
        )
    })
    .await;

    camera.destroy().await;
    director.destroy().await;
}

#[tokio::test]
async fn commands_still_deliver_after_negotiation_fails() {
    let hub = Arc::new(MemoryHub::new());
    let backends = Arc::new(MemoryBackendFactory::new());

    // A director alone: nobody ever answers, so negotiation times out.
    let (event_tx, mut events) = create_event_bus();
    let mut config = test_config(Role::Director);
    config.negotiation_timeout = Duration::from_millis(150);
    let director = PeerManager::new(
        config,
        event_tx,
        hub.clone() as Arc<dyn SignalingTransport>,
        backends.clone(),
        Arc::new(TestPatternFactory),
    );
    director
        .init(&session("sess-alone", Role::Director), false)
        .await
        .unwrap();

    wait_for(&mut events, |event| {
        matches!(
            event,
            AppEvent::ConnectionStateChanged {
                state: PeerState::Failed
            }
        )
    })
    .await;
    assert_eq!(director.state(), PeerState::Failed);

    // The data path is decoupled from media/connection state: the command
    // still goes out over the signaling fallback.
    director
        .send_command(CommandKind::Direction {
            direction: Direction::Up,
        })
        .await
        .expect("command must fall back to signaling while failed");

    director.destroy().await;
}

#[tokio::test]
async fn backgrounded_camera_reconnects_on_foreground() {
    let hub = Arc::new(MemoryHub::new());
    let backends = Arc::new(MemoryBackendFactory::new());
    let store = MemoryPairingStore::default();

    let code = store.create_pairing("cam-device").await.unwrap();
    let director_session = store.join_pairing("dir-device", &code).await.unwrap();
    let camera_session = store.wait_for_session("cam-device").await.unwrap();
    assert_eq!(camera_session.role, Role::Camera);

    let camera_app = ManualAppState::new();
    let director_app = ManualAppState::new();

    let (camera_ctx, camera_task) = start_session(
        camera_session,
        test_config(Role::Camera),
        hub.clone() as Arc<dyn SignalingTransport>,
        backends.clone(),
        Arc::new(TestPatternFactory),
        ConnectionManager::new(),
        &camera_app,
    );
    let (director_ctx, director_task) = start_session(
        director_session,
        test_config(Role::Director),
        hub.clone() as Arc<dyn SignalingTransport>,
        backends.clone(),
        Arc::new(TestPatternFactory),
        ConnectionManager::new(),
        &director_app,
    );

    let mut camera_events = camera_ctx.subscribe();
    let mut director_events = director_ctx.subscribe();
    wait_for(&mut camera_events, |event| {
        matches!(
            event,
            AppEvent::ConnectionStateChanged {
                state: PeerState::Connected
            }
        )
    })
    .await;

    // Background then foreground: tracks pause and resume, and one
    // reconnect cycles the connection back to connected.
    camera_app.set_phase(AppPhase::Background);
    tokio::time::sleep(Duration::from_millis(50)).await;
    camera_app.set_phase(AppPhase::Foreground);

    wait_for(&mut camera_events, |event| {
        matches!(event, AppEvent::Reconnecting { attempt: 1 })
    })
    .await;
    wait_for(&mut camera_events, |event| matches!(event, AppEvent::Reconnected)).await;
    assert_eq!(camera_ctx.manager.state(), PeerState::Connected);

    // The director survives the camera's re-offer and still gets video.
    wait_for(&mut director_events, |event| {
        matches!(event, AppEvent::RemoteFrame(_))
    })
    .await;

    let _ = camera_ctx.lifecycle_tx.send(LifecycleCommand::Shutdown).await;
    let _ = director_ctx
        .lifecycle_tx
        .send(LifecycleCommand::Shutdown)
        .await;
    let _ = camera_task.await;
    let _ = director_task.await;
}
