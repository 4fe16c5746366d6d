use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use libp2p::identity::Keypair;
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};

use shuttr::media::camera::{list_cameras, CameraSourceFactory};
use shuttr::media::pattern::TestPatternFactory;
use shuttr::media::MediaSourceFactory;
use shuttr::pairing::PairingStore;
use shuttr::peer::memory::MemoryBackendFactory;
use shuttr::peer::rtc::RtcBackendFactory;
use shuttr::signaling::gossip::GossipTransport;
use shuttr::{
    start_session, AppEvent, CommandKind, ConnectionManager, Direction, LifecycleCommand,
    ManualAppState, MemoryHub, MemoryPairingStore, PairingSession, Role, SessionConfig,
    SessionContext,
};

#[derive(Parser)]
#[command(name = "shuttr", about = "P2P remote camera")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RoleArg {
    Camera,
    Director,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Camera => Role::Camera,
            RoleArg::Director => Role::Director,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run both roles in-process over loopback transports.
    Demo {
        /// How long to keep the session alive.
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
    /// Run one side of a session over the LAN (mDNS discovery). Session
    /// identity comes from the pairing service; pass its output here.
    Run {
        #[arg(long)]
        role: RoleArg,
        #[arg(long)]
        session_id: String,
        #[arg(long)]
        device_id: String,
        #[arg(long)]
        peer_device_id: String,
        /// Use the synthetic pattern source instead of a real camera.
        #[arg(long)]
        synthetic: bool,
        /// Session validity window in minutes.
        #[arg(long, default_value_t = 60)]
        ttl_minutes: i64,
    },
    /// List local camera devices.
    Cameras,
}

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new().expect("failed to create Tokio runtime");

    match cli.command {
        Command::Demo { seconds } => rt.block_on(run_demo(seconds)),
        Command::Run {
            role,
            session_id,
            device_id,
            peer_device_id,
            synthetic,
            ttl_minutes,
        } => rt.block_on(run_peer(
            role.into(),
            session_id,
            device_id,
            peer_device_id,
            synthetic,
            ttl_minutes,
        )),
        Command::Cameras => {
            for camera in list_cameras() {
                println!(
                    "{}: {}{}",
                    camera.index,
                    camera.name,
                    if camera.is_default { " (default)" } else { "" }
                );
            }
        }
    }
}

/// Pair two in-process devices over the memory transports and drive a short
/// directed session end to end.
async fn run_demo(seconds: u64) {
    let hub = Arc::new(MemoryHub::new());
    let backends = Arc::new(MemoryBackendFactory::new());
    let store = MemoryPairingStore::default();

    let code = store
        .create_pairing("camera-device")
        .await
        .expect("create pairing");
    info!("pairing code: {code}");
    let director_session = store
        .join_pairing("director-device", &code)
        .await
        .expect("join pairing");
    let camera_session = store
        .wait_for_session("camera-device")
        .await
        .expect("camera session");

    let camera_app = ManualAppState::new();
    let director_app = ManualAppState::new();

    let (camera_ctx, camera_task) = start_session(
        camera_session,
        SessionConfig::for_role(Role::Camera),
        hub.clone(),
        backends.clone(),
        Arc::new(TestPatternFactory),
        ConnectionManager::new(),
        &camera_app,
    );
    let (director_ctx, director_task) = start_session(
        director_session,
        SessionConfig::for_role(Role::Director),
        hub.clone(),
        backends.clone(),
        Arc::new(TestPatternFactory),
        ConnectionManager::new(),
        &director_app,
    );

    spawn_event_printer("camera", &camera_ctx);
    spawn_event_printer("director", &director_ctx);

    // Give negotiation a moment, then steer and capture.
    tokio::time::sleep(Duration::from_secs(2)).await;
    for kind in [
        CommandKind::Direction {
            direction: Direction::Left,
        },
        CommandKind::Direction {
            direction: Direction::Closer,
        },
        CommandKind::FlashToggle,
        CommandKind::Capture,
    ] {
        if let Err(e) = director_ctx.manager.send_command(kind).await {
            warn!("command failed: {e}");
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    tokio::time::sleep(Duration::from_secs(seconds)).await;

    let _ = camera_ctx.lifecycle_tx.send(LifecycleCommand::Shutdown).await;
    let _ = director_ctx
        .lifecycle_tx
        .send(LifecycleCommand::Shutdown)
        .await;
    let _ = camera_task.await;
    let _ = director_task.await;
}

/// One real peer over gossipsub signaling and WebRTC data channels.
async fn run_peer(
    role: Role,
    session_id: String,
    device_id: String,
    peer_device_id: String,
    synthetic: bool,
    ttl_minutes: i64,
) {
    let transport = GossipTransport::spawn(Keypair::generate_ed25519())
        .expect("failed to start signaling swarm");
    let connection = ConnectionManager::new();
    connection.watch_network(&transport);
    let app = ManualAppState::new();

    let session = PairingSession {
        session_id,
        my_device_id: device_id,
        paired_device_id: peer_device_id,
        role,
        expires_at: chrono::Utc::now() + chrono::Duration::minutes(ttl_minutes),
    };
    let config = SessionConfig::for_role(role);
    let backends = Arc::new(RtcBackendFactory {
        ice_servers: config.ice_servers.clone(),
    });
    let media: Arc<dyn MediaSourceFactory> = if synthetic {
        Arc::new(TestPatternFactory)
    } else {
        Arc::new(CameraSourceFactory)
    };

    let (ctx, task) = start_session(
        session,
        config,
        Arc::new(transport),
        backends,
        media,
        connection,
        &app,
    );
    spawn_event_printer("session", &ctx);

    if role == Role::Director {
        spawn_command_reader(ctx.clone());
        info!("director ready; type up/down/left/right/closer/back/flash/capture");
    }

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    let _ = ctx.lifecycle_tx.send(LifecycleCommand::Shutdown).await;
    let _ = task.await;
}

fn spawn_event_printer(label: &'static str, ctx: &SessionContext) {
    let mut events = ctx.subscribe();
    tokio::spawn(async move {
        let mut remote_frames: u64 = 0;
        while let Ok(event) = events.recv().await {
            match event {
                AppEvent::ConnectionStateChanged { state } => {
                    info!("{label}: connection {state}");
                }
                AppEvent::RemoteFrame(frame) => {
                    remote_frames += 1;
                    if remote_frames % 30 == 1 {
                        info!(
                            "{label}: remote frame #{remote_frames} ({}x{}, {} bytes)",
                            frame.width,
                            frame.height,
                            frame.jpeg.len()
                        );
                    }
                }
                AppEvent::DirectionReceived { direction } => {
                    info!("{label}: direction {direction:?}");
                }
                AppEvent::CaptureRequested => info!("{label}: capture requested"),
                AppEvent::PhotoCaptured(frame) => {
                    info!("{label}: photo captured ({} bytes)", frame.jpeg.len());
                }
                AppEvent::FlashToggled { on } => info!("{label}: flash {on}"),
                AppEvent::Reconnecting { attempt } => {
                    info!("{label}: reconnecting (attempt {attempt})");
                }
                AppEvent::Reconnected => info!("{label}: reconnected"),
                AppEvent::SessionExpired => info!("{label}: session expired"),
                AppEvent::Error(e) => warn!("{label}: {e}"),
                AppEvent::LocalPreviewFrame(_) => {}
            }
        }
    });
}

fn spawn_command_reader(ctx: SessionContext) {
    tokio::spawn(async move {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let kind = match line.trim() {
                "up" => CommandKind::Direction {
                    direction: Direction::Up,
                },
                "down" => CommandKind::Direction {
                    direction: Direction::Down,
                },
                "left" => CommandKind::Direction {
                    direction: Direction::Left,
                },
                "right" => CommandKind::Direction {
                    direction: Direction::Right,
                },
                "closer" => CommandKind::Direction {
                    direction: Direction::Closer,
                },
                "back" => CommandKind::Direction {
                    direction: Direction::Back,
                },
                "capture" => CommandKind::Capture,
                "flash" => CommandKind::FlashToggle,
                "" => continue,
                other => {
                    warn!("unknown command: {other}");
                    continue;
                }
            };
            if let Err(e) = ctx.manager.send_command(kind).await {
                warn!("command failed: {e}");
            }
        }
    });
}
