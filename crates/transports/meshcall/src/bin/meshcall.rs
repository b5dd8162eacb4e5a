//! Headless mesh call participant
//!
//! Joins a room receive-only and logs who comes and goes.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin meshcall -- \
//!   --signaling-url ws://localhost:8080 \
//!   --room standup \
//!   --username observer
//!
//! # Layer CLI overrides over a TOML file
//! cargo run --bin meshcall -- --config ./call.toml --room retro
//!
//! # Configure STUN/TURN servers
//! cargo run --bin meshcall -- \
//!   --stun-servers stun:stun.l.google.com:19302 \
//!   --turn-servers turn:turn.example.com:3478:user:secret
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use meshcall::{
    CallClient, CallConfig, CallNotice, NoDevices, RtcTransportFactory, TurnServerConfig,
    WebSocketConnector,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Mesh call participant
///
/// Connects to a signaling relay, joins a room and receives every other
/// participant's audio, camera and screen lanes.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file; CLI arguments override its values
    #[arg(short, long, env = "MESHCALL_CONFIG")]
    config: Option<PathBuf>,

    /// WebSocket signaling relay URL
    #[arg(long, env = "MESHCALL_SIGNALING_URL")]
    signaling_url: Option<String>,

    /// Room to join
    #[arg(short, long, env = "MESHCALL_ROOM")]
    room: Option<String>,

    /// Identity in the room (random guest name when unset)
    #[arg(short, long, env = "MESHCALL_USERNAME")]
    username: Option<String>,

    /// STUN servers (comma-separated)
    #[arg(long, value_delimiter = ',', env = "MESHCALL_STUN_SERVERS")]
    stun_servers: Vec<String>,

    /// TURN servers (format: turn:host:port:username:password, comma-separated)
    #[arg(long, value_delimiter = ',', env = "MESHCALL_TURN_SERVERS")]
    turn_servers: Vec<String>,

    /// Give up reconnecting after this many attempts
    #[arg(long, env = "MESHCALL_MAX_RECONNECT_ATTEMPTS")]
    max_reconnect_attempts: Option<u32>,
}

/// Parse TURN server string (format: turn:host:port:username:password or turns:host:port:username:password)
fn parse_turn_server(s: &str) -> anyhow::Result<TurnServerConfig> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 5 {
        bail!(
            "Invalid TURN server format: '{}'. Expected: turn:host:port:username:password",
            s
        );
    }

    let protocol = parts[0];
    if protocol != "turn" && protocol != "turns" {
        bail!(
            "Invalid TURN protocol: '{}'. Expected 'turn' or 'turns'",
            protocol
        );
    }

    // Password may contain colons
    Ok(TurnServerConfig {
        url: format!("{}:{}:{}", protocol, parts[1], parts[2]),
        username: parts[3].to_string(),
        credential: parts[4..].join(":"),
    })
}

/// Build the call config: file (or defaults), then CLI overrides
fn build_config_from_args(args: &Args) -> anyhow::Result<CallConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            CallConfig::from_file(path)
                .with_context(|| format!("Failed to load config from {:?}", path))?
        }
        None => CallConfig::default(),
    };

    if let Some(url) = &args.signaling_url {
        config.signaling_url = url.clone();
    }
    if let Some(room) = &args.room {
        config.room_id = room.clone();
    }
    if let Some(username) = &args.username {
        config.username = username.clone();
    }
    if config.username.trim().is_empty() {
        config.username = format!("guest-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
    }
    if !args.stun_servers.is_empty() {
        config.stun_servers = args.stun_servers.clone();
    }
    if args.max_reconnect_attempts.is_some() {
        config.reconnect.max_attempts = args.max_reconnect_attempts;
    }

    let mut turn_servers = Vec::new();
    for turn_str in &args.turn_servers {
        let turn_config = parse_turn_server(turn_str).context("Failed to parse TURN server")?;
        info!(
            "Adding TURN server: {} (user: {})",
            turn_config.url, turn_config.username
        );
        turn_servers.push(turn_config);
    }
    if !turn_servers.is_empty() {
        config.turn_servers = turn_servers;
    }

    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        if shutdown_flag_handler.swap(true, Ordering::SeqCst) {
            eprintln!("Shutdown already in progress, forcing exit");
            std::process::exit(0);
        }
        eprintln!("\nCtrl+C received, leaving the room...");
    })
    .context("Failed to install Ctrl+C handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("meshcall-worker")
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(args: Args, shutdown_flag: Arc<AtomicBool>) -> anyhow::Result<()> {
    init_tracing();

    let config = build_config_from_args(&args)?;
    config.validate().context("Invalid configuration")?;

    info!(
        version = meshcall::version(),
        signaling_url = %config.signaling_url,
        room = %config.room_id,
        username = %config.username,
        stun_servers = config.stun_servers.len(),
        turn_servers = config.turn_servers.len(),
        "Configuration loaded"
    );

    let (client, handle, mut notices) = CallClient::new(
        config.clone(),
        Arc::new(WebSocketConnector::new(config.signaling_url.clone())),
        Arc::new(NoDevices),
        Arc::new(RtcTransportFactory::new(&config)),
    )
    .context("Failed to create call client")?;
    let call = tokio::spawn(client.run());

    info!("Call running. Press Ctrl+C to leave.");

    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            notice = notices.recv() => match notice {
                Some(notice) => log_notice(notice),
                None => break,
            },
            _ = ticker.tick() => {
                if shutdown_flag.load(Ordering::SeqCst) {
                    if let Err(e) = handle.leave().await {
                        warn!("Leave failed: {}", e);
                    }
                    break;
                }
            }
        }
    }

    call.await
        .context("Call task panicked")?
        .context("Call ended with an error")?;
    info!("Left the call");
    Ok(())
}

fn log_notice(notice: CallNotice) {
    match notice {
        CallNotice::DeviceAdvisory { lane, error } => {
            warn!(lane = %lane, "Device advisory: {}", error);
        }
        CallNotice::StatusChanged(status) => info!(status = %status, "Signaling status changed"),
        CallNotice::ParticipantJoined(peer) => info!(peer = %peer, "Participant joined"),
        CallNotice::ParticipantLeft(peer) => info!(peer = %peer, "Participant left"),
        CallNotice::RemoteStream(stream) => info!(
            peer = %stream.peer_id,
            role = ?stream.role,
            track = %stream.track_id,
            "Receiving stream"
        ),
        CallNotice::ScreenShareEnded => info!("Screen share ended"),
        CallNotice::ReconnectFailed { attempts } => {
            warn!(attempts, "Gave up reconnecting");
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,meshcall=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_turn_server() {
        let turn = parse_turn_server("turn:turn.example.com:3478:user:pa:ss").unwrap();
        assert_eq!(turn.url, "turn:turn.example.com:3478");
        assert_eq!(turn.username, "user");
        assert_eq!(turn.credential, "pa:ss");

        assert!(parse_turn_server("stun:host:1:u:p").is_err());
        assert!(parse_turn_server("turn:host").is_err());
    }

    #[test]
    fn test_cli_overrides_defaults() {
        let args = Args::parse_from([
            "meshcall",
            "--room",
            "retro",
            "--username",
            "carol",
            "--max-reconnect-attempts",
            "4",
        ]);
        let config = build_config_from_args(&args).unwrap();
        assert_eq!(config.room_id, "retro");
        assert_eq!(config.username, "carol");
        assert_eq!(config.reconnect.max_attempts, Some(4));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_turn_server_names_the_cause() {
        let args = Args::parse_from(["meshcall", "--turn-servers", "turn:host:3478"]);
        let err = build_config_from_args(&args).unwrap_err();
        let chain = format!("{:#}", err);
        assert!(chain.starts_with("Failed to parse TURN server"));
        assert!(chain.contains("Invalid TURN server format"));
    }
}
