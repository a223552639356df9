pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod roster;
pub mod signal;
pub mod state;

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;
use crate::events::create_event_bus;
use crate::media::connection::ConnectionFactory;
use crate::media::engine::{spawn_engine, EngineDeps, MediaRequest};
use crate::media::loopback::LoopbackFactory;
use crate::media::rtc::RtcConnectionFactory;
use crate::media::source::SyntheticCapture;
use crate::media::EngineHandle;
use crate::signal::{ParticipantId, WsRelayClient};
use crate::state::RelayState;

/// Install the global subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Run the signal relay server until it fails.
pub async fn run_relay(config: EngineConfig) -> anyhow::Result<()> {
    api::server::start_relay_server(&config.relay, RelayState::new())
        .await
        .with_context(|| format!("relay server on {}:{}", config.relay.bind, config.relay.port))
}

/// Options for `meshlink join`.
#[derive(Debug, Clone)]
pub struct JoinOptions {
    pub relay_url: String,
    pub room: String,
    pub user: String,
    /// In-process connections instead of real WebRTC ones.
    pub loopback: bool,
    pub media: MediaRequest,
    pub config: EngineConfig,
}

/// Join a room through a relay server and drive the session from stdin.
pub async fn run_peer(opts: JoinOptions) -> anyhow::Result<()> {
    let local_id = ParticipantId::generate(&opts.user);
    info!("Joining room {} as {}", opts.room, local_id);

    let client = Arc::new(
        WsRelayClient::connect(&opts.relay_url, &opts.room, &local_id)
            .await
            .with_context(|| format!("connecting to relay {}", opts.relay_url))?,
    );
    let connections: Arc<dyn ConnectionFactory> = if opts.loopback {
        Arc::new(LoopbackFactory::new())
    } else {
        Arc::new(RtcConnectionFactory::new(&opts.config))
    };
    let deps = EngineDeps {
        relay: client.clone(),
        roster: client.clone(),
        connections,
        capture: Arc::new(SyntheticCapture::new()),
    };

    let (event_tx, mut event_rx) = create_event_bus();
    let (handle, mut engine_task) =
        spawn_engine(client.local_id().clone(), deps, opts.config, opts.media, event_tx);

    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => info!("Event: {}", json),
                Err(e) => warn!("Failed to serialize event: {}", e),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            result = &mut engine_task => {
                return match result {
                    Ok(outcome) => outcome.context("negotiation engine"),
                    Err(e) => Err(e).context("engine task"),
                };
            }
            line = lines.next_line() => {
                match line.context("reading stdin")? {
                    Some(line) => {
                        if !run_command(&handle, line.trim()).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    handle.leave().await.ok();
    match engine_task.await {
        Ok(outcome) => outcome.context("negotiation engine"),
        Err(e) => Err(e).context("engine task"),
    }
}

/// Apply one stdin command. Returns false when the session should end.
async fn run_command(handle: &EngineHandle, line: &str) -> bool {
    let mut words = line.split_whitespace();
    let result = match (words.next(), words.next()) {
        (None, _) => Ok(()),
        (Some("mute"), _) => handle.set_audio_enabled(false).await,
        (Some("unmute"), _) => handle.set_audio_enabled(true).await,
        (Some("video"), Some("on")) => handle.set_video_enabled(true).await,
        (Some("video"), Some("off")) => handle.set_video_enabled(false).await,
        (Some("share"), _) => handle.start_screen_share().await,
        (Some("unshare"), _) => handle.stop_screen_share().await,
        (Some("connect"), Some(peer)) => handle.connect(ParticipantId::from(peer)).await,
        (Some("peers"), _) => {
            let state = handle.state();
            if state.links.is_empty() {
                info!("No peers");
            }
            for link in state.links {
                info!(
                    "{}: {:?}{}",
                    link.peer_id,
                    link.state,
                    if link.connected { " (connected)" } else { "" }
                );
            }
            Ok(())
        }
        (Some("quit" | "exit" | "leave"), _) => return false,
        (Some(other), _) => {
            warn!(
                "Unknown command '{}'. Try: mute, unmute, video on|off, share, unshare, connect <id>, peers, quit",
                other
            );
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!("{}", e);
    }
    true
}
