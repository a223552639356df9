use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use meshlink::config::EngineConfig;
use meshlink::media::engine::MediaRequest;
use meshlink::JoinOptions;

#[derive(Parser)]
#[command(name = "meshlink", about = "Peer-to-peer mesh audio/video negotiation")]
struct Cli {
    /// JSON settings file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the signal relay server
    Relay {
        /// Listen port
        #[arg(long)]
        port: Option<u16>,

        /// Listen address
        #[arg(long)]
        bind: Option<String>,
    },
    /// Join a room and negotiate with everyone in it
    Join {
        /// Relay base URL
        #[arg(long, default_value = "ws://127.0.0.1:9850")]
        relay: String,

        #[arg(long)]
        room: String,

        /// User name; the participant id is derived from it
        #[arg(long, default_value = "guest")]
        user: String,

        /// Use in-process connections instead of WebRTC
        #[arg(long)]
        loopback: bool,

        #[arg(long)]
        no_video: bool,

        #[arg(long)]
        no_audio: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    meshlink::init_tracing();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path).context("loading settings")?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Command::Relay { port, bind } => {
            if let Some(port) = port {
                config.relay.port = port;
            }
            if let Some(bind) = bind {
                config.relay.bind = bind;
            }
            meshlink::run_relay(config).await
        }
        Command::Join {
            relay,
            room,
            user,
            loopback,
            no_video,
            no_audio,
        } => {
            meshlink::run_peer(JoinOptions {
                relay_url: relay,
                room,
                user,
                loopback,
                media: MediaRequest {
                    audio: !no_audio,
                    video: !no_video,
                },
                config,
            })
            .await
        }
    }
}
