#![forbid(unsafe_code)]

mod commands;
mod sink;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use huddle_common::config::{
    ICE_CREDENTIAL_ENV, ICE_SERVER_URL_ENV, ICE_USERNAME_ENV, SIGNALING_URL_ENV,
};
use huddle_common::MeshConfig;
use huddle_core::{MeshCommand, MeshController, MeshHandle};
use huddle_rtc::{HeadlessCapture, RtcConnectionFactory, RtcTrackStore};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::sink::LoggingSink;

#[derive(Parser, Debug)]
#[command(name = "huddle-client")]
struct Args {
    /// Signaling relay URL (WebSocket)
    #[arg(long, env = SIGNALING_URL_ENV)]
    signaling_url: String,

    /// Comma-separated relay servers; bare hosts are treated as turn: URLs
    #[arg(long, env = ICE_SERVER_URL_ENV, default_value = "")]
    ice_servers: String,

    /// Relay server username
    #[arg(long, env = ICE_USERNAME_ENV)]
    ice_username: Option<String>,

    /// Relay server credential
    #[arg(long, env = ICE_CREDENTIAL_ENV)]
    ice_credential: Option<String>,

    /// Ignore stdin commands
    #[arg(long, default_value_t = false)]
    no_stdin: bool,
}

impl Args {
    fn mesh_config(&self) -> MeshConfig {
        MeshConfig::new(
            self.signaling_url.clone(),
            self.ice_servers.clone(),
            self.ice_username.clone(),
            self.ice_credential.clone(),
        )
    }
}

async fn run() -> Result<()> {
    huddle_common::init_tracing();

    let args = Args::parse();
    let config = args.mesh_config();

    let tracks = RtcTrackStore::new();
    let factory = RtcConnectionFactory::new(tracks.clone())?;
    let capture = HeadlessCapture::new(tracks);

    let mut controller = MeshController::init(
        &config,
        Arc::new(factory),
        Arc::new(LoggingSink),
        Arc::new(capture),
    )
    .await?;
    info!(id = %controller.local_id(), "joined mesh");

    let handle = controller.handle();
    if !args.no_stdin {
        info!("{}", commands::HELP);
        tokio::spawn(read_commands(handle.clone()));
    }
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            let _ = handle.shutdown().await;
        }
    });

    controller.run().await?;
    info!("left mesh");
    Ok(())
}

async fn read_commands(handle: MeshHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("failed to read stdin: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let Some(command) = commands::parse(&line) else {
            warn!("unknown command {:?}; {}", line.trim(), commands::HELP);
            continue;
        };
        let sent = match command {
            MeshCommand::SetAudio(enabled) => handle.set_audio_enabled(enabled).await,
            MeshCommand::SetVideo(enabled) => handle.set_video_enabled(enabled).await,
            MeshCommand::SetOutgoing(enabled) => handle.set_outgoing_enabled(enabled).await,
            MeshCommand::Shutdown => handle.shutdown().await,
        };
        if sent.is_err() || command == MeshCommand::Shutdown {
            break;
        }
    }
}

fn main() -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run())
}
