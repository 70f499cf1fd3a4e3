//! Top-level mesh session: owns the signaling channel, the peer registry and
//! the local media, and drives them from one task.

use std::sync::Arc;

use huddle_common::{Error, MeshConfig, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionFactory, TaggedConnectionEvent};
use crate::ice::{self, IceServer};
use crate::media::{CaptureDevice, LocalMediaController, LocalSession, MediaAcquisitionError};
use crate::registry::{PeerRegistry, SessionContext};
use crate::signaling::{ChannelEvent, SignalingChannel};
use crate::sink::MediaSink;
use crate::types::PeerId;

const COMMAND_QUEUE_CAPACITY: usize = 32;

type Acquisition = JoinHandle<std::result::Result<LocalSession, MediaAcquisitionError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshCommand {
    SetAudio(bool),
    SetVideo(bool),
    /// Every outgoing track at once.
    SetOutgoing(bool),
    Shutdown,
}

/// Control handle for a running [`MeshController`].
#[derive(Debug, Clone)]
pub struct MeshHandle {
    tx: mpsc::Sender<MeshCommand>,
}

impl MeshHandle {
    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<()> {
        self.send(MeshCommand::SetAudio(enabled)).await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<()> {
        self.send(MeshCommand::SetVideo(enabled)).await
    }

    pub async fn set_outgoing_enabled(&self, enabled: bool) -> Result<()> {
        self.send(MeshCommand::SetOutgoing(enabled)).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(MeshCommand::Shutdown).await
    }

    async fn send(&self, command: MeshCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| Error::internal("mesh controller is not running"))
    }
}

pub struct MeshController {
    channel: SignalingChannel,
    registry: PeerRegistry,
    media: LocalMediaController,
    acquisition: Option<Acquisition>,
    connection_events: mpsc::UnboundedReceiver<TaggedConnectionEvent>,
    commands: mpsc::Receiver<MeshCommand>,
    command_tx: mpsc::Sender<MeshCommand>,
}

impl MeshController {
    /// Validate `config`, then connect signaling and acquire local media
    /// concurrently.
    ///
    /// A capture failure that lands before the signaling handshake finishes
    /// is returned here and the room is never joined; a later one ends
    /// [`run`](Self::run).
    pub async fn init(
        config: &MeshConfig,
        factory: Arc<dyn ConnectionFactory>,
        sink: Arc<dyn MediaSink>,
        device: Arc<dyn CaptureDevice>,
    ) -> Result<Self> {
        config.validate()?;

        let media = LocalMediaController::new(device);
        let mut acquisition = Some(spawn_acquisition(&media));

        let connect = SignalingChannel::connect(&config.signaling_url);
        tokio::pin!(connect);
        let channel = loop {
            tokio::select! {
                connected = &mut connect => match connected {
                    Ok(channel) => break channel,
                    Err(e) => {
                        if let Some(acquisition) = acquisition.take() {
                            acquisition.abort();
                        }
                        return Err(e);
                    }
                },
                acquired = join_acquisition(&mut acquisition), if acquisition.is_some() => {
                    acquisition = None;
                    let session = acquired?;
                    debug!(stream = session.stream_id(), "local media ready before join");
                }
            }
        };

        let ice_servers = ice::resolve(
            &config.ice_server_urls,
            config.ice_username.as_deref(),
            config.ice_credential.as_deref(),
        );
        Ok(Self::assemble(
            channel,
            ice_servers,
            factory,
            sink,
            media,
            acquisition,
        ))
    }

    /// Build a controller over an already-connected channel and start
    /// acquiring local media.
    pub fn new(
        channel: SignalingChannel,
        ice_servers: Vec<IceServer>,
        factory: Arc<dyn ConnectionFactory>,
        sink: Arc<dyn MediaSink>,
        media: LocalMediaController,
    ) -> Self {
        let acquisition = spawn_acquisition(&media);
        Self::assemble(channel, ice_servers, factory, sink, media, Some(acquisition))
    }

    fn assemble(
        channel: SignalingChannel,
        ice_servers: Vec<IceServer>,
        factory: Arc<dyn ConnectionFactory>,
        sink: Arc<dyn MediaSink>,
        media: LocalMediaController,
        acquisition: Option<Acquisition>,
    ) -> Self {
        let (events_tx, connection_events) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        info!(
            id = %channel.local_id(),
            ice_servers = ice_servers.len(),
            "mesh session created"
        );
        let ctx = SessionContext {
            local_id: channel.local_id().clone(),
            ice_servers,
            factory,
            sink,
            media: media.readiness(),
            events: events_tx,
        };
        Self {
            channel,
            registry: PeerRegistry::new(ctx),
            media,
            acquisition,
            connection_events,
            commands,
            command_tx,
        }
    }

    pub fn local_id(&self) -> &PeerId {
        self.channel.local_id()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn media(&self) -> &LocalMediaController {
        &self.media
    }

    pub fn handle(&self) -> MeshHandle {
        MeshHandle {
            tx: self.command_tx.clone(),
        }
    }

    /// Returns false when local media is not ready yet.
    pub fn set_audio_enabled(&self, enabled: bool) -> bool {
        self.media.toggle_audio(enabled)
    }

    pub fn set_video_enabled(&self, enabled: bool) -> bool {
        self.media.toggle_video(enabled)
    }

    pub fn set_outgoing_enabled(&self, enabled: bool) -> bool {
        self.media.set_outgoing_enabled(enabled)
    }

    /// Drive the mesh until shutdown, signaling loss or a media failure.
    /// Every session is closed on return.
    pub async fn run(&mut self) -> Result<()> {
        let result = self.drive().await;
        if let Err(e) = &result {
            error!("mesh session ended: {}", e);
        }
        self.close();
        result
    }

    /// Close every session and remove every sink. Idempotent.
    pub fn close(&mut self) {
        if let Some(acquisition) = self.acquisition.take() {
            acquisition.abort();
        }
        if !self.registry.is_empty() {
            info!(peers = self.registry.len(), "closing mesh session");
        }
        self.registry.close_all();
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                event = self.channel.next_event() => {
                    let Some(event) = event else {
                        return Err(Error::signaling("signaling channel closed"));
                    };
                    self.on_channel_event(event);
                }
                Some(tagged) = self.connection_events.recv() => {
                    if let Some(envelope) = self.registry.on_connection_event(tagged) {
                        self.channel.emit_signal(envelope).await?;
                    }
                }
                acquired = join_acquisition(&mut self.acquisition), if self.acquisition.is_some() => {
                    self.acquisition = None;
                    let session = acquired?;
                    let attached = self.registry.attach_local_media(&session);
                    debug!(attached, "local media ready");
                }
                Some(command) = self.commands.recv() => {
                    if command == MeshCommand::Shutdown {
                        info!("shutdown requested");
                        return Ok(());
                    }
                    self.on_command(command);
                }
            }
        }
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Introduction(ids) => self.registry.on_introduction(&ids),
            ChannelEvent::PeerJoined(id) => self.registry.on_peer_joined(id),
            ChannelEvent::PeerLeft(id) => self.registry.on_peer_left(&id),
            ChannelEvent::Signal(envelope) => self.registry.on_signal(envelope),
        }
    }

    fn on_command(&mut self, command: MeshCommand) {
        let applied = match command {
            MeshCommand::SetAudio(enabled) => self.set_audio_enabled(enabled),
            MeshCommand::SetVideo(enabled) => self.set_video_enabled(enabled),
            MeshCommand::SetOutgoing(enabled) => self.set_outgoing_enabled(enabled),
            MeshCommand::Shutdown => return,
        };
        if !applied {
            warn!(?command, "local media not ready; command ignored");
        }
    }
}

impl Drop for MeshController {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_acquisition(media: &LocalMediaController) -> Acquisition {
    let media = media.clone();
    tokio::spawn(async move { media.acquire().await })
}

async fn join_acquisition(acquisition: &mut Option<Acquisition>) -> Result<LocalSession> {
    match acquisition {
        Some(handle) => match handle.await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(Error::internal(format!("media acquisition task failed: {e}"))),
        },
        None => std::future::pending().await,
    }
}
