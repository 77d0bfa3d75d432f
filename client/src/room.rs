//! Room Controller
//!
//! UI-facing entry point for one room visit: join, call controls, chat and
//! leave. Local media is acquired before the room is joined; losing the
//! signaling channel ends the visit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mesh_common::protocol::{ChatMessage, ClientEvent, ServerEvent};
use mesh_common::{ParticipantId, RoomId};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::RoomError;
use crate::media::{
    LocalMediaController, LocalMediaState, LocalTrack, MediaDevices, OutgoingVideo, TrackKind,
    TrackSource,
};
use crate::mesh::{MeshEvent, MeshHandle, PeerMeshManager};
use crate::peer::{PeerConnectionFactory, PeerView};
use crate::signaling::{SignalingChannel, SignalingSender};

/// Notification for the rendering layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RoomEvent {
    Mesh(MeshEvent),
    Chat(ChatMessage),
    MediaChanged(LocalMediaState),
    /// Camera or screen became the outgoing video of every session.
    OutgoingVideoChanged(TrackSource),
    /// The signaling connection was lost. The room is being left.
    SignalingDisconnected,
    /// Last event of the room.
    Left,
}

/// Outgoing video sink handed to the media controller.
#[derive(Clone)]
struct RoomVideoSink {
    mesh: MeshHandle,
    events: broadcast::Sender<RoomEvent>,
}

impl OutgoingVideo for RoomVideoSink {
    fn replace_outgoing_video(&self, track: LocalTrack) {
        let source = track.source();
        self.mesh.replace_outgoing_video(track);
        let _ = self.events.send(RoomEvent::OutgoingVideoChanged(source));
    }

    fn screen_share_ended(&self, state: LocalMediaState) {
        let _ = self.events.send(RoomEvent::MediaChanged(state));
    }
}

struct RoomTasks {
    pump: JoinHandle<()>,
    forwarder: JoinHandle<()>,
    mesh: JoinHandle<()>,
}

struct RoomInner<D> {
    room_id: RoomId,
    participant_id: ParticipantId,
    media: LocalMediaController<D>,
    sink: RoomVideoSink,
    signaling: SignalingSender,
    events: broadcast::Sender<RoomEvent>,
    leaving: AtomicBool,
    shutdown: Mutex<bool>,
    stop: watch::Sender<bool>,
    tasks: Mutex<Option<RoomTasks>>,
}

impl<D: MediaDevices> RoomInner<D> {
    fn publish(&self, event: RoomEvent) {
        let _ = self.events.send(event);
    }

    fn ensure_joined(&self) -> Result<(), RoomError> {
        if self.leaving.load(Ordering::Acquire) {
            Err(RoomError::AlreadyLeft)
        } else {
            Ok(())
        }
    }

    /// Leave the room once. Concurrent callers wait for the first to finish.
    async fn shutdown(&self) -> bool {
        self.leaving.store(true, Ordering::Release);
        let mut done = self.shutdown.lock().await;
        if *done {
            return false;
        }

        let leave = ClientEvent::LeaveRoom {
            room_id: self.room_id.clone(),
        };
        if let Err(e) = self.signaling.send(leave) {
            debug!("Could not send leave-room: {e}");
        }
        self.sink.mesh.teardown().await;
        self.media.release().await;
        self.signaling.close();
        self.stop.send_replace(true);

        *done = true;
        true
    }
}

/// Controller of one joined room. Cheap to clone; clones share the room.
pub struct RoomController<D> {
    inner: Arc<RoomInner<D>>,
}

impl<D> Clone for RoomController<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: MediaDevices> RoomController<D> {
    /// Acquire local media, start the mesh and announce ourselves.
    ///
    /// The returned receiver is subscribed before anything runs. Failing to
    /// acquire media is fatal: nothing is sent to the server.
    #[tracing::instrument(skip(channel, factory, devices, config))]
    pub async fn join<F: PeerConnectionFactory>(
        room_id: RoomId,
        participant_id: ParticipantId,
        channel: SignalingChannel,
        factory: F,
        devices: D,
        config: &ClientConfig,
    ) -> Result<(Self, broadcast::Receiver<RoomEvent>), RoomError> {
        let media = LocalMediaController::new(devices);
        let tracks = match media.acquire().await {
            Ok(tracks) => tracks,
            Err(e) => {
                error!("Failed to acquire local media: {e}");
                channel.sender().close();
                return Err(e.into());
            }
        };

        let (signaling, inbound) = channel.into_parts();
        let manager = PeerMeshManager::new(
            participant_id.clone(),
            factory,
            signaling.clone(),
            tracks,
            config.event_buffer,
        );
        let mesh_events = manager.subscribe();
        let (mesh, mesh_task) = manager.spawn();

        let (events, receiver) = broadcast::channel(config.event_buffer.max(1));
        let (stop, stopped) = watch::channel(false);
        let inner = Arc::new(RoomInner {
            room_id: room_id.clone(),
            participant_id: participant_id.clone(),
            media,
            sink: RoomVideoSink {
                mesh,
                events: events.clone(),
            },
            signaling,
            events: events.clone(),
            leaving: AtomicBool::new(false),
            shutdown: Mutex::new(false),
            stop,
            tasks: Mutex::new(None),
        });

        let forwarder = tokio::spawn(forward_mesh_events(events, mesh_events, stopped));
        let pump = tokio::spawn(pump_server_events(inner.clone(), inbound));
        *inner.tasks.lock().await = Some(RoomTasks {
            pump,
            forwarder,
            mesh: mesh_task,
        });

        let join = ClientEvent::JoinRoom {
            room_id,
            participant_id,
        };
        if let Err(e) = inner.signaling.send(join) {
            error!("Failed to join room: {e}");
            let room = Self { inner };
            room.leave().await;
            return Err(e.into());
        }

        info!("Joined room");
        Ok((Self { inner }, receiver))
    }

    pub fn room_id(&self) -> &RoomId {
        &self.inner.room_id
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.inner.participant_id
    }

    pub fn has_left(&self) -> bool {
        self.inner.leaving.load(Ordering::Acquire)
    }

    /// Additional event subscription. Events sent before this call are not
    /// replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.inner.events.subscribe()
    }

    /// Current view of every remote peer.
    pub async fn peers(&self) -> Result<Vec<PeerView>, RoomError> {
        self.inner.sink.mesh.snapshot().await
    }

    pub async fn media_state(&self) -> LocalMediaState {
        self.inner.media.state().await
    }

    #[tracing::instrument(skip(self), fields(room = %self.inner.room_id))]
    pub async fn toggle_mic(&self) -> Result<LocalMediaState, RoomError> {
        self.inner.ensure_joined()?;
        let state = self.inner.media.toggle(TrackKind::Audio).await?;
        self.inner.publish(RoomEvent::MediaChanged(state));
        Ok(state)
    }

    #[tracing::instrument(skip(self), fields(room = %self.inner.room_id))]
    pub async fn toggle_camera(&self) -> Result<LocalMediaState, RoomError> {
        self.inner.ensure_joined()?;
        let state = self.inner.media.toggle(TrackKind::Video).await?;
        self.inner.publish(RoomEvent::MediaChanged(state));
        Ok(state)
    }

    #[tracing::instrument(skip(self), fields(room = %self.inner.room_id))]
    pub async fn set_mic(&self, enabled: bool) -> Result<LocalMediaState, RoomError> {
        self.inner.ensure_joined()?;
        let state = self.inner.media.set_enabled(TrackKind::Audio, enabled).await?;
        self.inner.publish(RoomEvent::MediaChanged(state));
        Ok(state)
    }

    #[tracing::instrument(skip(self), fields(room = %self.inner.room_id))]
    pub async fn set_camera(&self, enabled: bool) -> Result<LocalMediaState, RoomError> {
        self.inner.ensure_joined()?;
        let state = self.inner.media.set_enabled(TrackKind::Video, enabled).await?;
        self.inner.publish(RoomEvent::MediaChanged(state));
        Ok(state)
    }

    /// Send the screen instead of the camera to every peer.
    #[tracing::instrument(skip(self), fields(room = %self.inner.room_id))]
    pub async fn start_screen_share(&self) -> Result<LocalMediaState, RoomError> {
        self.inner.ensure_joined()?;
        let state = self.inner.media.start_screen_share(&self.inner.sink).await?;
        self.inner.publish(RoomEvent::MediaChanged(state));
        Ok(state)
    }

    #[tracing::instrument(skip(self), fields(room = %self.inner.room_id))]
    pub async fn stop_screen_share(&self) -> Result<LocalMediaState, RoomError> {
        self.inner.ensure_joined()?;
        let state = self.inner.media.stop_screen_share(&self.inner.sink).await?;
        self.inner.publish(RoomEvent::MediaChanged(state));
        Ok(state)
    }

    /// Send a chat line to the room. Blank text is ignored. There is no local
    /// echo; the server sends the message back to everyone.
    #[tracing::instrument(skip(self, text), fields(room = %self.inner.room_id))]
    pub fn send_chat(&self, text: &str) -> Result<(), RoomError> {
        self.inner.ensure_joined()?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        let message = ChatMessage {
            to: self.inner.room_id.clone(),
            from: self.inner.participant_id.clone(),
            text: text.to_string(),
        };
        self.inner.signaling.send(ClientEvent::ChatMessage(message))?;
        Ok(())
    }

    /// Leave the room: notify the server, close every session, release
    /// capture and close signaling. Safe to call repeatedly; `Left` is
    /// published before the first call returns.
    #[tracing::instrument(skip(self), fields(room = %self.inner.room_id))]
    pub async fn leave(&self) {
        if self.inner.shutdown().await {
            info!("Left room");
        }

        let tasks = self.inner.tasks.lock().await.take();
        if let Some(tasks) = tasks {
            tasks.pump.abort();
            if let Err(e) = tasks.forwarder.await {
                warn!("Room event forwarder failed: {e}");
            }
            if let Err(e) = tasks.mesh.await {
                warn!("Mesh task failed: {e}");
            }
        }
    }
}

/// Route server events until the signaling stream ends.
async fn pump_server_events<D: MediaDevices>(
    inner: Arc<RoomInner<D>>,
    mut inbound: mpsc::UnboundedReceiver<ServerEvent>,
) {
    while let Some(event) = inbound.recv().await {
        debug!(event = event.name(), "Server event received");
        if let Some(message) = inner.sink.mesh.route(event) {
            inner.publish(RoomEvent::Chat(message));
        }
    }

    if inner.leaving.load(Ordering::Acquire) {
        return;
    }
    error!(room = %inner.room_id, "Signaling connection lost, leaving room");
    inner.publish(RoomEvent::SignalingDisconnected);
    inner.shutdown().await;
}

/// Re-publish mesh events as room events, then `Left` once stopped.
async fn forward_mesh_events(
    events: broadcast::Sender<RoomEvent>,
    mut mesh_events: broadcast::Receiver<MeshEvent>,
    mut stopped: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = mesh_events.recv() => match event {
                Ok(event) => {
                    let _ = events.send(RoomEvent::Mesh(event));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Mesh events dropped, observer too slow");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = stopped.changed() => {
                // Teardown events were sent before the stop flag.
                loop {
                    match mesh_events.try_recv() {
                        Ok(event) => {
                            let _ = events.send(RoomEvent::Mesh(event));
                        }
                        Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
                break;
            }
        }
    }
    let _ = events.send(RoomEvent::Left);
}
