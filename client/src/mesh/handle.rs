//! Mesh Handle

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mesh_common::protocol::{ChatMessage, InboundSignal, ServerEvent};
use mesh_common::{ConnectionKey, ParticipantId};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use super::{MeshCommand, MeshEvent};
use crate::error::RoomError;
use crate::media::{LocalTrack, LocalTrackSet, OutgoingVideo};
use crate::peer::PeerView;

/// Cloneable handle to a running mesh actor.
#[derive(Debug, Clone)]
pub struct MeshHandle {
    pub(super) commands: mpsc::UnboundedSender<MeshCommand>,
    pub(super) events: broadcast::Sender<MeshEvent>,
    pub(super) closing: Arc<AtomicBool>,
}

impl MeshHandle {
    fn send(&self, command: MeshCommand) -> bool {
        if self.commands.send(command).is_err() {
            debug!("Mesh stopped, dropping command");
            return false;
        }
        true
    }

    pub fn existing_participant(&self, key: ConnectionKey, participant_id: Option<ParticipantId>) {
        self.send(MeshCommand::ExistingParticipant {
            key,
            participant_id,
        });
    }

    pub fn new_participant(&self, key: ConnectionKey, participant_id: Option<ParticipantId>) {
        self.send(MeshCommand::NewParticipant {
            key,
            participant_id,
        });
    }

    pub fn signal(&self, signal: InboundSignal) {
        self.send(MeshCommand::Signal(signal));
    }

    pub fn participant_left(&self, key: ConnectionKey) {
        self.send(MeshCommand::ParticipantLeft { key });
    }

    pub fn set_local_tracks(&self, tracks: LocalTrackSet) {
        self.send(MeshCommand::SetLocalTracks(tracks));
    }

    /// Hand a mesh-relevant server event to the actor. Chat is not a mesh
    /// concern and is returned to the caller.
    pub fn route(&self, event: ServerEvent) -> Option<ChatMessage> {
        match event {
            ServerEvent::ExistingPeer(notice) => {
                self.existing_participant(notice.key, notice.participant_id);
            }
            ServerEvent::NewPeer(notice) => {
                self.new_participant(notice.key, notice.participant_id);
            }
            ServerEvent::Signal(signal) => self.signal(signal),
            ServerEvent::PeerLeft { key } => self.participant_left(key),
            ServerEvent::ChatMessage(message) => return Some(message),
        }
        None
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Current read-only view of every session, ordered by key.
    pub async fn snapshot(&self) -> Result<Vec<PeerView>, RoomError> {
        let (tx, rx) = oneshot::channel();
        if !self.send(MeshCommand::Snapshot(tx)) {
            return Err(RoomError::MeshStopped);
        }
        rx.await.map_err(|_| RoomError::MeshStopped)
    }

    /// Close every session and stop the actor. Safe to call repeatedly.
    ///
    /// From this call on no further offer, answer or candidate leaves the
    /// mesh, even for a negotiation already in flight.
    pub async fn teardown(&self) {
        self.closing.store(true, Ordering::Release);
        let (tx, rx) = oneshot::channel();
        if self.send(MeshCommand::Teardown(tx)) {
            let _ = rx.await;
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

impl OutgoingVideo for MeshHandle {
    fn replace_outgoing_video(&self, track: LocalTrack) {
        self.send(MeshCommand::ReplaceOutgoingVideo(track));
    }
}
