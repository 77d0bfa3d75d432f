//! Peer Mesh Manager

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mesh_common::protocol::{ClientEvent, InboundSignal, OutboundSignal, SignalKind};
use mesh_common::{ConnectionKey, IceCandidate, ParticipantId, SessionDescription};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{MeshCommand, MeshEvent, MeshHandle};
use crate::error::NegotiationError;
use crate::media::{LocalTrack, LocalTrackSet, TrackKind};
use crate::peer::{
    PeerConnectionFactory, PeerEnvelope, PeerEvent, PeerEventSink, PeerSession, PeerView, Role,
};
use crate::signaling::SignalingSender;

/// Owner of every peer session in a room.
pub struct PeerMeshManager<F: PeerConnectionFactory> {
    local_participant: ParticipantId,
    factory: F,
    signaling: SignalingSender,
    sessions: HashMap<ConnectionKey, PeerSession<F::Connection>>,
    tracks: LocalTrackSet,
    next_session_id: u64,
    peer_tx: mpsc::UnboundedSender<PeerEnvelope>,
    peer_rx: Option<mpsc::UnboundedReceiver<PeerEnvelope>>,
    events: broadcast::Sender<MeshEvent>,
    closing: Arc<AtomicBool>,
    torn_down: bool,
}

impl<F: PeerConnectionFactory> PeerMeshManager<F> {
    /// Create a manager whose sessions start from `tracks`.
    pub fn new(
        local_participant: ParticipantId,
        factory: F,
        signaling: SignalingSender,
        tracks: LocalTrackSet,
        event_buffer: usize,
    ) -> Self {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(event_buffer.max(1));

        Self {
            local_participant,
            factory,
            signaling,
            sessions: HashMap::new(),
            tracks,
            next_session_id: 0,
            peer_tx,
            peer_rx: Some(peer_rx),
            events,
            closing: Arc::new(AtomicBool::new(false)),
            torn_down: false,
        }
    }

    /// Run the manager as an actor task.
    pub fn spawn(mut self) -> (MeshHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let handle = MeshHandle {
            commands: commands_tx,
            events: self.events.clone(),
            closing: self.closing.clone(),
        };
        let peer_rx = self.peer_rx.take();
        let task = tokio::spawn(async move {
            if let Some(peer_rx) = peer_rx {
                self.run(commands_rx, peer_rx).await;
            }
        });
        (handle, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<MeshCommand>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEnvelope>,
    ) {
        info!(participant = %self.local_participant, "Mesh started");
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.teardown().await;
                        break;
                    };
                    if self.handle(command).await.is_break() {
                        break;
                    }
                }
                Some(envelope) = peer_events.recv() => {
                    self.on_peer_event(envelope).await;
                }
            }
        }
        info!("Mesh stopped");
    }

    /// Process one command to completion.
    pub async fn handle(&mut self, command: MeshCommand) -> ControlFlow<()> {
        match command {
            MeshCommand::ExistingParticipant {
                key,
                participant_id,
            } => self.on_existing_participant(key, participant_id).await,
            MeshCommand::NewParticipant {
                key,
                participant_id,
            } => self.on_new_participant(key, participant_id).await,
            MeshCommand::Signal(signal) => self.on_signal(signal).await,
            MeshCommand::ParticipantLeft { key } => self.on_participant_left(&key).await,
            MeshCommand::SetLocalTracks(tracks) => self.set_local_tracks(tracks).await,
            MeshCommand::ReplaceOutgoingVideo(track) => self.replace_outgoing_video(track).await,
            MeshCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            MeshCommand::Teardown(reply) => {
                self.teardown().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Read-only view of every session, ordered by key.
    pub fn snapshot(&self) -> Vec<PeerView> {
        let mut views: Vec<PeerView> = self.sessions.values().map(PeerSession::view).collect();
        views.sort_by(|a, b| a.key.cmp(&b.key));
        views
    }

    pub fn session(&self, key: &ConnectionKey) -> Option<&PeerSession<F::Connection>> {
        self.sessions.get(key)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub const fn local_tracks(&self) -> &LocalTrackSet {
        &self.tracks
    }

    /// Process every queued peer connection event. Returns how many ran.
    ///
    /// Only meaningful before [`spawn`](Self::spawn); the actor drains the
    /// queue itself afterwards.
    pub async fn process_peer_events(&mut self) -> usize {
        let mut processed = 0;
        loop {
            let Some(envelope) = self.peer_rx.as_mut().and_then(|rx| rx.try_recv().ok()) else {
                break;
            };
            self.on_peer_event(envelope).await;
            processed += 1;
        }
        processed
    }

    /// A participant was already in the room when we joined: we initiate.
    pub async fn on_existing_participant(
        &mut self,
        key: ConnectionKey,
        participant_id: Option<ParticipantId>,
    ) {
        if self.is_closing() {
            return;
        }
        if self.sessions.contains_key(&key) {
            debug!(key = %key, "Duplicate existing-peer, ignoring");
            return;
        }

        info!(key = %key, "Existing participant, sending offer");
        if let Err(e) = self.create_session(&key, participant_id, Role::Initiator).await {
            warn!(key = %key, "Failed to create session: {e}");
            return;
        }

        let Some(session) = self.sessions.get_mut(&key) else {
            return;
        };
        match session.offer().await {
            Ok(offer) => self.emit_description(&key, &offer),
            Err(e) => self.fail_session(&key, e).await,
        }
    }

    /// A participant joined after us: it initiates, we wait for its offer.
    pub async fn on_new_participant(
        &mut self,
        key: ConnectionKey,
        participant_id: Option<ParticipantId>,
    ) {
        if self.is_closing() {
            return;
        }
        if let Some(session) = self.sessions.get_mut(&key) {
            debug!(key = %key, "Session already exists for new participant");
            if session.learn_participant_id(participant_id) {
                let view = session.view();
                self.publish(MeshEvent::PeerUpdated(view));
            }
            return;
        }

        info!(key = %key, "New participant, awaiting offer");
        if let Err(e) = self.create_session(&key, participant_id, Role::Responder).await {
            warn!(key = %key, "Failed to create session: {e}");
        }
    }

    /// Route a negotiation message to its session, creating a responder
    /// session first if the sender is not known yet.
    pub async fn on_signal(&mut self, signal: InboundSignal) {
        if self.is_closing() {
            return;
        }
        let key = signal.from.clone();

        if let Some(session) = self.sessions.get_mut(&key) {
            if session.learn_participant_id(signal.participant_id.clone()) {
                let view = session.view();
                self.publish(MeshEvent::PeerUpdated(view));
            }
        } else {
            info!(key = %key, kind = signal.kind.as_str(), "Signal from unknown peer, creating responder session");
            if let Err(e) = self
                .create_session(&key, signal.participant_id.clone(), Role::Responder)
                .await
            {
                warn!(key = %key, "Failed to create session: {e}");
                return;
            }
        }

        let Some(session) = self.sessions.get_mut(&key) else {
            return;
        };
        debug!(key = %key, kind = signal.kind.as_str(), "Signal received");

        let result = match signal.kind {
            SignalKind::Offer => match signal.description() {
                Ok(offer) => session.accept_offer(offer).await.map(Some),
                Err(e) => Err(e.into()),
            },
            SignalKind::Answer => match signal.description() {
                Ok(answer) => session.accept_answer(answer).await.map(|()| None),
                Err(e) => Err(e.into()),
            },
            SignalKind::Candidate => {
                match signal.candidate() {
                    Ok(candidate) => session.add_remote_candidate(candidate).await,
                    Err(e) => {
                        let rejected = NegotiationError::CandidateRejected(e.to_string());
                        warn!(key = %key, "{rejected}");
                    }
                }
                return;
            }
        };

        match result {
            Ok(answer) => {
                let view = session.view();
                self.publish(MeshEvent::PeerUpdated(view));
                if let Some(answer) = answer {
                    self.emit_description(&key, &answer);
                }
            }
            Err(e) => self.fail_session(&key, e).await,
        }
    }

    /// The signaling server reported the participant gone.
    pub async fn on_participant_left(&mut self, key: &ConnectionKey) {
        info!(key = %key, "Participant left");
        self.close_session(key).await;
    }

    /// Handle an observation from a session's peer connection.
    pub async fn on_peer_event(&mut self, envelope: PeerEnvelope) {
        let PeerEnvelope {
            key,
            session_id,
            event,
        } = envelope;

        let Some(session) = self.sessions.get_mut(&key) else {
            debug!(key = %key, "Peer event for closed session, ignoring");
            return;
        };
        if session.id() != session_id {
            debug!(key = %key, "Peer event from a replaced session, ignoring");
            return;
        }

        match event {
            PeerEvent::LocalCandidate(candidate) => self.emit_candidate(&key, &candidate),
            PeerEvent::GatheringComplete => {
                debug!(key = %key, "ICE gathering complete");
            }
            PeerEvent::RemoteTrack(track) => {
                info!(key = %key, track = %track.id, kind = ?track.kind, "Remote track received");
                if session.on_remote_track(track) {
                    let view = session.view();
                    self.publish(MeshEvent::PeerUpdated(view));
                }
            }
            PeerEvent::StateChanged(state) if state.is_terminal() => {
                info!(key = %key, ?state, "Peer connection ended");
                self.close_session(&key).await;
            }
            PeerEvent::StateChanged(state) => {
                debug!(key = %key, ?state, "Peer connection state changed");
                if session.on_connection_state(state) {
                    let view = session.view();
                    self.publish(MeshEvent::PeerUpdated(view));
                }
            }
        }
    }

    /// Replace the local track set. Live sessions switch every changed track
    /// and detach kinds the set lacks; sessions created later start from it.
    pub async fn set_local_tracks(&mut self, tracks: LocalTrackSet) {
        if self.torn_down {
            return;
        }
        self.tracks = tracks;
        for kind in [TrackKind::Audio, TrackKind::Video] {
            self.broadcast_kind(kind).await;
        }
    }

    /// Make `track` the outgoing video of every live and future session.
    pub async fn replace_outgoing_video(&mut self, track: LocalTrack) {
        if self.torn_down {
            return;
        }
        info!(track = %track.id(), sessions = self.sessions.len(), "Replacing outgoing video");
        self.tracks.video = Some(track);
        self.broadcast_kind(TrackKind::Video).await;
    }

    /// Close every session and drop local track references. Idempotent.
    pub async fn teardown(&mut self) {
        self.closing.store(true, Ordering::Release);
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let sessions: Vec<_> = self.sessions.drain().collect();
        info!(sessions = sessions.len(), "Tearing down mesh");
        for (key, mut session) in sessions {
            session.close().await;
            self.publish(MeshEvent::PeerLeft(key));
        }
        self.tracks = LocalTrackSet::default();
    }

    async fn create_session(
        &mut self,
        key: &ConnectionKey,
        participant_id: Option<ParticipantId>,
        role: Role,
    ) -> Result<(), NegotiationError> {
        self.next_session_id += 1;
        let id = self.next_session_id;

        let sink = PeerEventSink::new(key.clone(), id, self.peer_tx.clone());
        let connection = self.factory.create(sink).await?;
        let mut session = PeerSession::new(id, key.clone(), participant_id, role, connection);

        if let Err(e) = session.start(&self.tracks).await {
            session.close().await;
            return Err(e);
        }
        if self.is_closing() {
            session.close().await;
            return Err(NegotiationError::Closed);
        }

        debug!(key = %key, ?role, session = id, "Session created");
        let view = session.view();
        self.sessions.insert(key.clone(), session);
        self.publish(MeshEvent::PeerJoined(view));
        Ok(())
    }

    /// Bring every live session's `kind` sender in line with the current
    /// track set. A missing track detaches the sender.
    async fn broadcast_kind(&mut self, kind: TrackKind) {
        let track = self.tracks.get(kind).cloned();
        let mut failed = Vec::new();
        let mut updated = Vec::new();
        for (key, session) in &mut self.sessions {
            let result = match &track {
                Some(track) => session.replace_outgoing(track).await,
                None => session.clear_outgoing(kind).await,
            };
            match result {
                Ok(()) => updated.push(session.view()),
                Err(e) => {
                    warn!(key = %key, ?kind, "Failed to switch outgoing track: {e}");
                    failed.push(key.clone());
                }
            }
        }
        for view in updated {
            self.publish(MeshEvent::PeerUpdated(view));
        }
        // A session that cannot follow the shared track set would diverge.
        for key in failed {
            self.close_session(&key).await;
        }
    }

    async fn fail_session(&mut self, key: &ConnectionKey, error: NegotiationError) {
        warn!(key = %key, "Negotiation failed: {error}");
        self.close_session(key).await;
    }

    /// Close and forget a session. A second call for the same key is a no-op.
    async fn close_session(&mut self, key: &ConnectionKey) {
        let Some(mut session) = self.sessions.remove(key) else {
            return;
        };
        if session.close().await {
            info!(key = %key, "Session closed");
        }
        self.publish(MeshEvent::PeerLeft(key.clone()));
    }

    fn emit_description(&self, key: &ConnectionKey, description: &SessionDescription) {
        if self.is_closing() {
            return;
        }
        match OutboundSignal::description(
            key.clone(),
            description,
            Some(self.local_participant.clone()),
        ) {
            Ok(signal) => self.emit(ClientEvent::Signal(signal)),
            Err(e) => warn!(key = %key, "Failed to encode description: {e}"),
        }
    }

    fn emit_candidate(&self, key: &ConnectionKey, candidate: &IceCandidate) {
        if self.is_closing() {
            return;
        }
        match OutboundSignal::candidate(key.clone(), candidate, Some(self.local_participant.clone()))
        {
            Ok(signal) => self.emit(ClientEvent::Signal(signal)),
            Err(e) => warn!(key = %key, "Failed to encode candidate: {e}"),
        }
    }

    fn emit(&self, event: ClientEvent) {
        if let Err(e) = self.signaling.send(event) {
            warn!("Failed to send signaling event: {e}");
        }
    }

    fn publish(&self, event: MeshEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}
