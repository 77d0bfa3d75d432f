//! Peer Session State Machine
//!
//! ```text
//! Created ─┬─ Initiator ─> Offering ──answer──┐
//!          └─ Responder ─> AwaitingOffer ─offer┴─> Negotiated ─> Connected
//!                                  (any) ──────────────────────────> Closed
//! ```
//!
//! Remote ICE candidates that arrive before a remote description are queued
//! and applied, in arrival order, right after the description is set.

use mesh_common::{ConnectionKey, IceCandidate, ParticipantId, SessionDescription};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::connection::{ConnectionState, PeerConnection, RemoteStream, RemoteTrackInfo};
use crate::error::NegotiationError;
use crate::media::{LocalTrack, LocalTrackSet, TrackKind};

/// Which side sends the first offer. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    Created,
    Offering,
    AwaitingOffer,
    Negotiated,
    Connected,
    Closed,
}

/// Read-only projection of a session for rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerView {
    pub key: ConnectionKey,
    pub participant_id: Option<ParticipantId>,
    pub role: Role,
    pub state: NegotiationState,
    pub remote_stream: Option<RemoteStream>,
    /// Id of the local audio track this session currently sends.
    pub outgoing_audio: Option<String>,
    /// Id of the local video track this session currently sends.
    pub outgoing_video: Option<String>,
}

impl PeerView {
    /// Tile label: participant id when known, otherwise the connection key.
    pub fn display_name(&self) -> &str {
        self.participant_id
            .as_ref()
            .map_or_else(|| self.key.as_str(), ParticipantId::as_str)
    }
}

/// Per-remote-participant negotiation state.
pub struct PeerSession<C> {
    id: u64,
    key: ConnectionKey,
    participant_id: Option<ParticipantId>,
    role: Role,
    state: NegotiationState,
    connection: C,
    has_remote_description: bool,
    pending_candidates: Vec<IceCandidate>,
    remote_stream: Option<RemoteStream>,
    outgoing_audio: Option<String>,
    outgoing_video: Option<String>,
}

impl<C: PeerConnection> PeerSession<C> {
    pub const fn new(
        id: u64,
        key: ConnectionKey,
        participant_id: Option<ParticipantId>,
        role: Role,
        connection: C,
    ) -> Self {
        Self {
            id,
            key,
            participant_id,
            role,
            state: NegotiationState::Created,
            connection,
            has_remote_description: false,
            pending_candidates: Vec::new(),
            remote_stream: None,
            outgoing_audio: None,
            outgoing_video: None,
        }
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub const fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub const fn role(&self) -> Role {
        self.role
    }

    pub const fn state(&self) -> NegotiationState {
        self.state
    }

    pub const fn connection(&self) -> &C {
        &self.connection
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn view(&self) -> PeerView {
        PeerView {
            key: self.key.clone(),
            participant_id: self.participant_id.clone(),
            role: self.role,
            state: self.state,
            remote_stream: self.remote_stream.clone(),
            outgoing_audio: self.outgoing_audio.clone(),
            outgoing_video: self.outgoing_video.clone(),
        }
    }

    /// Record the display identity if it was not known yet.
    pub fn learn_participant_id(&mut self, participant_id: Option<ParticipantId>) -> bool {
        if self.participant_id.is_some() || participant_id.is_none() {
            return false;
        }
        self.participant_id = participant_id;
        true
    }

    /// Attach the current local tracks. Responders then wait for an offer.
    pub async fn start(&mut self, tracks: &LocalTrackSet) -> Result<(), NegotiationError> {
        self.expect_state(NegotiationState::Created, "attach tracks")?;

        // One sender per kind, with or without a track.
        for kind in [TrackKind::Audio, TrackKind::Video] {
            match tracks.get(kind) {
                Some(track) => {
                    self.connection.add_track(track).await?;
                    *self.outgoing_slot(kind) = Some(track.id().to_string());
                }
                None => self.connection.add_sender(kind).await?,
            }
        }

        if self.role == Role::Responder {
            self.state = NegotiationState::AwaitingOffer;
        }
        Ok(())
    }

    /// Produce the local offer and set it as local description.
    pub async fn offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        if self.role != Role::Initiator {
            return Err(self.invalid("send an offer as responder"));
        }
        self.expect_state(NegotiationState::Created, "send an offer")?;

        self.state = NegotiationState::Offering;
        let offer = self.connection.create_offer().await?;
        self.connection.set_local_description(offer.clone()).await?;
        debug!(key = %self.key, "Local offer set");
        Ok(offer)
    }

    /// Apply a remote offer and produce the answer.
    pub async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        if self.role != Role::Responder {
            return Err(self.invalid("accept an offer as initiator"));
        }
        if !matches!(
            self.state,
            NegotiationState::AwaitingOffer
                | NegotiationState::Negotiated
                | NegotiationState::Connected
        ) {
            return Err(self.invalid("accept an offer"));
        }

        self.apply_remote_description(offer).await?;
        let answer = self.connection.create_answer().await?;
        self.connection.set_local_description(answer.clone()).await?;
        if self.state != NegotiationState::Connected {
            self.state = NegotiationState::Negotiated;
        }
        debug!(key = %self.key, "Local answer set");
        Ok(answer)
    }

    /// Apply the remote answer to our offer. A repeated answer after
    /// negotiation is ignored.
    pub async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        if self.role != Role::Initiator {
            return Err(self.invalid("accept an answer as responder"));
        }
        if matches!(
            self.state,
            NegotiationState::Negotiated | NegotiationState::Connected
        ) {
            warn!(key = %self.key, state = ?self.state, "Ignoring repeated answer");
            return Ok(());
        }
        self.expect_state(NegotiationState::Offering, "accept an answer")?;

        self.apply_remote_description(answer).await?;
        self.state = NegotiationState::Negotiated;
        Ok(())
    }

    /// Apply a remote ICE candidate, or queue it until a remote description
    /// exists. A rejected candidate is logged and ignored.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.state == NegotiationState::Closed {
            return;
        }
        if !self.has_remote_description {
            debug!(key = %self.key, "Queueing ICE candidate until remote description is set");
            self.pending_candidates.push(candidate);
            return;
        }
        self.apply_candidate(candidate).await;
    }

    /// Note a received remote track. Returns true when the view changed.
    pub fn on_remote_track(&mut self, track: RemoteTrackInfo) -> bool {
        if self.state == NegotiationState::Closed {
            return false;
        }

        let stream = self.remote_stream.get_or_insert_with(|| RemoteStream {
            id: track.stream_id.clone(),
            tracks: Vec::new(),
        });
        if !stream.tracks.iter().any(|t| t.id == track.id) {
            stream.tracks.push(track);
        }
        if self.state == NegotiationState::Negotiated {
            self.state = NegotiationState::Connected;
        }
        true
    }

    /// Note a non-terminal connection state. Returns true when the view
    /// changed. Terminal states are handled by closing the session.
    pub fn on_connection_state(&mut self, state: ConnectionState) -> bool {
        if state == ConnectionState::Connected && self.state == NegotiationState::Negotiated {
            self.state = NegotiationState::Connected;
            return true;
        }
        false
    }

    /// Id of the local track of `kind` this session currently sends.
    pub fn outgoing(&self, kind: TrackKind) -> Option<&str> {
        match kind {
            TrackKind::Audio => self.outgoing_audio.as_deref(),
            TrackKind::Video => self.outgoing_video.as_deref(),
        }
    }

    /// Switch the sender of the track's kind to `track`. No-op when it is
    /// already the outgoing track.
    pub async fn replace_outgoing(&mut self, track: &LocalTrack) -> Result<(), NegotiationError> {
        if self.state == NegotiationState::Closed {
            return Err(NegotiationError::Closed);
        }
        if self.outgoing(track.kind()) == Some(track.id()) {
            return Ok(());
        }
        self.connection.replace_track(track).await?;
        *self.outgoing_slot(track.kind()) = Some(track.id().to_string());
        Ok(())
    }

    /// Stop sending media of `kind`. The sender stays attached.
    pub async fn clear_outgoing(&mut self, kind: TrackKind) -> Result<(), NegotiationError> {
        if self.state == NegotiationState::Closed {
            return Err(NegotiationError::Closed);
        }
        if self.outgoing(kind).is_none() {
            return Ok(());
        }
        self.connection.clear_track(kind).await?;
        *self.outgoing_slot(kind) = None;
        Ok(())
    }

    fn outgoing_slot(&mut self, kind: TrackKind) -> &mut Option<String> {
        match kind {
            TrackKind::Audio => &mut self.outgoing_audio,
            TrackKind::Video => &mut self.outgoing_video,
        }
    }

    /// Release the connection. Returns false if already closed.
    pub async fn close(&mut self) -> bool {
        if self.state == NegotiationState::Closed {
            return false;
        }
        self.state = NegotiationState::Closed;
        self.pending_candidates.clear();
        if let Err(e) = self.connection.close().await {
            warn!(key = %self.key, "Error closing peer connection: {e}");
        }
        true
    }

    async fn apply_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.connection.set_remote_description(description).await?;
        self.has_remote_description = true;

        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            debug!(key = %self.key, count = pending.len(), "Applying queued ICE candidates");
        }
        for candidate in pending {
            self.apply_candidate(candidate).await;
        }
        Ok(())
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.connection.add_ice_candidate(candidate).await {
            let rejected = NegotiationError::CandidateRejected(e.to_string());
            warn!(key = %self.key, "{rejected}");
        }
    }

    fn expect_state(
        &self,
        expected: NegotiationState,
        action: &'static str,
    ) -> Result<(), NegotiationError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.invalid(action))
        }
    }

    const fn invalid(&self, action: &'static str) -> NegotiationError {
        if matches!(self.state, NegotiationState::Closed) {
            NegotiationError::Closed
        } else {
            NegotiationError::InvalidState {
                state: self.state,
                action,
            }
        }
    }
}
