//! In-memory collaborators for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mesh_common::protocol::{ClientEvent, InboundSignal, ServerEvent, SignalKind};
use mesh_common::{ConnectionKey, IceCandidate, ParticipantId, SdpType, SessionDescription};
use meshcall_client::media::{
    LocalTrack, LocalTrackSet, MediaDevices, MediaStream, ScreenCapture, TrackKind, TrackSource,
};
use meshcall_client::peer::{PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink};
use meshcall_client::signaling::LoopbackServer;
use meshcall_client::{MediaError, NegotiationError, RoomEvent};
use tokio::sync::{broadcast, oneshot, Notify};

const WAIT: Duration = Duration::from_secs(2);

/// Something a fake connection was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    AddTrack { kind: TrackKind, id: String },
    AddSender(TrackKind),
    ReplaceTrack { kind: TrackKind, id: String },
    ClearTrack(TrackKind),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    Close,
}

/// Shared record of one fake peer connection.
pub struct ConnectionRecord {
    pub key: ConnectionKey,
    sink: PeerEventSink,
    calls: Mutex<Vec<Call>>,
    fail_replace: AtomicBool,
}

impl ConnectionRecord {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| matches(c)).count()
    }

    pub fn is_closed(&self) -> bool {
        self.calls().contains(&Call::Close)
    }

    /// Id of the video track this connection currently sends.
    pub fn video_track(&self) -> Option<String> {
        self.calls()
            .into_iter()
            .rev()
            .find_map(|c| match c {
                Call::AddTrack {
                    kind: TrackKind::Video,
                    id,
                }
                | Call::ReplaceTrack {
                    kind: TrackKind::Video,
                    id,
                } => Some(Some(id)),
                Call::AddSender(TrackKind::Video) | Call::ClearTrack(TrackKind::Video) => {
                    Some(None)
                }
                _ => None,
            })
            .flatten()
    }

    /// Whether this connection has a sender of `kind`, with or without media.
    pub fn has_sender(&self, kind: TrackKind) -> bool {
        self.calls().iter().any(|c| {
            matches!(c, Call::AddTrack { kind: k, .. } if *k == kind)
                || *c == Call::AddSender(kind)
        })
    }

    /// Simulate a callback from the underlying transport.
    pub fn emit(&self, event: PeerEvent) {
        self.sink.emit(event);
    }

    pub fn fail_replace(&self) {
        self.fail_replace.store(true, Ordering::SeqCst);
    }
}

/// Peer connection that records calls and always succeeds. A gated
/// connection holds each offer and answer until the gate is opened.
pub struct FakeConnection {
    record: Arc<ConnectionRecord>,
    gate: Option<Arc<Notify>>,
}

impl FakeConnection {
    async fn wait_for_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        self.record.record(Call::AddTrack {
            kind: track.kind(),
            id: track.id().to_string(),
        });
        Ok(())
    }

    async fn add_sender(&self, kind: TrackKind) -> Result<(), NegotiationError> {
        self.record.record(Call::AddSender(kind));
        Ok(())
    }

    async fn clear_track(&self, kind: TrackKind) -> Result<(), NegotiationError> {
        self.record.record(Call::ClearTrack(kind));
        Ok(())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        if self.record.fail_replace.load(Ordering::SeqCst) {
            return Err(NegotiationError::Track("sender gone".into()));
        }
        self.record.record(Call::ReplaceTrack {
            kind: track.kind(),
            id: track.id().to_string(),
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.record.record(Call::CreateOffer);
        self.wait_for_gate().await;
        Ok(SessionDescription::offer(format!("offer-to-{}", self.record.key)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.record.record(Call::CreateAnswer);
        self.wait_for_gate().await;
        Ok(SessionDescription::answer(format!("answer-to-{}", self.record.key)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.record.record(Call::SetLocal(description.sdp_type));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.record.record(Call::SetRemote(description.sdp_type));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.record.record(Call::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.record.record(Call::Close);
        Ok(())
    }
}

/// Factory handing out [`FakeConnection`]s. Clones share the record list.
#[derive(Clone, Default)]
pub struct FakeFactory {
    connections: Arc<Mutex<Vec<Arc<ConnectionRecord>>>>,
    gate: Option<Arc<Notify>>,
}

impl FakeFactory {
    /// Factory whose connections block in `create_offer`/`create_answer`
    /// until the returned gate is notified.
    pub fn gated() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let factory = Self {
            gate: Some(gate.clone()),
            ..Self::default()
        };
        (factory, gate)
    }

    pub fn connections(&self) -> Vec<Arc<ConnectionRecord>> {
        self.connections.lock().unwrap().clone()
    }

    /// Every connection ever created for `key`, oldest first.
    pub fn connections_for(&self, key: &str) -> Vec<Arc<ConnectionRecord>> {
        self.connections()
            .into_iter()
            .filter(|c| c.key.as_str() == key)
            .collect()
    }

    /// Most recent connection for `key`.
    pub fn connection(&self, key: &str) -> Arc<ConnectionRecord> {
        self.connections_for(key)
            .pop()
            .unwrap_or_else(|| panic!("no connection for {key}"))
    }
}

#[async_trait]
impl PeerConnectionFactory for FakeFactory {
    type Connection = FakeConnection;

    async fn create(&self, events: PeerEventSink) -> Result<FakeConnection, NegotiationError> {
        let record = Arc::new(ConnectionRecord {
            key: events.key().clone(),
            sink: events,
            calls: Mutex::new(Vec::new()),
            fail_replace: AtomicBool::new(false),
        });
        self.connections.lock().unwrap().push(record.clone());
        Ok(FakeConnection {
            record,
            gate: self.gate.clone(),
        })
    }
}

/// Capture devices backed by in-memory tracks.
#[derive(Clone, Default)]
pub struct FakeDevices {
    deny: bool,
    screen_end: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl FakeDevices {
    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    /// Act as the platform's "stop sharing" control.
    pub fn end_screen_capture(&self) {
        if let Some(tx) = self.screen_end.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn user_media(&self) -> Result<MediaStream, MediaError> {
        if self.deny {
            return Err(MediaError::AccessDenied);
        }
        Ok(MediaStream::new(vec![
            LocalTrack::new(TrackSource::Microphone),
            LocalTrack::new(TrackSource::Camera),
        ]))
    }

    async fn display_media(&self) -> Result<ScreenCapture, MediaError> {
        let (tx, rx) = oneshot::channel();
        *self.screen_end.lock().unwrap() = Some(tx);
        Ok(ScreenCapture {
            stream: MediaStream::new(vec![LocalTrack::new(TrackSource::Screen)]),
            ended: rx,
        })
    }
}

pub fn camera_tracks() -> LocalTrackSet {
    LocalTrackSet {
        audio: Some(LocalTrack::new(TrackSource::Microphone)),
        video: Some(LocalTrack::new(TrackSource::Camera)),
    }
}

pub fn existing_peer(key: &str, participant: &str) -> ServerEvent {
    ServerEvent::ExistingPeer(mesh_common::protocol::PeerNotice {
        key: key.into(),
        participant_id: Some(participant.into()),
    })
}

pub fn new_peer(key: &str, participant: &str) -> ServerEvent {
    ServerEvent::NewPeer(mesh_common::protocol::PeerNotice {
        key: key.into(),
        participant_id: Some(participant.into()),
    })
}

pub fn offer_from(key: &str) -> InboundSignal {
    InboundSignal {
        from: key.into(),
        kind: SignalKind::Offer,
        data: serde_json::to_value(SessionDescription::offer(format!("offer-from-{key}")))
            .unwrap(),
        participant_id: None,
    }
}

pub fn answer_from(key: &str) -> InboundSignal {
    InboundSignal {
        from: key.into(),
        kind: SignalKind::Answer,
        data: serde_json::to_value(SessionDescription::answer(format!("answer-from-{key}")))
            .unwrap(),
        participant_id: None,
    }
}

pub fn candidate_from(key: &str, candidate: &str) -> InboundSignal {
    InboundSignal {
        from: key.into(),
        kind: SignalKind::Candidate,
        data: serde_json::json!({ "candidate": candidate, "sdpMid": "0", "sdpMLineIndex": 0 }),
        participant_id: None,
    }
}

pub fn local_candidate(candidate: &str) -> PeerEvent {
    PeerEvent::LocalCandidate(IceCandidate {
        candidate: candidate.into(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    })
}

/// Signals in `events` as `(to, kind)` pairs.
pub fn signals(events: &[ClientEvent]) -> Vec<(String, SignalKind)> {
    events
        .iter()
        .filter_map(|e| match e {
            ClientEvent::Signal(s) => Some((s.to.to_string(), s.kind)),
            _ => None,
        })
        .collect()
}

/// Next event the client sends to the server.
pub async fn next_sent(server: &mut LoopbackServer) -> ClientEvent {
    tokio::time::timeout(WAIT, server.next())
        .await
        .expect("timed out waiting for client event")
        .expect("signaling channel closed")
}

/// Skip client events until one matches.
pub async fn sent_until(
    server: &mut LoopbackServer,
    matches: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    loop {
        let event = next_sent(server).await;
        if matches(&event) {
            return event;
        }
    }
}

/// Wait until `condition` holds, polling.
pub async fn until(condition: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}

/// Skip room events until one matches.
pub async fn event_until(
    events: &mut broadcast::Receiver<RoomEvent>,
    matches: impl Fn(&RoomEvent) -> bool,
) -> RoomEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("room events closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for room event")
}

pub fn participant(id: &str) -> ParticipantId {
    ParticipantId::new(id)
}
