//! Peer mesh behavior driven command by command.

mod support;

use mesh_common::protocol::{ClientEvent, InboundSignal, SignalKind};
use mesh_common::ConnectionKey;
use meshcall_client::media::{LocalTrack, TrackKind, TrackSource};
use meshcall_client::mesh::MeshCommand;
use meshcall_client::peer::{ConnectionState, NegotiationState, PeerEvent, RemoteTrackInfo, Role};
use meshcall_client::signaling::{LoopbackServer, SignalingChannel};
use meshcall_client::{MeshEvent, MeshHandle, PeerMeshManager};
use tokio::sync::broadcast;

use support::{
    answer_from, camera_tracks, candidate_from, local_candidate, offer_from, participant, signals,
    until, Call, FakeFactory,
};

fn mesh() -> (PeerMeshManager<FakeFactory>, FakeFactory, LoopbackServer) {
    mesh_with(FakeFactory::default())
}

fn mesh_with(factory: FakeFactory) -> (PeerMeshManager<FakeFactory>, FakeFactory, LoopbackServer) {
    let (channel, server) = SignalingChannel::loopback();
    let manager = PeerMeshManager::new(
        participant("me"),
        factory.clone(),
        channel.sender(),
        camera_tracks(),
        64,
    );
    (manager, factory, server)
}

fn key(raw: &str) -> ConnectionKey {
    ConnectionKey::new(raw)
}

fn drain(events: &mut broadcast::Receiver<MeshEvent>) -> Vec<MeshEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn left_count(events: &[MeshEvent], raw: &str) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, MeshEvent::PeerLeft(k) if k.as_str() == raw))
        .count()
}

#[tokio::test]
async fn existing_participants_each_get_exactly_one_offer() {
    let (mut mesh, factory, mut server) = mesh();

    for (k, p) in [("s1", "bob"), ("s2", "carol"), ("s3", "dave")] {
        mesh.on_existing_participant(key(k), Some(participant(p)))
            .await;
    }

    assert_eq!(mesh.len(), 3);
    for view in mesh.snapshot() {
        assert_eq!(view.role, Role::Initiator);
        assert_eq!(view.state, NegotiationState::Offering);
    }
    for k in ["s1", "s2", "s3"] {
        assert_eq!(factory.connection(k).count(|c| *c == Call::CreateOffer), 1);
    }

    let sent = signals(&server.drain());
    assert_eq!(
        sent,
        vec![
            ("s1".to_string(), SignalKind::Offer),
            ("s2".to_string(), SignalKind::Offer),
            ("s3".to_string(), SignalKind::Offer),
        ]
    );
}

#[tokio::test]
async fn duplicate_existing_peer_is_ignored() {
    let (mut mesh, factory, mut server) = mesh();

    mesh.on_existing_participant(key("s1"), None).await;
    mesh.on_existing_participant(key("s1"), None).await;

    assert_eq!(factory.connections_for("s1").len(), 1);
    assert_eq!(signals(&server.drain()).len(), 1);
}

#[tokio::test]
async fn new_participant_then_offer_uses_one_session() {
    let (mut mesh, factory, mut server) = mesh();

    mesh.on_new_participant(key("s1"), Some(participant("alice")))
        .await;
    assert_eq!(
        mesh.session(&key("s1")).map(|s| s.state()),
        Some(NegotiationState::AwaitingOffer)
    );

    mesh.on_signal(offer_from("s1")).await;

    assert_eq!(factory.connections_for("s1").len(), 1);
    let session = mesh.session(&key("s1")).unwrap();
    assert_eq!(session.role(), Role::Responder);
    assert_eq!(session.state(), NegotiationState::Negotiated);

    let sent = server.drain();
    assert_eq!(signals(&sent), vec![("s1".to_string(), SignalKind::Answer)]);
    let ClientEvent::Signal(answer) = &sent[0] else {
        panic!("expected signal");
    };
    assert_eq!(answer.participant_id, Some(participant("me")));
}

#[tokio::test]
async fn offer_from_unknown_key_creates_responder() {
    let (mut mesh, factory, mut server) = mesh();

    let mut offer = offer_from("s9");
    offer.participant_id = Some(participant("zoe"));
    mesh.on_signal(offer).await;

    let view = &mesh.snapshot()[0];
    assert_eq!(view.role, Role::Responder);
    assert_eq!(view.display_name(), "zoe");
    assert_eq!(factory.connections_for("s9").len(), 1);
    assert_eq!(
        signals(&server.drain()),
        vec![("s9".to_string(), SignalKind::Answer)]
    );
}

#[tokio::test]
async fn early_candidates_wait_for_the_offer() {
    let (mut mesh, factory, _server) = mesh();

    mesh.on_new_participant(key("s1"), None).await;
    mesh.on_signal(candidate_from("s1", "c1")).await;
    mesh.on_signal(candidate_from("s1", "c2")).await;

    assert_eq!(mesh.session(&key("s1")).unwrap().pending_candidates(), 2);
    let connection = factory.connection("s1");
    assert_eq!(
        connection.count(|c| matches!(c, Call::AddCandidate(_))),
        0
    );

    mesh.on_signal(offer_from("s1")).await;
    mesh.on_signal(candidate_from("s1", "c3")).await;

    let calls = connection.calls();
    let remote = calls
        .iter()
        .position(|c| *c == Call::SetRemote(mesh_common::SdpType::Offer))
        .unwrap();
    let applied: Vec<_> = calls
        .iter()
        .enumerate()
        .filter_map(|(i, c)| match c {
            Call::AddCandidate(candidate) => Some((i, candidate.as_str())),
            _ => None,
        })
        .collect();
    assert_eq!(
        applied.iter().map(|(_, c)| *c).collect::<Vec<_>>(),
        vec!["c1", "c2", "c3"]
    );
    assert!(applied.iter().all(|(i, _)| *i > remote));
    assert_eq!(mesh.session(&key("s1")).unwrap().pending_candidates(), 0);
}

#[tokio::test]
async fn malformed_candidate_is_dropped_without_closing() {
    let (mut mesh, _factory, _server) = mesh();

    mesh.on_new_participant(key("s1"), None).await;
    mesh.on_signal(InboundSignal {
        from: key("s1"),
        kind: SignalKind::Candidate,
        data: serde_json::json!({ "sdpMid": 3 }),
        participant_id: None,
    })
    .await;

    assert_eq!(
        mesh.session(&key("s1")).map(|s| s.state()),
        Some(NegotiationState::AwaitingOffer)
    );
}

#[tokio::test]
async fn answer_completes_initiator_negotiation() {
    let (mut mesh, factory, _server) = mesh();

    mesh.on_existing_participant(key("s1"), None).await;
    mesh.on_signal(candidate_from("s1", "early")).await;
    mesh.on_signal(answer_from("s1")).await;

    assert_eq!(
        mesh.session(&key("s1")).map(|s| s.state()),
        Some(NegotiationState::Negotiated)
    );
    assert_eq!(
        factory
            .connection("s1")
            .count(|c| *c == Call::AddCandidate("early".into())),
        1
    );
}

#[tokio::test]
async fn answer_without_offer_closes_only_that_session() {
    let (mut mesh, factory, _server) = mesh();
    mesh.on_existing_participant(key("s1"), None).await;

    mesh.on_signal(answer_from("s2")).await;

    assert!(mesh.session(&key("s2")).is_none());
    assert!(factory.connection("s2").is_closed());
    assert_eq!(
        mesh.session(&key("s1")).map(|s| s.state()),
        Some(NegotiationState::Offering)
    );
}

#[tokio::test]
async fn offer_to_initiator_closes_that_session() {
    let (mut mesh, factory, _server) = mesh();
    mesh.on_existing_participant(key("s1"), None).await;

    mesh.on_signal(offer_from("s1")).await;

    assert!(mesh.session(&key("s1")).is_none());
    assert!(factory.connection("s1").is_closed());
}

#[tokio::test]
async fn replacing_video_reaches_every_session_and_later_ones() {
    let (mut mesh, factory, _server) = mesh();
    for k in ["s1", "s2", "s3"] {
        mesh.on_existing_participant(key(k), None).await;
    }

    let screen = LocalTrack::new(TrackSource::Screen);
    mesh.replace_outgoing_video(screen.clone()).await;

    for k in ["s1", "s2", "s3"] {
        assert_eq!(
            factory.connection(k).video_track().as_deref(),
            Some(screen.id())
        );
    }
    for view in mesh.snapshot() {
        assert_eq!(view.outgoing_video.as_deref(), Some(screen.id()));
    }

    mesh.on_new_participant(key("s4"), None).await;
    let late = factory.connection("s4");
    assert_eq!(
        late.count(|c| matches!(c, Call::ReplaceTrack { .. })),
        0
    );
    assert_eq!(late.video_track().as_deref(), Some(screen.id()));
}

#[tokio::test]
async fn session_that_cannot_replace_video_is_closed() {
    let (mut mesh, factory, _server) = mesh();
    mesh.on_existing_participant(key("s1"), None).await;
    mesh.on_existing_participant(key("s2"), None).await;
    factory.connection("s2").fail_replace();

    mesh.replace_outgoing_video(LocalTrack::new(TrackSource::Screen))
        .await;

    assert!(mesh.session(&key("s1")).is_some());
    assert!(mesh.session(&key("s2")).is_none());
}

#[tokio::test]
async fn set_local_tracks_only_replaces_changed_tracks() {
    let (mut mesh, factory, _server) = mesh();
    mesh.on_existing_participant(key("s1"), None).await;

    let mut tracks = mesh.local_tracks().clone();
    let screen = LocalTrack::new(TrackSource::Screen);
    tracks.video = Some(screen.clone());
    mesh.set_local_tracks(tracks).await;

    let calls = factory.connection("s1").calls();
    let replaced: Vec<_> = calls
        .iter()
        .filter(|c| matches!(c, Call::ReplaceTrack { .. }))
        .collect();
    assert_eq!(
        replaced,
        vec![&Call::ReplaceTrack {
            kind: TrackKind::Video,
            id: screen.id().to_string(),
        }]
    );
}

#[tokio::test]
async fn dropping_video_applies_to_live_and_later_sessions() {
    let (mut mesh, factory, _server) = mesh();
    mesh.on_existing_participant(key("s1"), None).await;

    let mut tracks = mesh.local_tracks().clone();
    tracks.video = None;
    mesh.set_local_tracks(tracks).await;
    mesh.on_existing_participant(key("s2"), None).await;

    let views = mesh.snapshot();
    assert_eq!(views.len(), 2);
    for view in &views {
        assert!(view.outgoing_video.is_none());
        assert_eq!(view.outgoing_audio, views[0].outgoing_audio);
    }
    assert_eq!(
        factory
            .connection("s1")
            .count(|c| *c == Call::ClearTrack(TrackKind::Video)),
        1
    );
    for k in ["s1", "s2"] {
        let connection = factory.connection(k);
        assert!(connection.video_track().is_none());
        assert!(connection.has_sender(TrackKind::Video));
    }
}

#[tokio::test]
async fn video_added_back_reaches_sessions_that_started_without_it() {
    let (mut mesh, factory, _server) = mesh();
    let mut tracks = mesh.local_tracks().clone();
    tracks.video = None;
    mesh.set_local_tracks(tracks.clone()).await;
    mesh.on_existing_participant(key("s1"), None).await;
    mesh.on_new_participant(key("s2"), None).await;

    let camera = LocalTrack::new(TrackSource::Camera);
    tracks.video = Some(camera.clone());
    mesh.set_local_tracks(tracks).await;

    assert_eq!(mesh.len(), 2);
    for view in mesh.snapshot() {
        assert_eq!(view.outgoing_video.as_deref(), Some(camera.id()));
    }
    for k in ["s1", "s2"] {
        let connection = factory.connection(k);
        assert!(!connection.is_closed());
        assert_eq!(connection.video_track().as_deref(), Some(camera.id()));
    }
}

#[tokio::test]
async fn repeated_answer_leaves_the_session_negotiated() {
    let (mut mesh, factory, _server) = mesh();
    let mut events = mesh.subscribe();
    mesh.on_existing_participant(key("s1"), None).await;

    mesh.on_signal(answer_from("s1")).await;
    mesh.on_signal(answer_from("s1")).await;

    assert_eq!(
        mesh.session(&key("s1")).map(|s| s.state()),
        Some(NegotiationState::Negotiated)
    );
    let connection = factory.connection("s1");
    assert!(!connection.is_closed());
    assert_eq!(
        connection.count(|c| *c == Call::SetRemote(mesh_common::SdpType::Answer)),
        1
    );
    assert_eq!(left_count(&drain(&mut events), "s1"), 0);
}

#[tokio::test]
async fn leave_and_failure_close_a_session_once() {
    let (mut mesh, factory, _server) = mesh();
    let mut events = mesh.subscribe();
    mesh.on_existing_participant(key("s1"), None).await;
    let connection = factory.connection("s1");

    mesh.on_participant_left(&key("s1")).await;
    connection.emit(PeerEvent::StateChanged(ConnectionState::Failed));
    mesh.process_peer_events().await;
    mesh.on_participant_left(&key("s1")).await;

    assert_eq!(connection.count(|c| *c == Call::Close), 1);
    assert_eq!(left_count(&drain(&mut events), "s1"), 1);
    assert!(mesh.is_empty());
}

#[tokio::test]
async fn terminal_connection_states_close_the_session() {
    for state in [
        ConnectionState::Disconnected,
        ConnectionState::Failed,
        ConnectionState::Closed,
    ] {
        let (mut mesh, factory, _server) = mesh();
        mesh.on_existing_participant(key("s1"), None).await;

        factory.connection("s1").emit(PeerEvent::StateChanged(state));
        mesh.process_peer_events().await;

        assert!(mesh.is_empty(), "{state:?} should close the session");
        assert!(factory.connection("s1").is_closed());
    }
}

#[tokio::test]
async fn events_from_a_replaced_session_are_ignored() {
    let (mut mesh, factory, _server) = mesh();
    mesh.on_existing_participant(key("s1"), None).await;
    mesh.on_participant_left(&key("s1")).await;
    mesh.on_new_participant(key("s1"), None).await;

    let [old, new] = factory.connections_for("s1").try_into().ok().unwrap();
    old.emit(PeerEvent::StateChanged(ConnectionState::Failed));
    mesh.process_peer_events().await;

    assert!(!new.is_closed());
    assert_eq!(
        mesh.session(&key("s1")).map(|s| s.state()),
        Some(NegotiationState::AwaitingOffer)
    );
}

#[tokio::test]
async fn remote_track_connects_the_session() {
    let (mut mesh, factory, _server) = mesh();
    let mut events = mesh.subscribe();
    mesh.on_new_participant(key("s1"), Some(participant("alice")))
        .await;
    mesh.on_signal(offer_from("s1")).await;

    factory
        .connection("s1")
        .emit(PeerEvent::RemoteTrack(RemoteTrackInfo {
            id: "remote-video".into(),
            kind: TrackKind::Video,
            stream_id: "alice-stream".into(),
        }));
    mesh.process_peer_events().await;

    let view = &mesh.snapshot()[0];
    assert_eq!(view.state, NegotiationState::Connected);
    let stream = view.remote_stream.as_ref().unwrap();
    assert_eq!(stream.id, "alice-stream");
    assert_eq!(stream.tracks.len(), 1);

    let updates = drain(&mut events);
    assert!(matches!(updates.first(), Some(MeshEvent::PeerJoined(_))));
    assert!(matches!(
        updates.last(),
        Some(MeshEvent::PeerUpdated(v)) if v.remote_stream.is_some()
    ));
}

#[tokio::test]
async fn local_candidates_are_relayed_until_teardown() {
    let (mut mesh, factory, mut server) = mesh();
    mesh.on_existing_participant(key("s1"), None).await;
    let connection = factory.connection("s1");
    server.drain();

    connection.emit(local_candidate("local-1"));
    mesh.process_peer_events().await;
    assert_eq!(
        signals(&server.drain()),
        vec![("s1".to_string(), SignalKind::Candidate)]
    );

    mesh.teardown().await;
    connection.emit(local_candidate("local-2"));
    mesh.process_peer_events().await;
    assert!(server.drain().is_empty());
}

#[tokio::test]
async fn teardown_closes_everything_once() {
    let (mut mesh, factory, mut server) = mesh();
    let mut events = mesh.subscribe();
    mesh.on_existing_participant(key("s1"), None).await;
    mesh.on_new_participant(key("s2"), None).await;
    server.drain();

    mesh.teardown().await;
    mesh.teardown().await;
    mesh.on_existing_participant(key("s3"), None).await;

    assert!(mesh.is_empty());
    assert!(mesh.local_tracks().is_empty());
    for record in factory.connections() {
        assert_eq!(record.count(|c| *c == Call::Close), 1);
    }
    assert!(factory.connections_for("s3").is_empty());
    assert!(server.drain().is_empty());

    let events = drain(&mut events);
    assert_eq!(left_count(&events, "s1"), 1);
    assert_eq!(left_count(&events, "s2"), 1);
}

#[tokio::test]
async fn spawned_mesh_answers_snapshots_in_order() {
    let (manager, _factory, _server) = mesh();
    let (handle, task) = manager.spawn();

    handle.existing_participant(key("s2"), Some(participant("bob")));
    handle.new_participant(key("s1"), Some(participant("alice")));
    let views = handle.snapshot().await.unwrap();

    assert_eq!(
        views.iter().map(|v| v.key.as_str()).collect::<Vec<_>>(),
        vec!["s1", "s2"]
    );

    handle.teardown().await;
    task.await.unwrap();
    assert!(handle.is_closing());
    assert!(handle.snapshot().await.is_err());
}

#[tokio::test]
async fn teardown_command_stops_the_actor() {
    let (mut mesh, _factory, _server) = mesh();
    let (tx, rx) = tokio::sync::oneshot::channel();

    let flow = mesh.handle(MeshCommand::Teardown(tx)).await;

    assert!(flow.is_break());
    assert!(rx.await.is_ok());
}

async fn teardown_while_blocked(start: impl FnOnce(&MeshHandle), blocked_on: Call) {
    let (factory, gate) = FakeFactory::gated();
    let (manager, factory, mut server) = mesh_with(factory);
    let mut events = manager.subscribe();
    let (handle, task) = manager.spawn();

    start(&handle);
    until(|| {
        factory
            .connections_for("s1")
            .first()
            .is_some_and(|c| c.calls().contains(&blocked_on))
    })
    .await;

    let leaving = tokio::spawn({
        let handle = handle.clone();
        async move { handle.teardown().await }
    });
    until(|| handle.is_closing()).await;
    gate.notify_one();
    leaving.await.unwrap();
    task.await.unwrap();

    assert!(signals(&server.drain()).is_empty());
    assert!(factory.connection("s1").is_closed());
    assert_eq!(left_count(&drain(&mut events), "s1"), 1);
    assert!(handle.snapshot().await.is_err());
}

#[tokio::test]
async fn teardown_during_an_offer_sends_nothing() {
    teardown_while_blocked(
        |handle| handle.existing_participant(key("s1"), None),
        Call::CreateOffer,
    )
    .await;
}

#[tokio::test]
async fn teardown_during_an_answer_sends_nothing() {
    teardown_while_blocked(
        |handle| {
            handle.new_participant(key("s1"), None);
            handle.signal(offer_from("s1"));
        },
        Call::CreateAnswer,
    )
    .await;
}
