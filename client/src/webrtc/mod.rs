//! WebRTC Backend
//!
//! [`PeerConnectionFactory`] implementation over webrtc-rs. Each connection
//! gets one sender per track kind so outgoing video can be swapped in place.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mesh_common::{IceCandidate, SdpType, SessionDescription};
use tokio::sync::Mutex;
use tracing::{debug, info};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors,
        media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8},
        APIBuilder, API,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::sdp_type::RTCSdpType, sdp::session_description::RTCSessionDescription,
        RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType},
        rtp_sender::RTCRtpSender,
    },
    track::{track_local::TrackLocal, track_remote::TrackRemote},
};

use crate::config::IceServerConfig;
use crate::error::NegotiationError;
use crate::media::{LocalTrack, TrackKind};
use crate::peer::{
    ConnectionState, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink,
    RemoteTrackInfo,
};

/// Builds webrtc-rs peer connections sharing one API instance.
pub struct RtcConnectionFactory {
    api: Arc<API>,
    config: RTCConfiguration,
}

impl RtcConnectionFactory {
    /// Register Opus and VP8 and the default interceptors.
    pub fn new(ice_servers: &[IceServerConfig]) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();

        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        info!(ice_servers = ice_servers.len(), "WebRTC backend initialized");

        Ok(Self {
            api: Arc::new(api),
            config: rtc_config(ice_servers),
        })
    }
}

fn rtc_config(ice_servers: &[IceServerConfig]) -> RTCConfiguration {
    let ice_servers = ice_servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();

    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcConnectionFactory {
    type Connection = RtcPeerConnection;

    async fn create(&self, events: PeerEventSink) -> Result<RtcPeerConnection, NegotiationError> {
        let pc = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);
        wire_events(&pc, &events);
        debug!(key = %events.key(), "Peer connection created");

        Ok(RtcPeerConnection {
            pc,
            senders: Mutex::new(HashMap::new()),
        })
    }
}

/// Forward connection callbacks into the mesh queue.
fn wire_events(pc: &RTCPeerConnection, events: &PeerEventSink) {
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                sink.emit(PeerEvent::GatheringComplete);
                return;
            };
            match candidate.to_json() {
                Ok(init) => sink.emit(PeerEvent::LocalCandidate(candidate_from_rtc(init))),
                Err(e) => debug!(key = %sink.key(), "Dropping unserializable candidate: {e}"),
            }
        })
    }));

    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let sink = sink.clone();
        Box::pin(async move {
            if let Some(state) = connection_state(state) {
                sink.emit(PeerEvent::StateChanged(state));
            }
        })
    }));

    let sink = events.clone();
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let sink = sink.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                RTPCodecType::Video => TrackKind::Video,
                RTPCodecType::Unspecified => return,
            };
            info!(
                key = %sink.key(),
                "Remote track received: {} ({})",
                track.kind(),
                track.codec().capability.mime_type
            );
            sink.emit(PeerEvent::RemoteTrack(RemoteTrackInfo {
                id: track.id(),
                kind,
                stream_id: track.stream_id(),
            }));
        })
    }));
}

const fn connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    Some(match state {
        RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        RTCPeerConnectionState::Unspecified => return None,
    })
}

/// A webrtc-rs peer connection.
pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
}

impl RtcPeerConnection {
    async fn sender(&self, kind: TrackKind) -> Result<Arc<RTCRtpSender>, NegotiationError> {
        self.senders
            .lock()
            .await
            .get(&kind)
            .cloned()
            .ok_or_else(|| NegotiationError::Track(format!("no {kind:?} sender")))
    }

    async fn keep_sender(&self, kind: TrackKind, sender: Arc<RTCRtpSender>) {
        // RTCP has to be read for interceptors to run.
        let rtcp = sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp.read(&mut buf).await.is_ok() {}
        });

        self.senders.lock().await.insert(kind, sender);
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        let sender = self
            .pc
            .add_track(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| NegotiationError::Track(e.to_string()))?;

        self.keep_sender(track.kind(), sender).await;
        Ok(())
    }

    async fn add_sender(&self, kind: TrackKind) -> Result<(), NegotiationError> {
        let codec = match kind {
            TrackKind::Audio => RTPCodecType::Audio,
            TrackKind::Video => RTPCodecType::Video,
        };
        let transceiver = self
            .pc
            .add_transceiver_from_kind(codec, None)
            .await
            .map_err(|e| NegotiationError::Track(e.to_string()))?;
        let sender = transceiver.sender().await;
        self.keep_sender(kind, sender).await;
        Ok(())
    }

    async fn clear_track(&self, kind: TrackKind) -> Result<(), NegotiationError> {
        let sender = self.sender(kind).await?;
        sender
            .replace_track(None)
            .await
            .map_err(|e| NegotiationError::Track(e.to_string()))
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        let sender = self.sender(track.kind()).await?;
        sender
            .replace_track(Some(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|e| NegotiationError::Track(e.to_string()))
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.pc.create_offer(None).await?;
        description_from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await?;
        description_from_rtc(&answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_local_description(description_to_rtc(description)?)
            .await
            .map_err(|e| NegotiationError::Sdp(e.to_string()))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_remote_description(description_to_rtc(description)?)
            .await
            .map_err(|e| NegotiationError::Sdp(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(candidate_to_rtc(candidate))
            .await
            .map_err(|e| NegotiationError::CandidateRejected(e.to_string()))
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.senders.lock().await.clear();
        self.pc.close().await?;
        Ok(())
    }
}

fn description_to_rtc(
    description: SessionDescription,
) -> Result<RTCSessionDescription, NegotiationError> {
    let parsed = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpType::Rollback => {
            return Err(NegotiationError::Sdp("rollback is not supported".into()))
        }
    };
    parsed.map_err(|e| NegotiationError::Sdp(e.to_string()))
}

fn description_from_rtc(
    description: &RTCSessionDescription,
) -> Result<SessionDescription, NegotiationError> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(NegotiationError::Sdp("unspecified description type".into()))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp.clone(),
    })
}

fn candidate_to_rtc(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn candidate_from_rtc(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}
