//! Signaling Protocol
//!
//! Events exchanged with a room-scoped signaling server. Every frame is a JSON
//! object `{"event": "<name>", "data": {...}}` where `<name>` is one of the
//! kebab-case event names below.
//!
//! | Direction | Event          | Meaning                                    |
//! |-----------|----------------|--------------------------------------------|
//! | out       | `join-room`    | announce presence                          |
//! | in        | `existing-peer`| already in the room, we initiate toward it |
//! | in        | `new-peer`     | just joined, it initiates toward us        |
//! | in/out    | `signal`       | offer / answer / candidate relay           |
//! | in        | `peer-left`    | participant departed                       |
//! | out       | `leave-room`   | explicit departure                         |
//! | in/out    | `chat-message` | out-of-band text                           |

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{ConnectionKey, IceCandidate, ParticipantId, RoomId, SdpType, SessionDescription};

/// Events sent from a client to the signaling server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: RoomId,
        participant_id: ParticipantId,
    },
    Signal(OutboundSignal),
    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: RoomId },
    ChatMessage(ChatMessage),
}

/// Events received from the signaling server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    ExistingPeer(PeerNotice),
    NewPeer(PeerNotice),
    Signal(InboundSignal),
    PeerLeft {
        #[serde(alias = "socketId")]
        key: ConnectionKey,
    },
    ChatMessage(ChatMessage),
}

/// Announcement of a remote participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerNotice {
    #[serde(alias = "socketId")]
    pub key: ConnectionKey,
    #[serde(default, alias = "userId", skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<ParticipantId>,
}

/// Negotiation step carried by a `signal` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    /// Wire name of the signal type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
        }
    }
}

/// A `signal` event addressed to a remote connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundSignal {
    pub to: ConnectionKey,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<ParticipantId>,
}

impl OutboundSignal {
    /// Wrap a local offer or answer for `to`.
    pub fn description(
        to: ConnectionKey,
        description: &SessionDescription,
        participant_id: Option<ParticipantId>,
    ) -> Result<Self> {
        let kind = match description.sdp_type {
            SdpType::Offer => SignalKind::Offer,
            SdpType::Answer => SignalKind::Answer,
            SdpType::Pranswer | SdpType::Rollback => {
                return Err(Error::Payload {
                    kind: "description",
                    reason: format!("{:?} descriptions are not relayed", description.sdp_type),
                })
            }
        };
        Ok(Self {
            to,
            kind,
            data: serde_json::to_value(description)?,
            participant_id,
        })
    }

    /// Wrap a local ICE candidate for `to`.
    pub fn candidate(
        to: ConnectionKey,
        candidate: &IceCandidate,
        participant_id: Option<ParticipantId>,
    ) -> Result<Self> {
        Ok(Self {
            to,
            kind: SignalKind::Candidate,
            data: serde_json::to_value(candidate)?,
            participant_id,
        })
    }
}

/// A `signal` event relayed from a remote connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundSignal {
    pub from: ConnectionKey,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub data: serde_json::Value,
    #[serde(default, alias = "fromUserId", skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<ParticipantId>,
}

impl InboundSignal {
    /// Decode the payload of an `offer` or `answer` signal.
    ///
    /// The description type must agree with the signal type.
    pub fn description(&self) -> Result<SessionDescription> {
        let description: SessionDescription =
            serde_json::from_value(self.data.clone()).map_err(|e| Error::Payload {
                kind: self.kind.as_str(),
                reason: e.to_string(),
            })?;

        let matches = matches!(
            (self.kind, description.sdp_type),
            (SignalKind::Offer, SdpType::Offer) | (SignalKind::Answer, SdpType::Answer)
        );
        if !matches {
            return Err(Error::Payload {
                kind: self.kind.as_str(),
                reason: format!("carries a {:?} description", description.sdp_type),
            });
        }
        Ok(description)
    }

    /// Decode the payload of a `candidate` signal.
    pub fn candidate(&self) -> Result<IceCandidate> {
        serde_json::from_value(self.data.clone()).map_err(|e| Error::Payload {
            kind: self.kind.as_str(),
            reason: e.to_string(),
        })
    }
}

/// Out-of-band room chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Room the message is addressed to.
    pub to: RoomId,
    /// Participant who wrote the message.
    pub from: ParticipantId,
    pub text: String,
}

impl ClientEvent {
    /// Encode as a text frame.
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire name of the event, for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::Signal(_) => "signal",
            Self::LeaveRoom { .. } => "leave-room",
            Self::ChatMessage(_) => "chat-message",
        }
    }
}

impl ServerEvent {
    /// Decode a text frame.
    pub fn from_frame(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Wire name of the event, for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ExistingPeer(_) => "existing-peer",
            Self::NewPeer(_) => "new-peer",
            Self::Signal(_) => "signal",
            Self::PeerLeft { .. } => "peer-left",
            Self::ChatMessage(_) => "chat-message",
        }
    }
}
