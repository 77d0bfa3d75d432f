//! Shared Types

mod ids;
mod sdp;

pub use ids::{ConnectionKey, ParticipantId, RoomId};
pub use sdp::{IceCandidate, SdpType, SessionDescription};
