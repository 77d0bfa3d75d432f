//! Peer Sessions
//!
//! One [`PeerSession`] per remote participant, wrapping a single direct peer
//! connection behind the [`PeerConnection`] seam.

mod connection;
mod session;

pub use connection::{
    ConnectionState, PeerConnection, PeerConnectionFactory, PeerEnvelope, PeerEvent,
    PeerEventSink, RemoteStream, RemoteTrackInfo,
};
pub use session::{NegotiationState, PeerSession, PeerView, Role};
