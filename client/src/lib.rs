//! Meshcall Client Library
//!
//! Coordinates a full-mesh video room: one direct peer connection per remote
//! participant, negotiated over a room-scoped signaling server.

pub mod config;
pub mod error;
pub mod media;
pub mod mesh;
pub mod peer;
pub mod room;
pub mod signaling;
pub mod webrtc;

pub use config::{ClientConfig, IceServerConfig};
pub use error::{MediaError, NegotiationError, RoomError, SignalingError};
pub use mesh::{MeshEvent, MeshHandle, PeerMeshManager};
pub use room::{RoomController, RoomEvent};
pub use signaling::{connect_websocket, SignalingChannel};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter. Does nothing if a subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshcall_client=debug,mesh_common=debug".into()),
        )
        .try_init();
}
