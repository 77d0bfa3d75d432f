//! Identity Types
//!
//! A room is addressed by its [`RoomId`]. Inside a room every remote side is
//! addressed by the [`ConnectionKey`] the signaling server assigned to its
//! socket; the user-chosen [`ParticipantId`] is display identity only and may
//! be learned later than the key.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the raw identifier.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Room identifier chosen by the user who creates or joins the room.
    RoomId
);

string_id!(
    /// Opaque, transport-assigned identity of one remote connection.
    ///
    /// Unique within a room; the primary key of every peer session.
    ConnectionKey
);

string_id!(
    /// User-chosen display identity of a participant.
    ParticipantId
);
