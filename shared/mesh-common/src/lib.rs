//! Meshcall Common Library
//!
//! Signaling protocol and identity types shared by the mesh client and any
//! signaling server that honours the room contract.

pub mod error;
pub mod protocol;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
