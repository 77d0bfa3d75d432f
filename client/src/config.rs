//! Client Configuration
//!
//! Loads configuration from environment variables.

use std::env;

use anyhow::{bail, Context, Result};

/// ICE server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl Default for IceServerConfig {
    fn default() -> Self {
        Self {
            urls: vec![DEFAULT_STUN_SERVER.to_string()],
            username: None,
            credential: None,
        }
    }
}

const DEFAULT_SIGNALING_URL: &str = "ws://localhost:3001";
const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
const DEFAULT_EVENT_BUFFER: usize = 256;

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Signaling server WebSocket URL (e.g., "ws://localhost:3001")
    pub signaling_url: String,

    /// WebRTC STUN server
    pub stun_server: String,

    /// WebRTC TURN server (optional)
    pub turn_server: Option<String>,

    /// WebRTC TURN username (optional)
    pub turn_username: Option<String>,

    /// WebRTC TURN credential (optional)
    pub turn_credential: Option<String>,

    /// Capacity of the UI event broadcast (default: 256)
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.into(),
            stun_server: DEFAULT_STUN_SERVER.into(),
            turn_server: None,
            turn_username: None,
            turn_credential: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let event_buffer = match lookup("MESHCALL_EVENT_BUFFER") {
            Some(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("MESHCALL_EVENT_BUFFER is not a number: {raw}"))?,
            None => DEFAULT_EVENT_BUFFER,
        };
        if event_buffer == 0 {
            bail!("MESHCALL_EVENT_BUFFER must be greater than zero");
        }

        let config = Self {
            signaling_url: lookup("MESHCALL_SIGNALING_URL")
                .unwrap_or_else(|| DEFAULT_SIGNALING_URL.into()),
            stun_server: lookup("MESHCALL_STUN_SERVER")
                .unwrap_or_else(|| DEFAULT_STUN_SERVER.into()),
            turn_server: lookup("MESHCALL_TURN_SERVER"),
            turn_username: lookup("MESHCALL_TURN_USERNAME"),
            turn_credential: lookup("MESHCALL_TURN_CREDENTIAL"),
            event_buffer,
        };

        url::Url::parse(&config.signaling_url)
            .with_context(|| format!("Invalid MESHCALL_SIGNALING_URL: {}", config.signaling_url))?;

        Ok(config)
    }

    /// ICE servers handed to every peer connection.
    ///
    /// A TURN entry is only added when server, username and credential are
    /// all present.
    #[must_use]
    pub fn ice_servers(&self) -> Vec<IceServerConfig> {
        let mut servers = vec![IceServerConfig {
            urls: vec![self.stun_server.clone()],
            username: None,
            credential: None,
        }];

        if let (Some(url), Some(username), Some(credential)) = (
            &self.turn_server,
            &self.turn_username,
            &self.turn_credential,
        ) {
            servers.push(IceServerConfig {
                urls: vec![url.clone()],
                username: Some(username.clone()),
                credential: Some(credential.clone()),
            });
        }

        servers
    }
}
