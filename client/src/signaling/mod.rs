//! Signaling Channel
//!
//! Reliable, ordered, bidirectional event channel to a room-scoped signaling
//! server. Sending is fire-and-forget: callers never wait for delivery.

mod websocket;

pub use websocket::connect_websocket;

use mesh_common::protocol::{ClientEvent, ServerEvent};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::SignalingError;

/// Transport status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalingStatus {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug)]
enum Outbound {
    Event(ClientEvent),
    Close,
}

/// Cloneable sending half of a [`SignalingChannel`].
#[derive(Debug, Clone)]
pub struct SignalingSender {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl SignalingSender {
    /// Queue an event for the server.
    pub fn send(&self, event: ClientEvent) -> Result<(), SignalingError> {
        debug!(event = event.name(), "Sending signaling event");
        self.tx
            .send(Outbound::Event(event))
            .map_err(|_| SignalingError::Disconnected)
    }

    /// Ask the transport to close once queued events are flushed.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

/// A connected signaling channel.
#[derive(Debug)]
pub struct SignalingChannel {
    sender: SignalingSender,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    status: watch::Receiver<SignalingStatus>,
}

impl SignalingChannel {
    /// Channel whose other end is held in-process, e.g. by a test harness or
    /// an embedded relay.
    pub fn loopback() -> (Self, LoopbackServer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SignalingStatus::Connected);

        let channel = Self {
            sender: SignalingSender { tx: out_tx },
            events: in_rx,
            status: status_rx,
        };
        let server = LoopbackServer {
            outbound: out_rx,
            inbound: Some(in_tx),
            status: status_tx,
            closed: false,
        };
        (channel, server)
    }

    pub fn sender(&self) -> SignalingSender {
        self.sender.clone()
    }

    pub fn status(&self) -> SignalingStatus {
        *self.status.borrow()
    }

    /// Split into the sending half and the inbound event stream.
    pub fn into_parts(self) -> (SignalingSender, mpsc::UnboundedReceiver<ServerEvent>) {
        (self.sender, self.events)
    }
}

/// Server side of a loopback [`SignalingChannel`].
#[derive(Debug)]
pub struct LoopbackServer {
    outbound: mpsc::UnboundedReceiver<Outbound>,
    inbound: Option<mpsc::UnboundedSender<ServerEvent>>,
    status: watch::Sender<SignalingStatus>,
    closed: bool,
}

impl LoopbackServer {
    /// Deliver an event to the client. Returns false once disconnected.
    pub fn deliver(&self, event: ServerEvent) -> bool {
        self.inbound
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    /// Everything the client has sent so far.
    pub fn drain(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Ok(outbound) = self.outbound.try_recv() {
            match outbound {
                Outbound::Event(event) => events.push(event),
                Outbound::Close => self.closed = true,
            }
        }
        events
    }

    /// Wait for the next event the client sends.
    pub async fn next(&mut self) -> Option<ClientEvent> {
        loop {
            match self.outbound.recv().await? {
                Outbound::Event(event) => return Some(event),
                Outbound::Close => self.closed = true,
            }
        }
    }

    /// Whether the client asked to close the channel.
    pub const fn close_requested(&self) -> bool {
        self.closed
    }

    /// Drop the connection from the server side.
    pub fn disconnect(&mut self) {
        self.inbound = None;
        self.status.send_replace(SignalingStatus::Disconnected);
    }
}
