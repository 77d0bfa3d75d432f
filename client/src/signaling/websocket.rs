//! WebSocket Signaling Transport
//!
//! Text frames carry one JSON-encoded event each. There is no reconnection:
//! losing the socket ends the inbound stream, which is room-fatal.

use futures::{SinkExt, StreamExt};
use mesh_common::protocol::ServerEvent;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::{Outbound, SignalingChannel, SignalingSender, SignalingStatus};
use crate::error::SignalingError;

/// Connect to a signaling server over WebSocket.
pub async fn connect_websocket(url: &str) -> Result<SignalingChannel, SignalingError> {
    info!("Connecting to signaling server: {url}");

    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|e| SignalingError::Connect(e.to_string()))?;
    info!("Signaling connected");

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(SignalingStatus::Connected);

    tokio::spawn(connection_loop(ws_stream, out_rx, in_tx, status_tx));

    Ok(SignalingChannel {
        sender: SignalingSender { tx: out_tx },
        events: in_rx,
        status: status_rx,
    })
}

/// Pump frames until either side closes.
async fn connection_loop(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    inbound_tx: mpsc::UnboundedSender<ServerEvent>,
    status: watch::Sender<SignalingStatus>,
) {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_server_message(&inbound_tx, text.as_str());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            warn!("Failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Signaling server closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        error!("Signaling socket error: {}", e);
                        break;
                    }
                    None => {
                        info!("Signaling stream ended");
                        break;
                    }
                    _ => {}
                }
            }

            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(Outbound::Event(event)) => match event.to_frame() {
                        Ok(json) => {
                            debug!("Sending: {}", json);
                            if let Err(e) = write.send(Message::Text(json.into())).await {
                                error!("Failed to send signaling frame: {}", e);
                                break;
                            }
                        }
                        Err(e) => error!("Failed to encode {}: {}", event.name(), e),
                    },
                    Some(Outbound::Close) | None => {
                        info!("Closing signaling connection");
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    status.send_replace(SignalingStatus::Disconnected);
}

/// Decode one text frame and hand it to the room.
fn handle_server_message(inbound_tx: &mpsc::UnboundedSender<ServerEvent>, text: &str) {
    match ServerEvent::from_frame(text) {
        Ok(event) => {
            debug!(event = event.name(), "Received signaling event");
            if inbound_tx.send(event).is_err() {
                debug!("Room stopped listening, dropping signaling event");
            }
        }
        Err(e) => {
            warn!("Failed to parse signaling message: {} - {}", e, text);
        }
    }
}
