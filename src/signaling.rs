//! Wire vocabulary shared by the relay and its peers, plus the peer-side
//! WebSocket client.
//!
//! Every frame is a JSON object tagged by `event`:
//!
//! ```json
//! {"event":"join-room","roomId":"abc"}
//! {"event":"offer","roomId":"abc","description":{"type":"offer","sdp":"v=0..."}}
//! {"event":"joined-room","roomId":"abc"}
//! {"event":"ice-candidate","candidate":{"candidate":"candidate:1 1 UDP ..."}}
//! ```
//!
//! Descriptions and candidates are opaque JSON records; nothing here looks
//! inside them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::SignalingEndpoint;
use crate::error::{Error, Result};

pub type RoomId = String;
/// Session description record (`{"type": ..., "sdp": ...}`), passed through untouched.
pub type Description = serde_json::Value;
/// ICE candidate record, passed through untouched.
pub type Candidate = serde_json::Value;

const OUTBOUND_CAPACITY: usize = 100;

/// Client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: RoomId },
    #[serde(rename_all = "camelCase")]
    Offer {
        room_id: RoomId,
        description: Description,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        room_id: RoomId,
        description: Description,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        room_id: RoomId,
        candidate: Candidate,
    },
}

impl ClientMessage {
    pub fn event(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "ice-candidate",
        }
    }

    /// Splits a relayable message into its target room and the frame the
    /// other members receive. `join-room` is not relayed.
    pub fn into_relayed(self) -> Option<(RoomId, ServerMessage)> {
        match self {
            ClientMessage::JoinRoom { .. } => None,
            ClientMessage::Offer {
                room_id,
                description,
            } => Some((room_id, ServerMessage::Offer { description })),
            ClientMessage::Answer {
                room_id,
                description,
            } => Some((room_id, ServerMessage::Answer { description })),
            ClientMessage::IceCandidate { room_id, candidate } => {
                Some((room_id, ServerMessage::IceCandidate { candidate }))
            }
        }
    }
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    JoinedRoom { room_id: RoomId },
    Offer { description: Description },
    Answer { description: Description },
    IceCandidate { candidate: Candidate },
}

impl ServerMessage {
    pub fn event(&self) -> &'static str {
        match self {
            ServerMessage::JoinedRoom { .. } => "joined-room",
            ServerMessage::Offer { .. } => "offer",
            ServerMessage::Answer { .. } => "answer",
            ServerMessage::IceCandidate { .. } => "ice-candidate",
        }
    }
}

/// Outbound half of a signaling link.
#[derive(Clone)]
pub struct SignalSender {
    tx: mpsc::Sender<ClientMessage>,
}

impl SignalSender {
    pub fn new(tx: mpsc::Sender<ClientMessage>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, msg: ClientMessage) -> Result<()> {
        let event = msg.event();
        self.tx
            .send(msg)
            .await
            .map_err(|e| Error::Signaling(format!("Failed to send {}: {}", event, e)))
    }
}

type ListenerSlot = Arc<Mutex<Option<(u64, mpsc::UnboundedSender<ServerMessage>)>>>;

/// The single inbound listener of a signaling link.
///
/// Dropping it deregisters it. A newer subscription on the same client
/// replaces it, after which `recv` yields `None`.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<ServerMessage>,
    slot: Option<ListenerSlot>,
}

impl Subscription {
    /// Wraps a plain receiver, for in-process links that bypass the socket.
    pub fn detached(rx: mpsc::UnboundedReceiver<ServerMessage>) -> Self {
        Self { id: 0, rx, slot: None }
    }

    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        let mut current = slot.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(current.as_ref(), Some((id, _)) if *id == self.id) {
            *current = None;
            debug!("Signaling subscription {} deregistered", self.id);
        }
    }
}

pub struct SignalingClient {
    tx: mpsc::Sender<ClientMessage>,
    listener: ListenerSlot,
    next_subscription: AtomicU64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SignalingClient {
    pub async fn connect(endpoint: &SignalingEndpoint) -> Result<Self> {
        let url = endpoint.url();
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        info!("Connected to signaling server at {}", url);
        let (mut write, mut read) = ws_stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<ClientMessage>(OUTBOUND_CAPACITY);
        let listener: ListenerSlot = Arc::new(Mutex::new(None));

        // Handle outgoing messages
        let writer = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode {}: {}", msg.event(), e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    warn!("Signaling write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Handle incoming messages
        let slot = Arc::clone(&listener);
        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Signaling read failed: {}", e);
                        break;
                    }
                };
                let msg = match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("Ignoring unparseable signaling frame: {}", e);
                        continue;
                    }
                };
                dispatch(&slot, msg);
            }
            // Dropping the listener's sender ends its subscription.
            slot.lock().unwrap_or_else(|e| e.into_inner()).take();
            info!("Signaling connection closed");
        });

        Ok(Self {
            tx: outgoing_tx,
            listener,
            next_subscription: AtomicU64::new(1),
            reader,
            writer,
        })
    }

    pub fn sender(&self) -> SignalSender {
        SignalSender::new(self.tx.clone())
    }

    pub async fn send(&self, msg: ClientMessage) -> Result<()> {
        self.sender().send(msg).await
    }

    /// Installs the inbound listener, replacing any previous one.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let previous = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace((id, tx));
        if let Some((old, _)) = previous {
            debug!("Signaling subscription {} replaced by {}", old, id);
        }
        Subscription {
            id,
            rx,
            slot: Some(Arc::clone(&self.listener)),
        }
    }

    pub fn close(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn dispatch(slot: &ListenerSlot, msg: ServerMessage) {
    let mut current = slot.lock().unwrap_or_else(|e| e.into_inner());
    let delivered = match current.as_ref() {
        Some((_, tx)) => tx.send(msg).is_ok(),
        None => {
            debug!("No active subscription, dropping {}", msg.event());
            return;
        }
    };
    if !delivered {
        *current = None;
    }
}
