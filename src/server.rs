//! WebSocket front end of the relay.
//!
//! One task per accepted connection. Each inbound frame is handled to
//! completion before the next one from the same connection is read, which
//! keeps a sender's frames FIFO all the way to the other members' queues.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::room::{ConnectionId, Relay};
use crate::signaling::{ClientMessage, ServerMessage};

pub type SignalingRelay = Relay<ServerMessage>;

/// Pause after a failed accept so a persistent error (e.g. out of file
/// descriptors) does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct SignalingServer {
    listener: TcpListener,
    relay: Arc<SignalingRelay>,
    config: ServerConfig,
}

impl SignalingServer {
    pub async fn bind(mut config: ServerConfig) -> Result<Self> {
        if config.queue_depth == 0 {
            warn!("Outbound queue depth 0 is not usable, using 1");
            config.queue_depth = 1;
        }
        if config.sweep_interval == Some(Duration::ZERO) {
            warn!("Empty-room sweep interval 0 is not usable, sweeping disabled");
            config.sweep_interval = None;
        }
        let listener = TcpListener::bind(config.bind_address).await?;
        let relay = Arc::new(Relay::new(config.empty_rooms));
        Ok(Self {
            listener,
            relay,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn relay(&self) -> Arc<SignalingRelay> {
        Arc::clone(&self.relay)
    }

    /// Accepts connections forever. Failed accepts are logged and skipped.
    pub async fn serve(self) -> Result<()> {
        info!("Signaling server listening on {}", self.local_addr()?);
        let listener = &self.listener;
        let accepting = accept_loop(
            move || listener.accept(),
            Arc::clone(&self.relay),
            self.config.queue_depth,
        );
        match self.config.sweep_interval {
            Some(period) => {
                tokio::select! {
                    _ = accepting => {}
                    _ = sweep_empty_rooms(Arc::clone(&self.relay), period) => {}
                }
            }
            None => accepting.await,
        }
        Ok(())
    }
}

async fn accept_loop<A, F>(mut accept: A, relay: Arc<SignalingRelay>, queue_depth: usize)
where
    A: FnMut() -> F,
    F: Future<Output = io::Result<(TcpStream, SocketAddr)>>,
{
    loop {
        let (stream, addr) = match accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let relay = Arc::clone(&relay);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, relay, queue_depth).await {
                warn!("Connection from {} ended with error: {}", addr, e);
            }
        });
    }
}

/// Forgets empty rooms every `period`, for as long as it is polled.
async fn sweep_empty_rooms(relay: Arc<SignalingRelay>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let removed = relay.sweep_empty().await;
        if removed > 0 {
            debug!("Swept {} empty room(s)", removed);
        }
    }
}

/// Drives a single WebSocket connection from handshake to cleanup.
pub async fn handle_connection(
    stream: TcpStream,
    relay: Arc<SignalingRelay>,
    queue_depth: usize,
) -> Result<()> {
    let addr = stream.peer_addr()?;
    let ws_stream = accept_async(stream).await?;
    let connection = ConnectionId::random();
    info!("A user connected: {} ({})", connection, addr);

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(queue_depth);
    relay.connect(connection.clone(), tx).await;

    let writer_id = connection.clone();
    let forward_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to encode {} for {}: {}", msg.event(), writer_id, e);
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(Message::Text(json)).await {
                debug!("Failed to send to {}: {}", writer_id, e);
                break;
            }
        }
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => handle_message(&relay, &connection, msg).await,
                Err(e) => warn!("Ignoring malformed frame from {}: {}", connection, e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Transport error on {}: {}", connection, e);
                break;
            }
        }
    }

    let room = relay.disconnect(&connection).await;
    forward_task.abort();
    info!("User disconnected: {} (room: {:?})", connection, room);
    Ok(())
}

async fn handle_message(relay: &SignalingRelay, connection: &ConnectionId, msg: ClientMessage) {
    match msg {
        ClientMessage::JoinRoom { room_id } => {
            let announcement = ServerMessage::JoinedRoom {
                room_id: room_id.clone(),
            };
            let notified = relay.join(connection, &room_id, announcement).await;
            info!("{} joined room {} ({} notified)", connection, room_id, notified);
        }
        relayed => {
            let event = relayed.event();
            if let Some((room_id, frame)) = relayed.into_relayed() {
                let delivered = relay.forward(connection, &room_id, frame).await;
                debug!(
                    "Relayed {} from {} in room {} to {} member(s)",
                    event, connection, room_id, delivered
                );
            }
        }
    }
}
