use std::collections::HashMap;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::state::{ConnectionId, EmptyRoomPolicy, RoomRegistry};

struct Inner<M> {
    rooms: RoomRegistry,
    outlets: HashMap<ConnectionId, mpsc::Sender<M>>,
}

/// Room-scoped fan-out over per-connection outbound queues.
///
/// Generic over the frame type; the relay never inspects what it forwards.
/// Membership changes and the fan-out that reads them run under one lock,
/// so every broadcast sees a consistent member set.
pub struct Relay<M> {
    inner: Mutex<Inner<M>>,
}

impl<M: Clone + Send> Relay<M> {
    pub fn new(policy: EmptyRoomPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                rooms: RoomRegistry::new(policy),
                outlets: HashMap::new(),
            }),
        }
    }

    /// Attaches the outbound queue of a freshly accepted connection.
    pub async fn connect(&self, connection: ConnectionId, outlet: mpsc::Sender<M>) {
        self.inner.lock().await.outlets.insert(connection, outlet);
    }

    /// Adds `connection` to `room_id` and announces the membership to every
    /// member, the joiner included. Repeat joins announce again.
    pub async fn join(&self, connection: &ConnectionId, room_id: &str, announcement: M) -> usize {
        let mut inner = self.inner.lock().await;
        let joined = inner.rooms.join(connection, room_id);
        if let Some(previous) = &joined.moved_from {
            debug!("{} moved from room {} to {}", connection, previous, room_id);
        } else if !joined.added {
            debug!("{} is already in room {}, announcing again", connection, room_id);
        }
        let members = inner.rooms.members_of(room_id, None);
        inner.deliver(&members, announcement)
    }

    /// Forwards `frame` to every other member of `room_id`. Returns the
    /// number of members it was queued for; zero is not an error.
    pub async fn forward(&self, sender: &ConnectionId, room_id: &str, frame: M) -> usize {
        let inner = self.inner.lock().await;
        let targets = inner.rooms.members_of(room_id, Some(sender));
        if targets.is_empty() {
            debug!("No other members in room {}, dropping frame from {}", room_id, sender);
            return 0;
        }
        inner.deliver(&targets, frame)
    }

    /// Forgets the connection and removes it from its room. Remaining
    /// members are not told.
    pub async fn disconnect(&self, connection: &ConnectionId) -> Option<String> {
        let mut inner = self.inner.lock().await;
        inner.outlets.remove(connection);
        inner.rooms.leave(connection)
    }

    pub async fn members_of(&self, room_id: &str, excluding: Option<&ConnectionId>) -> Vec<ConnectionId> {
        self.inner.lock().await.rooms.members_of(room_id, excluding)
    }

    pub async fn room_of(&self, connection: &ConnectionId) -> Option<String> {
        self.inner.lock().await.rooms.room_of(connection).map(str::to_string)
    }

    pub async fn room_count(&self) -> usize {
        self.inner.lock().await.rooms.room_count()
    }

    /// Forgets rooms that currently have no members.
    pub async fn sweep_empty(&self) -> usize {
        self.inner.lock().await.rooms.sweep_empty()
    }
}

impl<M: Clone> Inner<M> {
    fn deliver(&self, targets: &[ConnectionId], frame: M) -> usize {
        let mut delivered = 0;
        for target in targets {
            let Some(outlet) = self.outlets.get(target) else {
                continue;
            };
            match outlet.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("Outbound queue of {} is full, dropping frame", target);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Outbound queue of {} is closed", target);
                }
            }
        }
        delivered
    }
}
