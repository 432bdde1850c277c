use std::collections::{HashMap, HashSet};
use std::fmt;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::signaling::RoomId;

const CONNECTION_ID_LEN: usize = 20;

/// Identifier handed to a transport link when it is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(CONNECTION_ID_LEN)
            .map(char::from)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What happens to a room once its last member leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyRoomPolicy {
    /// Keep the (inert) room around until `sweep_empty` runs.
    #[default]
    Retain,
    Remove,
}

#[derive(Debug, Clone)]
pub struct Room {
    pub id: RoomId,
    members: HashSet<ConnectionId>,
}

impl Room {
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            members: HashSet::new(),
        }
    }

    pub fn add_peer(&mut self, connection: ConnectionId) -> bool {
        self.members.insert(connection)
    }

    pub fn remove_peer(&mut self, connection: &ConnectionId) -> bool {
        self.members.remove(connection)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> impl Iterator<Item = &ConnectionId> {
        self.members.iter()
    }
}

/// Outcome of a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Joined {
    /// False when the connection was already a member.
    pub added: bool,
    /// Room the connection was moved out of, if it was elsewhere.
    pub moved_from: Option<RoomId>,
}

/// Room → member mapping. A connection belongs to at most one room.
///
/// Not synchronized; the relay owns it behind a single lock so that a join
/// or leave and the broadcast scoping that follows see the same snapshot.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, Room>,
    membership: HashMap<ConnectionId, RoomId>,
    policy: EmptyRoomPolicy,
}

impl RoomRegistry {
    pub fn new(policy: EmptyRoomPolicy) -> Self {
        Self {
            rooms: HashMap::new(),
            membership: HashMap::new(),
            policy,
        }
    }

    pub fn join(&mut self, connection: &ConnectionId, room_id: &str) -> Joined {
        let moved_from = match self.membership.get(connection) {
            Some(current) if current == room_id => None,
            Some(_) => self.leave(connection),
            None => None,
        };

        let added = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(room_id.to_string()))
            .add_peer(connection.clone());
        self.membership
            .insert(connection.clone(), room_id.to_string());

        Joined { added, moved_from }
    }

    /// Drops the connection from its room, returning that room's id.
    pub fn leave(&mut self, connection: &ConnectionId) -> Option<RoomId> {
        let room_id = self.membership.remove(connection)?;
        let now_empty = match self.rooms.get_mut(&room_id) {
            Some(room) => {
                room.remove_peer(connection);
                room.is_empty()
            }
            None => false,
        };
        if now_empty && self.policy == EmptyRoomPolicy::Remove {
            self.rooms.remove(&room_id);
        }
        Some(room_id)
    }

    /// Members of `room_id`, minus `excluding` when given.
    pub fn members_of(&self, room_id: &str, excluding: Option<&ConnectionId>) -> Vec<ConnectionId> {
        self.rooms
            .get(room_id)
            .map(|room| {
                room.members()
                    .filter(|member| Some(*member) != excluding)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn room_of(&self, connection: &ConnectionId) -> Option<&str> {
        self.membership.get(connection).map(String::as_str)
    }

    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Removes every empty room, returning how many went.
    pub fn sweep_empty(&mut self) -> usize {
        let before = self.rooms.len();
        self.rooms.retain(|_, room| !room.is_empty());
        before - self.rooms.len()
    }
}
