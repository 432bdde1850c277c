use std::net::SocketAddr;
use std::time::Duration;

use crate::room::state::EmptyRoomPolicy;

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_QUEUE_DEPTH: usize = 128;
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_MAX_PENDING_CANDIDATES: usize = 64;

/// Relay server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,
    /// Per-connection outbound queue; a full queue drops the message.
    /// Zero is raised to one when the server binds.
    pub queue_depth: usize,
    pub empty_rooms: EmptyRoomPolicy,
    /// Periodically forget rooms left without members.
    pub sweep_interval: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            empty_rooms: EmptyRoomPolicy::Retain,
            sweep_interval: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Ws,
    Wss,
}

/// Where a peer reaches the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingEndpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl SignalingEndpoint {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    pub fn url(&self) -> String {
        let scheme = match self.scheme {
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

impl From<SocketAddr> for SignalingEndpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(Scheme::Ws, addr.ip().to_string(), addr.port())
    }
}

/// What to do with remote candidates that arrive before a remote description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CandidatePolicy {
    /// Queue them and apply in arrival order once the remote description lands.
    #[default]
    Buffer,
    /// Try to apply immediately; the failure is logged and the candidate lost.
    DropOnRace,
}

/// Per-participant negotiation settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub room_id: String,
    pub ice_servers: Vec<String>,
    pub candidate_policy: CandidatePolicy,
    /// Early remote candidates held under [`CandidatePolicy::Buffer`];
    /// anything past this is counted as lost.
    pub max_pending_candidates: usize,
}

impl AgentConfig {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            candidate_policy: CandidatePolicy::default(),
            max_pending_candidates: DEFAULT_MAX_PENDING_CANDIDATES,
        }
    }
}
