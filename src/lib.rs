//! Two-party WebRTC rendezvous: a room-scoped signaling relay and the
//! per-participant negotiation agent that drives offer/answer and trickle
//! ICE through it.

pub mod agent;
pub mod audio;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod room;
pub mod rtc;
pub mod server;
pub mod signaling;

pub use agent::{AgentHandle, NegotiationAgent, NegotiationSession};
pub use audio::CpalMicrophone;
pub use config::{AgentConfig, CandidatePolicy, Scheme, ServerConfig, SignalingEndpoint};
pub use connection::{AgentStatus, NegotiationState, Role};
pub use engine::{EngineEvent, LocalMedia, MediaSource, NegotiationEngine};
pub use error::{Error, Result};
pub use room::{ConnectionId, EmptyRoomPolicy, Relay, RoomRegistry};
pub use rtc::WebRtcEngine;
pub use server::SignalingServer;
pub use signaling::{ClientMessage, ServerMessage, SignalingClient};
