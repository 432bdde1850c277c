use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::Error;

/// Lifecycle of a negotiation agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationState {
    Idle,
    MediaReady,
    Negotiating,
    Connected,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::Idle => write!(f, "Idle"),
            NegotiationState::MediaReady => write!(f, "MediaReady"),
            NegotiationState::Negotiating => write!(f, "Negotiating"),
            NegotiationState::Connected => write!(f, "Connected"),
            NegotiationState::Closed => write!(f, "Closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentStatus {
    pub state: NegotiationState,
    pub role: Option<Role>,
    pub last_error: Option<String>,
    /// `joined-room` announcements received so far.
    pub announcements: u32,
    pub candidates_sent: u32,
    pub candidates_applied: u32,
    pub candidates_lost: u32,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self {
            state: NegotiationState::Idle,
            role: None,
            last_error: None,
            announcements: 0,
            candidates_sent: 0,
            candidates_applied: 0,
            candidates_lost: 0,
        }
    }
}

/// Publishes the agent's status to any number of observers.
#[derive(Clone)]
pub struct StatusMonitor {
    status: Arc<watch::Sender<AgentStatus>>,
    receiver: watch::Receiver<AgentStatus>,
}

impl StatusMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(AgentStatus::default());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    pub fn update_state(&self, state: NegotiationState) {
        self.status.send_modify(|status| status.state = state);
    }

    pub fn set_role(&self, role: Option<Role>) {
        self.status.send_modify(|status| status.role = role);
    }

    pub fn set_error(&self, error: &Error) {
        let message = format!("{}: {}", error.kind(), error);
        self.status.send_modify(|status| status.last_error = Some(message));
    }

    pub fn record_announcement(&self) {
        self.status.send_modify(|status| status.announcements += 1);
    }

    pub fn record_candidate_sent(&self) {
        self.status.send_modify(|status| status.candidates_sent += 1);
    }

    pub fn record_candidate_applied(&self) {
        self.status.send_modify(|status| status.candidates_applied += 1);
    }

    pub fn record_candidate_lost(&self) {
        self.status.send_modify(|status| status.candidates_lost += 1);
    }

    pub fn snapshot(&self) -> AgentStatus {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentStatus> {
        self.receiver.clone()
    }
}

impl Default for StatusMonitor {
    fn default() -> Self {
        Self::new()
    }
}
