//! Seams between the negotiation agent and the platform: the transport
//! negotiation primitives and local media capture.

use std::sync::Arc;

use async_trait::async_trait;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::Result;
use crate::signaling::{Candidate, Description};

/// Asynchronous notifications from the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A local candidate was gathered and should be trickled to the peer.
    LocalCandidate(Candidate),
    /// Connectivity established.
    Connected,
    /// Connectivity lost; the session may still recover.
    Failed(String),
    /// The transport session is gone.
    Closed,
}

/// Captured local media, ready to be attached to a session.
#[derive(Clone, Default)]
pub struct LocalMedia {
    pub label: String,
    pub tracks: Vec<Arc<TrackLocalStaticSample>>,
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<LocalMedia>;
}

/// Description and candidate primitives of a single peer session.
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    async fn attach_media(&self, media: &LocalMedia) -> Result<()>;

    async fn create_offer(&self) -> Result<Description>;

    async fn create_answer(&self) -> Result<Description>;

    async fn set_local_description(&self, description: Description) -> Result<()>;

    async fn set_remote_description(&self, description: Description) -> Result<()>;

    /// Abandons an unanswered local offer so a remote offer can be applied
    /// instead. Attached media stays attached.
    async fn discard_local_offer(&self) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
