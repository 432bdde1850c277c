use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

#[derive(Debug, Error)]
pub enum Error {
    /// Local capture denied or no device available.
    #[error("media acquisition failed: {0}")]
    MediaAcquisition(String),

    /// Malformed or out-of-order description or candidate.
    #[error("description application failed: {0}")]
    DescriptionApplication(String),

    /// Underlying connectivity lost or the transport refused an operation.
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable kind label used in logs and status snapshots.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::MediaAcquisition(_) => "media-acquisition",
            Error::DescriptionApplication(_) => "description-application",
            Error::Transport(_) => "transport",
            Error::Signaling(_) => "signaling",
            Error::Ws(_) => "websocket",
            Error::WebRTC(_) => "webrtc",
            Error::Json(_) => "json",
            Error::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
