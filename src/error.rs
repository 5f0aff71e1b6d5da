use std::fmt;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRtcError;

/// Crate-wide error type.
///
/// Variants follow the failure taxonomy of the mesh: transport failures are
/// retryable, media-access failures are fatal to a join attempt, negotiation
/// and protocol failures are scoped to a single message.
#[derive(Debug)]
pub enum Error {
    /// Signaling channel unreachable or dropped.
    Transport(String),
    /// Capture device missing or permission denied.
    MediaAccess(String),
    /// Stale or out-of-order SDP/ICE for one peer link.
    Negotiation(String),
    /// Unparseable or malformed wire message.
    Protocol(String),
    /// Error surfaced by the WebRTC engine.
    WebRtc(WebRtcError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "transport error: {}", e),
            Error::MediaAccess(e) => write!(f, "media access error: {}", e),
            Error::Negotiation(e) => write!(f, "negotiation error: {}", e),
            Error::Protocol(e) => write!(f, "protocol error: {}", e),
            Error::WebRtc(e) => write!(f, "webrtc error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<WebRtcError> for Error {
    fn from(err: WebRtcError) -> Self {
        Error::WebRtc(err)
    }
}

impl From<WsError> for Error {
    fn from(err: WsError) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Protocol(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
