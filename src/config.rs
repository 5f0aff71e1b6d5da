//! Client configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::media::MediaConstraints;
use crate::signaling::ReconnectPolicy;

/// Tunables for one mesh client.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Relay endpoint.
    pub signaling_url: String,
    /// STUN/TURN urls handed to every peer link.
    pub ice_servers: Vec<String>,
    pub media: MediaConstraints,
    pub reconnect: ReconnectPolicy,
    /// Delay between sending `join` and the roster resync request, giving
    /// the relay time to register the join.
    pub resync_grace: Duration,
    /// Where the current room id is persisted for silent rejoin; `None`
    /// disables persistence.
    pub storage_path: Option<PathBuf>,
    /// Feed the local audio track from the default capture device.
    pub capture_audio: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:8080".to_string(),
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            media: MediaConstraints::default(),
            reconnect: ReconnectPolicy::default(),
            resync_grace: Duration::from_millis(1000),
            storage_path: None,
            capture_audio: false,
        }
    }
}
