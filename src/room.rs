//! Room lifecycle and the state published to the rendering layer.
//!
//! The UI only ever reads the published snapshot and issues the four
//! commands (join, leave, toggle audio, toggle video).

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use crate::streams::RemoteStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomLifecycle {
    Idle,
    Joining,
    Active,
    Leaving,
}

impl fmt::Display for RoomLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomLifecycle::Idle => write!(f, "idle"),
            RoomLifecycle::Joining => write!(f, "joining"),
            RoomLifecycle::Active => write!(f, "active"),
            RoomLifecycle::Leaving => write!(f, "leaving"),
        }
    }
}

/// Everything the rendering layer reads.
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub lifecycle: RoomLifecycle,
    pub room_id: Option<String>,
    pub user_id: String,
    /// Remote participant ids, sorted.
    pub participants: Vec<String>,
    pub remote_streams: Vec<RemoteStream>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub last_error: Option<String>,
}

impl RoomSnapshot {
    fn new(user_id: String) -> Self {
        Self {
            lifecycle: RoomLifecycle::Idle,
            room_id: None,
            user_id,
            participants: Vec::new(),
            remote_streams: Vec::new(),
            audio_enabled: false,
            video_enabled: false,
            last_error: None,
        }
    }

    /// Everyone in the room including the local participant.
    pub fn participant_count(&self) -> usize {
        self.participants.len() + usize::from(self.room_id.is_some())
    }
}

/// Watch-channel wrapper the coordinator publishes through.
#[derive(Clone)]
pub struct RoomPublisher {
    tx: Arc<watch::Sender<RoomSnapshot>>,
    rx: watch::Receiver<RoomSnapshot>,
}

impl RoomPublisher {
    pub fn new(user_id: &str) -> Self {
        let (tx, rx) = watch::channel(RoomSnapshot::new(user_id.to_string()));
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut RoomSnapshot)) {
        self.tx.send_modify(f);
    }

    pub fn subscribe(&self) -> watch::Receiver<RoomSnapshot> {
        self.rx.clone()
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        self.rx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_include_the_local_participant_once_in_a_room() {
        let publisher = RoomPublisher::new("me");
        assert_eq!(publisher.snapshot().participant_count(), 0);

        publisher.update(|s| {
            s.lifecycle = RoomLifecycle::Active;
            s.room_id = Some("r1".into());
            s.participants = vec!["peer".into()];
        });
        assert_eq!(publisher.snapshot().participant_count(), 2);
    }

    #[tokio::test]
    async fn subscribers_observe_updates() {
        let publisher = RoomPublisher::new("me");
        let mut rx = publisher.subscribe();
        publisher.update(|s| s.lifecycle = RoomLifecycle::Joining);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().lifecycle, RoomLifecycle::Joining);
    }
}
