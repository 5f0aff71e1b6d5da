//! Wire protocol and relay transport.
//!
//! The signaling client is a transport, not a policy layer: it serializes
//! and deserializes the message envelopes and hands every decoded message to
//! the coordinator unmodified.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::Result;

/// One JSON envelope on the relay channel.
///
/// The tag is the `type` field; `roomId`, `userId`, `from` and `target`
/// spell the relay's field names exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// Announce presence in a room.
    #[serde(rename_all = "camelCase")]
    Join { room_id: String, user_id: String },
    /// Request the current roster snapshot.
    #[serde(rename_all = "camelCase")]
    GetParticipants { room_id: String, user_id: String },
    /// Relay broadcast: a participant joined.
    #[serde(rename_all = "camelCase")]
    Joined { user_id: String, room_id: String },
    /// Relay reply: roster snapshot.
    Participants { participants: Vec<String> },
    /// Negotiation offer, relayed to `target`.
    #[serde(rename_all = "camelCase")]
    Offer {
        offer: RTCSessionDescription,
        target: String,
        from: String,
        room_id: String,
    },
    /// Negotiation answer, relayed to `target`.
    #[serde(rename_all = "camelCase")]
    Answer {
        answer: RTCSessionDescription,
        target: String,
        from: String,
        room_id: String,
    },
    /// One ICE candidate, relayed to `target`.
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        candidate: RTCIceCandidateInit,
        target: String,
        from: String,
        room_id: String,
    },
    /// Explicit departure notice.
    #[serde(rename_all = "camelCase")]
    Leave { room_id: String, user_id: String },
    /// Relay broadcast: a participant departed.
    #[serde(rename_all = "camelCase")]
    Left { user_id: String, room_id: String },
}

/// Retry policy for reconnecting a dropped signaling channel, kept apart
/// from the transport so an explicit leave can suppress any scheduled retry.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(1000),
        }
    }
}

impl ReconnectPolicy {
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Cloneable send half handed to whoever needs to emit messages.
#[derive(Clone)]
pub struct SignalSender {
    tx: mpsc::Sender<SignalMessage>,
}

impl SignalSender {
    /// Queue a message for the writer pump. A send after the channel has
    /// gone away is a logged no-op; callers must not rely on delivery over
    /// a channel that is not open.
    pub async fn send(&self, msg: SignalMessage) {
        if self.tx.send(msg).await.is_err() {
            debug!("signaling channel closed; dropping outbound message");
        }
    }
}

/// One logical connection to the relay.
///
/// `connect` splits the WebSocket into a writer pump (mpsc to sink) and a
/// reader pump (stream to mpsc). A malformed inbound frame is dropped and
/// logged; it never tears the channel down.
pub struct SignalingClient {
    outgoing: mpsc::Sender<SignalMessage>,
    incoming: mpsc::Receiver<SignalMessage>,
    close: Arc<watch::Sender<bool>>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (incoming_tx, incoming) = mpsc::channel::<SignalMessage>(64);
        let (outgoing, mut outgoing_rx) = mpsc::channel::<SignalMessage>(64);
        let (close_tx, close_rx) = watch::channel(false);
        let close = Arc::new(close_tx);

        let mut close_w = close_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = close_w.changed() => {
                        // Flush whatever was queued ahead of the close, so a
                        // best-effort leave notice still goes out.
                        while let Ok(msg) = outgoing_rx.try_recv() {
                            if let Ok(json) = serde_json::to_string(&msg) {
                                let _ = write.send(Message::Text(json)).await;
                            }
                        }
                        let _ = write.close().await;
                        break;
                    }
                    msg = outgoing_rx.recv() => {
                        let Some(msg) = msg else {
                            let _ = write.close().await;
                            break;
                        };
                        match serde_json::to_string(&msg) {
                            Ok(json) => {
                                if write.send(Message::Text(json)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("failed to encode signal message: {}", e),
                        }
                    }
                }
            }
        });

        let mut close_r = close_rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = close_r.changed() => break,
                    frame = read.next() => {
                        let Some(frame) = frame else { break };
                        let frame = match frame {
                            Ok(f) => f,
                            Err(e) => {
                                debug!("signaling read ended: {}", e);
                                break;
                            }
                        };
                        let text = match frame {
                            Message::Text(t) => t,
                            Message::Close(_) => break,
                            _ => continue,
                        };
                        match serde_json::from_str::<SignalMessage>(&text) {
                            Ok(msg) => {
                                if incoming_tx.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("dropping malformed signal message: {}", e),
                        }
                    }
                }
            }
        });

        Ok(Self {
            outgoing,
            incoming,
            close,
        })
    }

    pub fn sender(&self) -> SignalSender {
        SignalSender {
            tx: self.outgoing.clone(),
        }
    }

    /// Next decoded message, or `None` once the transport has dropped.
    pub async fn recv(&mut self) -> Option<SignalMessage> {
        self.incoming.recv().await
    }

    pub fn close(&self) {
        let _ = self.close.send(true);
    }

    /// Handle that outlives this client, letting the coordinator tear the
    /// pumps down after the client itself moved into the run loop.
    pub fn close_handle(&self) -> Arc<watch::Sender<bool>> {
        self.close.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_envelope_matches_wire_format() {
        let msg = SignalMessage::Join {
            room_id: "r1".into(),
            user_id: "alice".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"join\""));
        assert!(json.contains("\"roomId\":\"r1\""));
        assert!(json.contains("\"userId\":\"alice\""));
    }

    #[test]
    fn tags_are_kebab_case() {
        let msg = SignalMessage::GetParticipants {
            room_id: "r1".into(),
            user_id: "alice".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"get-participants\""));

        let msg = SignalMessage::IceCandidate {
            candidate: RTCIceCandidateInit {
                candidate: "candidate:1 1 udp 1 127.0.0.1 9 typ host".into(),
                ..Default::default()
            },
            target: "bob".into(),
            from: "alice".into(),
            room_id: "r1".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"ice-candidate\""));
        assert!(json.contains("\"target\":\"bob\""));
        assert!(json.contains("\"from\":\"alice\""));
    }

    #[test]
    fn parses_relay_offer() {
        let raw = json!({
            "type": "offer",
            "offer": { "type": "offer", "sdp": "v=0\r\n" },
            "target": "bob",
            "from": "alice",
            "roomId": "r9"
        })
        .to_string();
        match serde_json::from_str::<SignalMessage>(&raw).unwrap() {
            SignalMessage::Offer {
                target,
                from,
                room_id,
                offer,
            } => {
                assert_eq!(target, "bob");
                assert_eq!(from, "alice");
                assert_eq!(room_id, "r9");
                assert_eq!(offer.sdp, "v=0\r\n");
            }
            other => panic!("expected offer, got {:?}", other),
        }
    }

    #[test]
    fn parses_participants_snapshot() {
        let raw = r#"{"type":"participants","participants":["a","b","c"]}"#;
        match serde_json::from_str::<SignalMessage>(raw).unwrap() {
            SignalMessage::Participants { participants } => {
                assert_eq!(participants, vec!["a", "b", "c"]);
            }
            other => panic!("expected participants, got {:?}", other),
        }
    }

    #[test]
    fn malformed_message_is_an_error() {
        assert!(serde_json::from_str::<SignalMessage>("{not json").is_err());
        assert!(serde_json::from_str::<SignalMessage>(r#"{"type":"frobnicate"}"#).is_err());
    }
}
