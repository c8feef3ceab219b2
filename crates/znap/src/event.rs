//! Live feed frames.
//!
//! Inbound frames are JSON objects `{"type": ..., "data": ...}`. Only the
//! kinds in [`FrameKind`] are understood; everything else, including frames
//! that are not JSON at all, is dropped without being reported.

use crate::types::{Comment, Post};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// Keep-alive frame sent by the client.
pub const PING_FRAME: &str = r#"{"type":"ping"}"#;

/// Comment pushed by the live feed; carries the post it belongs to.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FeedComment {
    #[serde(deserialize_with = "post_id")]
    pub post_id: String,
    #[serde(flatten)]
    pub comment: Comment,
}

/// A decoded live feed event.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    NewPost(Post),
    NewComment(FeedComment),
    Pong,
}

/// Frame discriminators. Adding a kind here forces the match in
/// [`FeedEvent::decode`] to handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FrameKind {
    NewPost,
    NewComment,
    Pong,
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: FrameKind,
    #[serde(default)]
    data: Value,
}

impl FeedEvent {
    /// Classify one text frame. `None` means the frame is discarded.
    pub fn decode(text: &str) -> Option<FeedEvent> {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Discarding unparseable feed frame: {}", e);
                return None;
            }
        };

        let event = match envelope.kind {
            FrameKind::NewPost => serde_json::from_value(envelope.data).map(FeedEvent::NewPost),
            FrameKind::NewComment => {
                serde_json::from_value(envelope.data).map(FeedEvent::NewComment)
            }
            FrameKind::Pong => Ok(FeedEvent::Pong),
            FrameKind::Unknown => {
                debug!("Discarding feed frame of unknown type");
                return None;
            }
        };

        match event {
            Ok(event) => Some(event),
            Err(e) => {
                debug!("Discarding {:?} frame with unexpected payload: {}", envelope.kind, e);
                None
            }
        }
    }
}

fn post_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "post_id must be a string or number, got {other}"
        ))),
    }
}
