//! PeerChat message types: the chat record published to a room and local log events.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

/// Prefix joined with the room name to form the pub/sub topic name.
pub const TOPIC_PREFIX: &str = "room-peerchat-";

/// Display name used when a session is joined without one.
pub const DEFAULT_USER: &str = "default_user";

/// Room used when a session is joined without a room name.
pub const DEFAULT_ROOM: &str = "default_room";

/// Topic name for a room. Nodes using the same room name meet on the same topic.
pub fn topic_name(room_name: &str) -> String {
    format!("{}{}", TOPIC_PREFIX, room_name)
}

/// A chat message as published to a room. Encoding is JSON (see wire module).
/// `sender_id` is always the author's own node ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatMessage {
    #[serde(rename = "message")]
    pub message: String,
    #[serde(rename = "senderid")]
    pub sender_id: NodeId,
    #[serde(rename = "sendername")]
    pub sender_name: String,
}

/// Category of a local log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTag {
    /// Publish side: encode or publish failed.
    PubErr,
    /// Receive side: decode failed, bad sender, or subscription closed.
    SubErr,
    /// Informational (room changes, renames).
    Info,
}

impl LogTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogTag::PubErr => "puberr",
            LogTag::SubErr => "suberr",
            LogTag::Info => "info",
        }
    }
}

/// Local diagnostic emitted by a room session. Never transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub tag: LogTag,
    pub text: String,
}

impl LogEvent {
    pub fn new(tag: LogTag, text: impl Into<String>) -> Self {
        Self {
            tag,
            text: text.into(),
        }
    }

    pub fn puberr(text: impl Into<String>) -> Self {
        Self::new(LogTag::PubErr, text)
    }

    pub fn suberr(text: impl Into<String>) -> Self {
        Self::new(LogTag::SubErr, text)
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::new(LogTag::Info, text)
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.tag.as_str(), self.text)
    }
}
