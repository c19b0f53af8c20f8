//! Wire protocol frames for the push stream.
//!
//! Each frame is one UTF-8 line holding a JSON object. The outer [`Message`]
//! carries the frame type and sequence position; `data`/`broadcast` frames
//! additionally carry a JSON-encoded [`Content`] payload which is decoded
//! lazily by the dispatcher.

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Frame type discriminator.
///
/// The server emits lowercase type tags; numeric tags signal protocol-level
/// conditions (`401` expired token, `429` subscriber limit). Anything else
/// maps to [`MessageType::Unknown`] and is routed to the error callback.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Payload-carrying message addressed to this channel.
    Data,
    /// Payload-carrying message fanned out to all channel subscribers.
    Broadcast,
    /// Heartbeat, no payload.
    Noop,
    /// Initial-sync marker sent on first connect.
    NextSeq,
    /// Token expired or invalid.
    Unauthorized,
    /// Channel subscriber limit exceeded.
    ChannelOverflow,
    /// Any type tag this client does not recognize.
    Unknown,
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "data" => Self::Data,
            "broadcast" => Self::Broadcast,
            "noop" => Self::Noop,
            "next_seq" => Self::NextSeq,
            "401" => Self::Unauthorized,
            "429" => Self::ChannelOverflow,
            _ => Self::Unknown,
        }
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Data => "data",
            MessageType::Broadcast => "broadcast",
            MessageType::Noop => "noop",
            MessageType::NextSeq => "next_seq",
            MessageType::Unauthorized => "401",
            MessageType::ChannelOverflow => "429",
            MessageType::Unknown => "unknown",
        }
        .to_string()
    }
}

/// One decoded frame.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Frame type.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Channel the frame belongs to. Heartbeats may omit it.
    #[serde(default)]
    pub cname: String,
    /// Sequence position, in the string form the server emits.
    #[serde(default)]
    pub seq: String,
    /// JSON-encoded payload, present for `data`/`broadcast` frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl Message {
    /// Decodes one stream line into a frame.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Encodes the frame back to its wire line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Decoded payload of a `data`/`broadcast` frame.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Content {
    /// Application-defined payload type.
    #[serde(rename = "type")]
    pub kind: i32,
    /// Application-defined message id.
    #[serde(default)]
    pub id: String,
    /// Structured payload body.
    #[serde(default)]
    pub body: serde_json::Value,
}

impl Content {
    /// Decodes the inner payload of a frame.
    pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

/// Accumulates transport chunks and yields complete text lines.
///
/// The transport delivers the response body in arbitrary chunks; frames are
/// newline-delimited. `\r\n` endings are normalized and lines that are not
/// valid UTF-8 are skipped.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
        }
    }

    /// Appends one transport chunk.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pops the next complete line, without its terminator.
    ///
    /// Returns `None` when no full line is buffered yet. An empty line is
    /// returned as `Some("")`; the caller decides what stream termination
    /// means.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let newline = self.buf.iter().position(|&b| b == b'\n')?;
            let mut line = self.buf.split_to(newline + 1);
            line.truncate(line.len() - 1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            match std::str::from_utf8(&line) {
                Ok(text) => return Some(text.to_string()),
                Err(_) => {
                    warn!(event = "invalid_utf8_line", len = line.len());
                    continue;
                }
            }
        }
    }
}
