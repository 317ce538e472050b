//! Marmot wire protocol: message types and version.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current protocol version. Announced in `Hello`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Wire tag of [`Message::Hello`].
pub const HELLO_TAG: &str = "HELLO";
/// Wire tag of [`Message::HandOff`].
pub const HANDOFF_TAG: &str = "HANDOFF";

/// All wire message types. Encoding is one JSON object per line, discriminated
/// by its `type` field (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Identity announcement, sent right after the link comes up.
    #[serde(rename = "HELLO")]
    Hello {
        name: String,
        #[serde(rename = "proto", default = "default_protocol_version")]
        protocol_version: u32,
    },
    /// Control of the shared artifact crossed `edge` at `at_ms` (Unix millis).
    #[serde(rename = "HANDOFF")]
    HandOff {
        edge: String,
        #[serde(rename = "atMs", default = "now_ms")]
        at_ms: i64,
    },
}

impl Message {
    /// `Hello` carrying the current protocol version.
    pub fn hello(name: impl Into<String>) -> Self {
        Message::Hello {
            name: name.into(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// `HandOff` stamped with the current time.
    pub fn hand_off(edge: impl Into<String>) -> Self {
        Self::hand_off_at(edge, now_ms())
    }

    pub fn hand_off_at(edge: impl Into<String>, at_ms: i64) -> Self {
        Message::HandOff {
            edge: edge.into(),
            at_ms,
        }
    }

    /// Wire tag of this variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => HELLO_TAG,
            Message::HandOff { .. } => HANDOFF_TAG,
        }
    }
}

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

/// Milliseconds since the Unix epoch. A clock set before 1970 reads as 0.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_defaults_to_current_version() {
        let msg = Message::hello("DeviceA");
        assert_eq!(
            msg,
            Message::Hello {
                name: "DeviceA".into(),
                protocol_version: 1,
            }
        );
        assert_eq!(msg.kind(), "HELLO");
    }

    #[test]
    fn hand_off_stamps_now() {
        let before = now_ms();
        let msg = Message::hand_off("RIGHT");
        let after = now_ms();
        match msg {
            Message::HandOff { edge, at_ms } => {
                assert_eq!(edge, "RIGHT");
                assert!(at_ms >= before && at_ms <= after);
            }
            other => panic!("expected HandOff, got {other:?}"),
        }
    }

    #[test]
    fn equality_is_structural() {
        assert_eq!(
            Message::hand_off_at("LEFT", 42),
            Message::hand_off_at("LEFT", 42)
        );
        assert_ne!(
            Message::hand_off_at("LEFT", 42),
            Message::hand_off_at("RIGHT", 42)
        );
    }
}
