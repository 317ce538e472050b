//! Framing: one JSON object per line (JSON Lines), `\n` terminated.

use bytes::{BufMut, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::protocol::{Message, HANDOFF_TAG, HELLO_TAG};

/// Default upper bound on one inbound line, terminator excluded.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// Encode a message as a single wire line, including the trailing `\n`.
pub fn encode_line(msg: &Message) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(msg).map_err(ProtocolError::Encode)?;
    line.push('\n');
    Ok(line)
}

/// Decode one wire line. A trailing `\n` or `\r\n` is accepted; unknown fields are ignored.
pub fn decode_line(line: &str) -> Result<Message, ProtocolError> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let line = line.strip_suffix('\r').unwrap_or(line);
    let value: Value = serde_json::from_str(line).map_err(ProtocolError::Malformed)?;
    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingTag)?;
    if tag != HELLO_TAG && tag != HANDOFF_TAG {
        return Err(ProtocolError::UnknownTag(tag.to_owned()));
    }
    serde_json::from_value(value).map_err(ProtocolError::Malformed)
}

/// A line that cannot be turned into a [`Message`] (or a message that cannot be encoded).
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed line: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("line has no \"type\" discriminator")]
    MissingTag,
    #[error("unknown message type {0:?}")]
    UnknownTag(String),
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
    #[error("line longer than {max} bytes")]
    LineTooLong { max: usize },
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Error from [`MarmotCodec`]: bad input or the underlying stream failed.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Line codec for `FramedRead` / `FramedWrite` over a byte stream.
///
/// Delegates line splitting to [`LinesCodec`] with a length cap, then runs
/// each line through [`decode_line`]. Outbound messages go through
/// [`encode_line`]; a line the peer's decoder would reject as too long is
/// refused before anything is written.
#[derive(Debug)]
pub struct MarmotCodec {
    lines: LinesCodec,
    max_line_bytes: usize,
}

impl MarmotCodec {
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_line_bytes),
            max_line_bytes,
        }
    }

    pub fn max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }
}

impl Default for MarmotCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MarmotCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        let max = self.max_line_bytes;
        match self.lines.decode(src).map_err(|e| lines_error(e, max))? {
            Some(line) => Ok(Some(decode_line(&line)?)),
            None => Ok(None),
        }
    }

    /// An unterminated final line is still decoded when the peer closes.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        let max = self.max_line_bytes;
        match self.lines.decode_eof(src).map_err(|e| lines_error(e, max))? {
            Some(line) => Ok(Some(decode_line(&line)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for MarmotCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let line = encode_line(&item)?;
        if line.len() - 1 > self.max_line_bytes {
            return Err(ProtocolError::LineTooLong {
                max: self.max_line_bytes,
            }
            .into());
        }
        dst.reserve(line.len());
        dst.put_slice(line.as_bytes());
        Ok(())
    }
}

fn lines_error(e: LinesCodecError, max: usize) -> CodecError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => ProtocolError::LineTooLong { max }.into(),
        // LinesCodec reports a non-UTF-8 line as InvalidData.
        LinesCodecError::Io(io) if io.kind() == std::io::ErrorKind::InvalidData => {
            ProtocolError::InvalidUtf8.into()
        }
        LinesCodecError::Io(io) => CodecError::Io(io),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_messages() {
        for msg in [
            Message::hello("DeviceA"),
            Message::Hello {
                name: "päd \"quoted\"\nname".into(),
                protocol_version: 7,
            },
            Message::hand_off_at("RIGHT", 1_690_000_000_123),
            Message::hand_off_at("", 0),
        ] {
            let line = encode_line(&msg).unwrap();
            assert!(line.ends_with('\n'));
            assert_eq!(line.matches('\n').count(), 1, "one line per message: {line:?}");
            assert_eq!(decode_line(&line).unwrap(), msg);
        }
    }

    #[test]
    fn wire_shape() {
        let line = encode_line(&Message::hello("DeviceA")).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "HELLO");
        assert_eq!(value["name"], "DeviceA");
        assert_eq!(value["proto"], 1);

        let line = encode_line(&Message::hand_off_at("RIGHT", 5)).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "HANDOFF");
        assert_eq!(value["edge"], "RIGHT");
        assert_eq!(value["atMs"], 5);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let msg = decode_line(r#"{"type":"HELLO","name":"b","proto":2,"color":"red"}"#).unwrap();
        assert_eq!(
            msg,
            Message::Hello {
                name: "b".into(),
                protocol_version: 2
            }
        );
    }

    #[test]
    fn missing_optional_fields_take_defaults() {
        assert_eq!(
            decode_line(r#"{"type":"HELLO","name":"b"}"#).unwrap(),
            Message::hello("b")
        );
        let before = crate::protocol::now_ms();
        match decode_line(r#"{"type":"HANDOFF","edge":"LEFT"}"#).unwrap() {
            Message::HandOff { edge, at_ms } => {
                assert_eq!(edge, "LEFT");
                assert!(at_ms >= before);
            }
            other => panic!("expected HandOff, got {other:?}"),
        }
    }

    #[test]
    fn crlf_is_accepted() {
        assert_eq!(
            decode_line("{\"type\":\"HELLO\",\"name\":\"x\"}\r\n").unwrap(),
            Message::hello("x")
        );
    }

    #[test]
    fn rejects_bad_lines() {
        assert!(matches!(decode_line("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(decode_line(""), Err(ProtocolError::Malformed(_))));
        assert!(matches!(decode_line(r#"{"name":"x"}"#), Err(ProtocolError::MissingTag)));
        assert!(matches!(decode_line("[1,2]"), Err(ProtocolError::MissingTag)));
        assert!(matches!(
            decode_line(r#"{"type":"GOODBYE"}"#),
            Err(ProtocolError::UnknownTag(t)) if t == "GOODBYE"
        ));
        assert!(matches!(
            decode_line(r#"{"type":"HELLO"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_line(r#"{"type":"HANDOFF","edge":3}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn codec_splits_partial_and_multiple_lines() {
        let mut codec = MarmotCodec::new();
        let a = encode_line(&Message::hello("a")).unwrap();
        let b = encode_line(&Message::hand_off_at("RIGHT", 9)).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(a[..4].as_bytes());
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(a[4..].as_bytes());
        buf.extend_from_slice(b.as_bytes());

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::hello("a")));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::hand_off_at("RIGHT", 9))
        );
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn codec_decodes_unterminated_tail_at_eof() {
        let mut codec = MarmotCodec::new();
        let mut buf = BytesMut::from(r#"{"type":"HELLO","name":"tail"}"#);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(Message::hello("tail")));
    }

    #[test]
    fn codec_caps_line_length() {
        let mut codec = MarmotCodec::with_max_line_bytes(16);
        let mut buf = BytesMut::from(&b"{\"type\":\"HELLO\",\"name\":\"far too long\"}\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::Protocol(ProtocolError::LineTooLong { max: 16 }))
        ));
    }

    #[test]
    fn codec_rejects_invalid_utf8() {
        let mut codec = MarmotCodec::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"HELLO\",\"name\":\"\xff\xfe\"}\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::Protocol(ProtocolError::InvalidUtf8))
        ));
    }

    #[test]
    fn codec_refuses_to_encode_overlong_line() {
        let mut codec = MarmotCodec::with_max_line_bytes(64);
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(Message::hand_off_at("X".repeat(500), 1), &mut buf),
            Err(CodecError::Protocol(ProtocolError::LineTooLong { max: 64 }))
        ));
        assert!(buf.is_empty());

        // Exactly at the cap still goes out and decodes on the other side.
        let fits = encode_line(&Message::hello("a")).unwrap();
        let mut codec = MarmotCodec::with_max_line_bytes(fits.len() - 1);
        codec.encode(Message::hello("a"), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::hello("a")));
    }

    #[test]
    fn codec_surfaces_protocol_errors() {
        let mut codec = MarmotCodec::new();
        let mut buf = BytesMut::from(&b"garbage\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::Protocol(ProtocolError::Malformed(_)))
        ));
    }

    #[test]
    fn codec_encodes_one_line() {
        let mut codec = MarmotCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Message::hello("a"), &mut buf).unwrap();
        codec.encode(Message::hand_off_at("LEFT", 1), &mut buf).unwrap();
        let text = std::str::from_utf8(&buf).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(decode_line(lines[0]).unwrap(), Message::hello("a"));
        assert_eq!(decode_line(lines[1]).unwrap(), Message::hand_off_at("LEFT", 1));
    }
}
