//! Wire framing for the telehub UDP protocol.
//!
//! A frame is `<id>#<body>*<checksum>`, where `id` is the channel id (or,
//! on first login, the device id) rendered as hex text, `body` is either an
//! event frame (`EV=...,...`) or a data frame (`<pid>:<value>,...`), and
//! `checksum` is the sum of the byte codepoints preceding the final `*`,
//! mod 256, rendered as uppercase hex with no zero-padding.

use std::fmt;

/// Event identifiers carried in the `EV` field of an event frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventId {
    Login = 1,
    Logout = 2,
    Sync = 3,
    Reconnect = 4,
    Command = 5,
    Ack = 6,
    Ping = 7,
}

impl EventId {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::Login,
            2 => Self::Logout,
            3 => Self::Sync,
            4 => Self::Reconnect,
            5 => Self::Command,
            6 => Self::Ack,
            7 => Self::Ping,
            _ => return None,
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

/// Errors the decoder can return. Every variant is a reason to drop the
/// frame silently; none of them carry enough information to justify a
/// reply (there is no channel identity to reply to, or the identity is
/// untrustworthy).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame has no checksum separator")]
    MissingChecksum,
    #[error("checksum does not match")]
    ChecksumMismatch,
    #[error("frame has no id separator")]
    MissingIdSeparator,
    #[error("event frame has no EV field")]
    MissingEvent,
    #[error("unknown event id {0}")]
    UnknownEvent(u32),
    #[error("frame id is empty")]
    EmptyId,
}

/// A decoded event frame: the event id plus every other recognized field,
/// keyed by its raw uppercase field name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFrame {
    pub event: EventId,
    pub fields: Vec<(String, String)>,
}

impl EventFrame {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A decoded data frame: the raw, in-order list of `pid:value` pairs,
/// plus the byte length of the body text they were parsed from.
/// PID `0` is a reserved in-band timestamp marker; the codec has no
/// opinion on it and hands it through unchanged for the caller to
/// interpret (see `telehub-service`'s payload processor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub pairs: Vec<(u32, String)>,
    pub raw_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Event(EventFrame),
    Data(DataFrame),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: String,
    pub body: Body,
}

/// Sum of byte codepoints mod 256, as the wire checksum.
///
/// # Example
///
/// ```
/// use telehub_codec::checksum;
///
/// assert_eq!(checksum(b"ABCD1234#EV=1"), checksum(b"ABCD1234#EV=1"));
/// assert!(checksum(b"") == 0);
/// ```
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Decode a complete wire frame.
///
/// # Example
///
/// ```
/// use telehub_codec::{decode_frame, Body, EventId};
///
/// let raw = "ABCD1234#EV=1,TS=1000,VIN=11111111111111111,SSI=-70";
/// let sum = telehub_codec::checksum(raw.as_bytes());
/// let wire = format!("{}*{:X}", raw, sum);
///
/// let frame = decode_frame(&wire).unwrap();
/// assert_eq!(frame.id, "ABCD1234");
/// match frame.body {
///     Body::Event(ev) => {
///         assert_eq!(ev.event, EventId::Login);
///         assert_eq!(ev.field("VIN"), Some("11111111111111111"));
///     }
///     Body::Data(_) => panic!("expected event frame"),
/// }
/// ```
pub fn decode_frame(raw: &str) -> Result<Frame, FrameError> {
    let star = raw.rfind('*').ok_or(FrameError::MissingChecksum)?;
    let (payload, cs_text) = (&raw[..star], &raw[star + 1..]);
    let expected = u8::from_str_radix(cs_text.trim(), 16).map_err(|_| FrameError::ChecksumMismatch)?;
    if checksum(payload.as_bytes()) != expected {
        return Err(FrameError::ChecksumMismatch);
    }

    let hash = payload.find('#').ok_or(FrameError::MissingIdSeparator)?;
    let (id, body) = (&payload[..hash], &payload[hash + 1..]);
    if id.is_empty() {
        return Err(FrameError::EmptyId);
    }

    let body = if looks_like_event(body) {
        Body::Event(parse_event_body(body)?)
    } else {
        Body::Data(parse_data_body(body))
    };

    Ok(Frame { id: id.to_string(), body })
}

fn looks_like_event(body: &str) -> bool {
    body.split(',').any(|pair| pair.trim_start().starts_with("EV="))
}

fn parse_event_body(body: &str) -> Result<EventFrame, FrameError> {
    let mut fields = Vec::new();
    let mut event = None;

    for pair in body.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some(eq) = pair.find('=') else { continue };
        let (key, value) = (&pair[..eq], &pair[eq + 1..]);
        if key == "EV" {
            let v: u32 = value.parse().map_err(|_| FrameError::MissingEvent)?;
            event = Some(EventId::from_u32(v).ok_or(FrameError::UnknownEvent(v))?);
        } else {
            fields.push((key.to_string(), value.to_string()));
        }
    }

    Ok(EventFrame {
        event: event.ok_or(FrameError::MissingEvent)?,
        fields,
    })
}

fn parse_data_body(body: &str) -> DataFrame {
    let mut pairs = Vec::new();
    for pair in body.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some(colon) = pair.find(':') else { continue };
        let (pid, value) = (&pair[..colon], &pair[colon + 1..]);
        let Ok(pid) = u32::from_str_radix(pid, 16) else { continue };
        pairs.push((pid, value.to_string()));
    }
    DataFrame { pairs, raw_len: body.len() }
}

/// Encode a reply frame: `<id>#EV=<event>,RX=<rx>,TX=<tx>*<checksum>`.
///
/// # Example
///
/// ```
/// use telehub_codec::{encode_reply, EventId, decode_frame, Body};
///
/// let wire = encode_reply("ABCD1234", EventId::Login, 0, 1);
/// let frame = decode_frame(&wire).unwrap();
/// assert_eq!(frame.id, "ABCD1234");
/// assert!(matches!(frame.body, Body::Event(ev) if ev.event == EventId::Login));
/// ```
pub fn encode_reply(id: &str, event: EventId, rx: u64, tx: u64) -> String {
    let payload = format!("{id}#EV={},RX={rx},TX={tx}", event.as_u32());
    format!("{payload}*{:X}", checksum(payload.as_bytes()))
}

/// Encode an outgoing command frame: `<id>#EV=5,TK=<token>,CMD=<cmd>*<checksum>`.
///
/// # Example
///
/// ```
/// use telehub_codec::{encode_command, decode_frame, Body};
///
/// let wire = encode_command("ABCD1234", 1, "REBOOT");
/// let frame = decode_frame(&wire).unwrap();
/// match frame.body {
///     Body::Event(ev) => {
///         assert_eq!(ev.field("TK"), Some("1"));
///         assert_eq!(ev.field("CMD"), Some("REBOOT"));
///     }
///     Body::Data(_) => panic!("expected event frame"),
/// }
/// ```
pub fn encode_command(id: &str, token: u64, cmd: &str) -> String {
    let payload = format!("{id}#EV=5,TK={token},CMD={cmd}");
    format!("{payload}*{:X}", checksum(payload.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_checksum() {
        assert_eq!(decode_frame("ABCD#EV=1"), Err(FrameError::MissingChecksum));
    }

    #[test]
    fn rejects_bad_checksum() {
        assert_eq!(decode_frame("ABCD#EV=1*00"), Err(FrameError::ChecksumMismatch));
    }

    #[test]
    fn accepts_one_or_two_digit_checksum() {
        let payload = "1#EV=1";
        let cs = checksum(payload.as_bytes());
        let short = format!("{payload}*{:X}", cs);
        let long = format!("{payload}*{:02X}", cs);
        assert!(decode_frame(&short).is_ok());
        assert!(decode_frame(&long).is_ok());
    }

    #[test]
    fn rejects_unknown_event() {
        let payload = "1#EV=99";
        let wire = format!("{payload}*{:X}", checksum(payload.as_bytes()));
        assert_eq!(decode_frame(&wire), Err(FrameError::UnknownEvent(99)));
    }

    #[test]
    fn data_frame_skips_malformed_pairs() {
        let raw = "0:5000,garbage,104:37,zz:1";
        let body = parse_data_body(raw);
        assert_eq!(body.pairs, vec![(0, "5000".to_string()), (104, "37".to_string())]);
        assert_eq!(body.raw_len, raw.len());
    }

    #[test]
    fn roundtrip_reply() {
        let wire = encode_reply("ABCD", EventId::Sync, 10, 11);
        let frame = decode_frame(&wire).unwrap();
        assert_eq!(frame.id, "ABCD");
        match frame.body {
            Body::Event(ev) => {
                assert_eq!(ev.event, EventId::Sync);
                assert_eq!(ev.field("RX"), Some("10"));
                assert_eq!(ev.field("TX"), Some("11"));
            }
            Body::Data(_) => panic!("expected event"),
        }
    }
}
