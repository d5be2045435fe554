//! Inline harness marker recognition.
//!
//! The producer embeds synchronization markers in its stdout/stderr:
//!
//! ```text
//! T2-HARNESS-ESYNC: <pid><SEP><tid><SEP><stream_id>
//! T2-HARNESS-EVENT: <json-object>
//! ```
//!
//! A marker may sit mid-line: leading text is real output for the current
//! line, trailing text belongs to the next logical line. The EVENT payload
//! is parsed with a streaming deserializer so the trailing residue after
//! the JSON object survives byte-exact.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::error::StreamError;

fn marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"T2-HARNESS-([A-Z_]+): ").unwrap())
}

/// A synchronization point naming the next structured event on a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Barrier {
    pub pid: String,
    pub tid: String,
    pub stream_id: u64,
}

impl Barrier {
    /// Parse an ESYNC payload token, `<pid><SEP><tid><SEP><stream_id>`.
    fn parse(token: &str, sep: &str) -> Result<Self, StreamError> {
        let malformed = || StreamError::MarkerPayload {
            kind: "ESYNC",
            payload: token.to_string(),
        };
        let mut parts = token.split(sep);
        let pid = parts.next().filter(|p| !p.is_empty()).ok_or_else(malformed)?;
        let tid = parts.next().filter(|t| !t.is_empty()).ok_or_else(malformed)?;
        let stream_id = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(malformed)?;
        if parts.next().is_some() {
            return Err(malformed());
        }
        Ok(Self {
            pid: pid.to_string(),
            tid: tid.to_string(),
            stream_id,
        })
    }

    /// Extract the routing triple from an inline EVENT payload.
    fn from_event(payload: &Value, raw: &str) -> Result<Self, StreamError> {
        let malformed = || StreamError::MarkerPayload {
            kind: "EVENT",
            payload: raw.to_string(),
        };
        let pid = routing_string(payload, "pid").ok_or_else(malformed)?;
        let tid = routing_string(payload, "tid").ok_or_else(malformed)?;
        let stream_id = routing_u64(payload, "stream_id").ok_or_else(malformed)?;
        Ok(Self {
            pid,
            tid,
            stream_id,
        })
    }
}

/// A marker found inside one output line, with its residues split off.
#[derive(Debug)]
pub struct MarkerHit {
    /// Text before the marker — real output for the current line.
    pub before: String,
    pub barrier: Barrier,
    /// The inline event payload, present for EVENT markers.
    pub event: Option<Value>,
    /// Text after the payload — belongs to the next logical line.
    pub after: String,
}

/// Recognize a harness marker inside `line`.
///
/// Returns `None` for plain output. Fatal on a marker whose type or
/// payload cannot be understood: that stream is corrupt.
pub fn scan_line(line: &str, sep: &str) -> Result<Option<MarkerHit>, StreamError> {
    let Some(caps) = marker_re().captures(line) else {
        return Ok(None);
    };
    let (Some(whole), Some(kind)) = (caps.get(0), caps.get(1)) else {
        return Ok(None);
    };
    let before = line[..whole.start()].to_string();
    let rest = &line[whole.end()..];

    match kind.as_str() {
        "ESYNC" => {
            let (token, after) = match rest.split_once(' ') {
                Some((token, after)) => (token, after),
                None => (rest, ""),
            };
            let barrier = Barrier::parse(token, sep)?;
            Ok(Some(MarkerHit {
                before,
                barrier,
                event: None,
                after: after.to_string(),
            }))
        }
        "EVENT" => {
            let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<Value>();
            let payload = match stream.next() {
                Some(Ok(value @ Value::Object(_))) => value,
                _ => {
                    return Err(StreamError::MarkerPayload {
                        kind: "EVENT",
                        payload: rest.to_string(),
                    });
                }
            };
            let tail = &rest[stream.byte_offset()..];
            let after = tail.strip_prefix(' ').unwrap_or(tail).to_string();
            let barrier = Barrier::from_event(&payload, rest)?;
            Ok(Some(MarkerHit {
                before,
                barrier,
                event: Some(payload),
                after,
            }))
        }
        other => Err(StreamError::UnknownMarker(other.to_string())),
    }
}

/// Routing fields arrive as JSON numbers or strings depending on the
/// producer; normalize to a string key.
pub(crate) fn routing_string(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn routing_u64(value: &Value, key: &str) -> Option<u64> {
    match value.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
