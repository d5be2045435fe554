//! Streaming error taxonomy.
//!
//! Fatal conditions surface as `StreamError` so the outer harness can mark
//! the job corrupt instead of silently mis-reporting. Transient conditions
//! (files that do not exist yet, truncated trailing lines) are not errors —
//! the streamer simply makes no progress and the caller polls again.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    /// A required identity field was empty at construction.
    #[error("job identity field `{0}` must be non-empty")]
    EmptyIdentity(&'static str),

    /// A released event's stream_id does not match its ESYNC barrier.
    ///
    /// The per-shard sequence is dense, so a mismatch means an event was
    /// lost or reordered. Unrecoverable.
    #[error(
        "event stream out of order for pid={pid} tid={tid}: \
         barrier expects stream_id {barrier}, queue holds {queued}"
    )]
    OrderingViolation {
        pid: String,
        tid: String,
        barrier: u64,
        queued: u64,
    },

    /// A harness marker matched but its type is not ESYNC or EVENT.
    #[error("unrecognized harness marker `T2-HARNESS-{0}`")]
    UnknownMarker(String),

    /// An ESYNC or EVENT marker payload that cannot be parsed.
    #[error("malformed {kind} marker payload: {payload:?}")]
    MarkerPayload { kind: &'static str, payload: String },

    /// A queued shard record that is not a JSON object.
    #[error("undecodable event record for pid={pid} tid={tid}")]
    EventDecode {
        pid: String,
        tid: String,
        #[source]
        source: serde_json::Error,
    },

    /// The events directory exists but cannot be read.
    #[error("failed to read events directory {}", .path.display())]
    EventsDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Unexpected filesystem failure on one of the job files.
    #[error(transparent)]
    Io(#[from] io::Error),
}
