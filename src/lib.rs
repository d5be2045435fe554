//! Tail a test-harness job output directory into one ordered event stream.
//!
//! A harness runs many test scripts in parallel; each running script spills
//! its observable state into a per-job directory as tail-appended files:
//!
//! ```text
//! <job_root>/
//!   start      "<stamp>\n"                      wall-clock start
//!   exit       "<exit_code> <stamp>\n"          written on exit
//!   file       "<test_script_path>\n"
//!   stdout     free-form text + inline markers
//!   stderr     free-form text + inline markers
//!   events/
//!     events-<pid><SEP><tid>.jsonl              one shard per producer thread
//! ```
//!
//! [`JobDirStreamer`] consumes one such directory while the job is still
//! running and merges the three independent streams (stdout, stderr, and
//! the structured event shards) into a single ordered sequence of
//! [`HarnessEvent`]s: no duplicates, no skips, free-form text
//! deterministically interleaved with structured events via the inline
//! `T2-HARNESS-ESYNC` barrier protocol, and a synthesized start/exit pair
//! bracketing everything even when the producer dies without flushing.
//!
//! The streamer is single-threaded and cooperative. [`JobDirStreamer::poll`]
//! never blocks; an empty batch means no progress was possible and the
//! caller should poll again once the producer has written more. One job is
//! one instance — an outer scheduler multiplexes many.

mod comment;
mod error;
mod event;
mod events;
mod files;
mod marker;
mod poller;
mod streamer;
mod tail;

pub use error::StreamError;
pub use event::{HarnessEvent, IdSource, default_id_source};
pub use marker::Barrier;
pub use poller::{LineParser, StreamTag};
pub use streamer::{DEFAULT_SEPARATOR, JobDirStreamer, StreamerOptions};
