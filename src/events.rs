//! Out-of-band structured event routing.
//!
//! Each producer thread ships its structured events as one JSONL shard
//! under `events/`, named `events-<pid><SEP><tid>.jsonl`. Shards are
//! tail-read into per-`(pid, tid)` queues; JSON decoding waits until an
//! event is actually released. The directory is rescanned on every fill so
//! shards appearing mid-run are picked up, and inline `T2-HARNESS-EVENT`
//! payloads land in the same queues.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::PathBuf;

use serde_json::Value;
use tracing::warn;

use crate::error::StreamError;
use crate::files::StreamFile;

/// Shard identity: `(pid, tid)`, one producer thread.
pub type ShardKey = (String, String);

/// A structured event awaiting release. JSONL lines stay raw until then.
#[derive(Debug, Clone, PartialEq)]
pub enum QueuedEvent {
    Raw(String),
    Parsed(Value),
}

impl QueuedEvent {
    /// Decode into the event record. Fatal when the shard line is not a
    /// JSON object — that shard is corrupt.
    pub fn decode(self, key: &ShardKey) -> Result<Value, StreamError> {
        match self {
            Self::Parsed(value) => Ok(value),
            Self::Raw(line) => {
                let map: serde_json::Map<String, Value> =
                    serde_json::from_str(&line).map_err(|source| StreamError::EventDecode {
                        pid: key.0.clone(),
                        tid: key.1.clone(),
                        source,
                    })?;
                Ok(Value::Object(map))
            }
        }
    }
}

#[derive(Default)]
struct Shard {
    /// Absent for shards that only ever saw inline events.
    file: Option<StreamFile>,
    queue: VecDeque<QueuedEvent>,
}

/// All shard queues for one job.
pub struct EventsBuffer {
    dir: PathBuf,
    sep: String,
    shards: BTreeMap<ShardKey, Shard>,
    ignored: HashSet<String>,
}

impl EventsBuffer {
    pub fn new(dir: PathBuf, sep: String) -> Self {
        Self {
            dir,
            sep,
            shards: BTreeMap::new(),
            ignored: HashSet::new(),
        }
    }

    /// Rescan the events directory and tail every known shard.
    ///
    /// `max` caps how many new records each shard contributes per fill;
    /// zero means unbounded. A directory that does not exist yet is fine;
    /// one that exists but cannot be read is fatal for this poll.
    pub fn fill(&mut self, max: usize, producer_done: bool) -> Result<(), StreamError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(StreamError::EventsDir {
                    path: self.dir.clone(),
                    source,
                });
            }
        };
        for entry in entries {
            let entry = entry.map_err(|source| StreamError::EventsDir {
                path: self.dir.clone(),
                source,
            })?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(key) = parse_shard_name(&name, &self.sep) else {
                if self.ignored.insert(name.to_string()) {
                    warn!(file = %name, "ignoring unrecognized file in events directory");
                }
                continue;
            };
            let shard = self.shards.entry(key).or_default();
            if shard.file.is_none() {
                shard.file = Some(StreamFile::new(entry.path()));
            }
        }
        for shard in self.shards.values_mut() {
            let Some(file) = shard.file.as_mut() else {
                continue;
            };
            let mut added = 0usize;
            while max == 0 || added < max {
                let Some(line) = file.read_line(producer_done)? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                shard
                    .queue
                    .push_back(QueuedEvent::Raw(line.trim_end().to_string()));
                added += 1;
            }
        }
        Ok(())
    }

    /// Queue an inline EVENT payload behind whatever the shard already has.
    pub fn enqueue_inline(&mut self, key: ShardKey, event: Value) {
        self.shards
            .entry(key)
            .or_default()
            .queue
            .push_back(QueuedEvent::Parsed(event));
    }

    pub fn pop_event(&mut self, key: &ShardKey) -> Option<QueuedEvent> {
        self.shards.get_mut(key)?.queue.pop_front()
    }

    pub fn has_pending(&self) -> bool {
        self.shards.values().any(|shard| !shard.queue.is_empty())
    }

    /// Hand back everything still queued, in shard-key order, leaving the
    /// queues empty. Used by the terminal flush.
    pub fn take_all(&mut self) -> Vec<(ShardKey, VecDeque<QueuedEvent>)> {
        self.shards
            .iter_mut()
            .filter(|(_, shard)| !shard.queue.is_empty())
            .map(|(key, shard)| (key.clone(), std::mem::take(&mut shard.queue)))
            .collect()
    }
}

fn parse_shard_name(name: &str, sep: &str) -> Option<ShardKey> {
    let rest = name.strip_prefix("events-")?.strip_suffix(".jsonl")?;
    let (pid, tid) = rest.split_once(sep)?;
    if pid.is_empty() || tid.is_empty() {
        return None;
    }
    Some((pid.to_string(), tid.to_string()))
}
