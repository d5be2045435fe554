//! Job directory streaming — lifecycle gate, synchronizer, and poll API.
//!
//! One `JobDirStreamer` owns one job output directory and merges its five
//! files plus the `events/` shards into a single ordered event stream:
//!
//! ```text
//! pre-start → `start` file missing          → poll returns nothing
//! running   → start stamp read              → start event, then stream output
//! finishing → `exit` read (or runner dead)  → drain, terminal flush, exit event
//! done      → exit event delivered          → poll returns nothing, forever
//! ```
//!
//! A structured event is released only once both stdout and stderr have
//! reached its ESYNC barrier; the seen-set keeps the second stream from
//! releasing the same event twice. Free-form text stays on its side of
//! each barrier, which is the whole point of the bottleneck.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::StreamError;
use crate::event::{HarnessEvent, IdSource, default_id_source, ensure_event_id};
use crate::events::EventsBuffer;
use crate::files::{EVENTS_DIR, JobFile, StreamFile, ValueFile};
use crate::marker;
use crate::poller::{LineParser, StreamBuffer, StreamTag};

/// Default harness IPC separator, used in shard filenames and ESYNC
/// payloads.
pub const DEFAULT_SEPARATOR: &str = "~";

/// Construction parameters. Identity is required; everything else has a
/// working default.
pub struct StreamerOptions {
    pub run_id: String,
    pub job_id: String,
    pub job_root: PathBuf,
    /// The harness IPC separator.
    pub separator: String,
    /// TAP parser for stdout lines; `None` leaves every line as plain text.
    pub stdout_parser: Option<LineParser>,
    /// TAP parser for stderr lines.
    pub stderr_parser: Option<LineParser>,
    /// Event id source; swap in a deterministic one for tests.
    pub ids: IdSource,
}

impl StreamerOptions {
    pub fn new(
        run_id: impl Into<String>,
        job_id: impl Into<String>,
        job_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            job_id: job_id.into(),
            job_root: job_root.into(),
            separator: DEFAULT_SEPARATOR.to_string(),
            stdout_parser: None,
            stderr_parser: None,
            ids: default_id_source(),
        }
    }
}

/// Lifecycle of one job directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    /// `start` has not appeared; nothing may be emitted.
    PreStart,
    /// Start stamp read; stream and event output flows.
    Running,
    /// Exit observed (or the runner died); draining remainders.
    Finishing,
    /// Exit event delivered; the stream is over.
    Done,
}

/// Streams one job output directory as ordered harness events.
///
/// Single-threaded and cooperative: `poll` never blocks, returns an empty
/// batch when no progress is possible, and the caller schedules the next
/// call. Dropping the instance releases all file handles.
pub struct JobDirStreamer {
    run_id: String,
    job_id: String,
    job_root: PathBuf,
    sep: String,
    ids: IdSource,

    start_file: ValueFile,
    exit_file: ValueFile,
    script_file: ValueFile,
    stdout_file: StreamFile,
    stderr_file: StreamFile,

    stdout: StreamBuffer,
    stderr: StreamBuffer,
    events: EventsBuffer,

    /// Released structured events, keyed `(tid, pid, stream_id)`.
    seen: HashSet<(String, String, u64)>,
    /// Fully resolved events awaiting return from `poll`.
    ready: VecDeque<HarnessEvent>,
    last_stamp: Option<f64>,

    gate: Gate,
    start_stamp: Option<f64>,
    exit_value: Option<String>,
    runner_exited: bool,
    start_queued: bool,
    exit_queued: bool,
}

impl std::fmt::Debug for JobDirStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDirStreamer")
            .field("run_id", &self.run_id)
            .field("job_id", &self.job_id)
            .field("job_root", &self.job_root)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl JobDirStreamer {
    pub fn new(options: StreamerOptions) -> Result<Self, StreamError> {
        let StreamerOptions {
            run_id,
            job_id,
            job_root,
            separator,
            stdout_parser,
            stderr_parser,
            ids,
        } = options;
        if run_id.is_empty() {
            return Err(StreamError::EmptyIdentity("run_id"));
        }
        if job_id.is_empty() {
            return Err(StreamError::EmptyIdentity("job_id"));
        }
        if job_root.as_os_str().is_empty() {
            return Err(StreamError::EmptyIdentity("job_root"));
        }
        Ok(Self {
            start_file: ValueFile::new(JobFile::Start.path(&job_root)),
            exit_file: ValueFile::new(JobFile::Exit.path(&job_root)),
            script_file: ValueFile::new(JobFile::File.path(&job_root)),
            stdout_file: StreamFile::new(JobFile::Stdout.path(&job_root)),
            stderr_file: StreamFile::new(JobFile::Stderr.path(&job_root)),
            stdout: StreamBuffer::new(StreamTag::Stdout, stdout_parser),
            stderr: StreamBuffer::new(StreamTag::Stderr, stderr_parser),
            events: EventsBuffer::new(job_root.join(EVENTS_DIR), separator.clone()),
            sep: separator,
            seen: HashSet::new(),
            ready: VecDeque::new(),
            last_stamp: None,
            gate: Gate::PreStart,
            start_stamp: None,
            exit_value: None,
            runner_exited: false,
            start_queued: false,
            exit_queued: false,
            run_id,
            job_id,
            job_root,
            ids,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn job_root(&self) -> &Path {
        &self.job_root
    }

    /// Tell the streamer the outer runner died. If the producer never
    /// wrote `exit`, a synthetic exit with code -1 is emitted once the
    /// remaining output drains.
    pub fn set_runner_exited(&mut self, exited: bool) {
        self.runner_exited = exited;
    }

    /// The exit event has been delivered; no further output will come.
    pub fn is_done(&self) -> bool {
        matches!(self.gate, Gate::Done)
    }

    /// Collect the next batch of events. `max` caps both the new items
    /// buffered per source this pass and the number of events returned;
    /// zero means unbounded. Never blocks — an empty batch means no
    /// progress was possible, poll again later.
    pub fn poll(&mut self, max: usize) -> Result<Vec<HarnessEvent>, StreamError> {
        if matches!(self.gate, Gate::Done) {
            return Ok(Vec::new());
        }
        if !self.exit_queued {
            self.fill_buffers(max)?;
        }
        if matches!(self.gate, Gate::PreStart) {
            return Ok(Vec::new());
        }
        if !self.start_queued {
            let event = self.start_event()?;
            self.ready.push_back(event);
            self.start_queued = true;
        }
        if !self.exit_queued {
            let mut stalled = self.poll_streams(max)?;
            if stalled && matches!(self.gate, Gate::Running) && self.observe_exit()? {
                // The race-proof fill may have brought in final data.
                stalled = self.poll_streams(max)?;
            }
            if matches!(self.gate, Gate::Finishing) && stalled {
                self.terminal_flush()?;
                let event = self.exit_event();
                self.ready.push_back(event);
                self.exit_queued = true;
            }
        }
        let mut out = Vec::new();
        while max == 0 || out.len() < max {
            let Some(event) = self.ready.pop_front() else {
                break;
            };
            out.push(event);
        }
        if self.exit_queued && self.ready.is_empty() {
            self.gate = Gate::Done;
        }
        Ok(out)
    }

    // ── Filling ──

    fn fill_buffers(&mut self, max: usize) -> Result<(), StreamError> {
        if matches!(self.gate, Gate::PreStart) {
            let Some(line) = self.start_file.read_line()? else {
                return Ok(());
            };
            let stamp = line.trim().parse::<f64>().ok();
            if stamp.is_none() {
                warn!(job_id = %self.job_id, value = %line, "unparsable start stamp");
            }
            self.start_stamp = stamp;
            self.last_stamp = stamp;
            self.gate = Gate::Running;
            debug!(job_id = %self.job_id, ?stamp, "job started");
        }
        let done = self.producer_done();
        self.fill_stream(StreamTag::Stdout, max, done)?;
        self.fill_stream(StreamTag::Stderr, max, done)?;
        self.events.fill(max, done)?;
        // Exit is not looked for while buffered output is still pending.
        if matches!(self.gate, Gate::Running) && self.buffers_quiet() {
            self.observe_exit()?;
        }
        Ok(())
    }

    fn fill_stream(
        &mut self,
        tag: StreamTag,
        max: usize,
        producer_done: bool,
    ) -> Result<(), StreamError> {
        let (file, buf) = match tag {
            StreamTag::Stdout => (&mut self.stdout_file, &mut self.stdout),
            StreamTag::Stderr => (&mut self.stderr_file, &mut self.stderr),
        };
        let mut added = 0usize;
        while max == 0 || added < max {
            let Some(line) = file.read_line(producer_done)? else {
                break;
            };
            buf.push_line(line);
            added += 1;
        }
        Ok(())
    }

    fn producer_done(&mut self) -> bool {
        self.runner_exited
            || matches!(self.gate, Gate::Finishing | Gate::Done)
            || self.exit_file.exists()
    }

    fn buffers_quiet(&self) -> bool {
        !self.stdout.has_chunks() && !self.stderr.has_chunks() && !self.events.has_pending()
    }

    /// Check for the exit value; on first sighting, move to finishing and
    /// do one unbounded fill to race-proof the producer's last writes.
    fn observe_exit(&mut self) -> Result<bool, StreamError> {
        let observed = match self.exit_file.read_line()? {
            Some(line) => Some(line),
            None if self.runner_exited => Some("-1".to_string()),
            None => None,
        };
        let Some(value) = observed else {
            return Ok(false);
        };
        debug!(job_id = %self.job_id, value = %value, "exit observed");
        self.exit_value = Some(value);
        self.gate = Gate::Finishing;
        self.fill_stream(StreamTag::Stdout, 0, true)?;
        self.fill_stream(StreamTag::Stderr, 0, true)?;
        self.events.fill(0, true)?;
        Ok(true)
    }

    // ── Synchronization ──

    fn stream(&self, tag: StreamTag) -> &StreamBuffer {
        match tag {
            StreamTag::Stdout => &self.stdout,
            StreamTag::Stderr => &self.stderr,
        }
    }

    fn stream_mut(&mut self, tag: StreamTag) -> &mut StreamBuffer {
        match tag {
            StreamTag::Stdout => &mut self.stdout,
            StreamTag::Stderr => &mut self.stderr,
        }
    }

    /// Drive one poller, moving whatever it resolved into the ready
    /// buffer before any error surfaces — those lines are already
    /// consumed and must not be lost with the batch. Returns how many
    /// facets were emitted.
    fn drive_stream(
        &mut self,
        tag: StreamTag,
        budget: Option<usize>,
    ) -> Result<usize, StreamError> {
        let mut facets = Vec::new();
        let result = match tag {
            StreamTag::Stdout => {
                self.stdout
                    .drive(budget, &self.sep, &mut self.events, &mut facets)
            }
            StreamTag::Stderr => {
                self.stderr
                    .drive(budget, &self.sep, &mut self.events, &mut facets)
            }
        };
        let emitted = facets.len();
        for facet in facets {
            self.push_text_event(facet);
        }
        result?;
        Ok(emitted)
    }

    /// Drive both pollers and pair barriers until nothing moves.
    ///
    /// Returns true when the pass stalled (no further progress without
    /// new data), false when it stopped on the budget.
    fn poll_streams(&mut self, max: usize) -> Result<bool, StreamError> {
        let budget = (max > 0).then_some(max);
        let mut emitted = 0usize;
        loop {
            let mut progress = false;
            for tag in [StreamTag::Stdout, StreamTag::Stderr] {
                let remaining = budget.map(|m| m.saturating_sub(emitted));
                if remaining == Some(0) {
                    return Ok(false);
                }
                let driven = self.drive_stream(tag, remaining)?;
                emitted += driven;
                progress |= driven > 0;
            }
            if self.stdout.head_barrier().is_some() && self.stderr.head_barrier().is_some() {
                let released_out = self.try_release(StreamTag::Stdout)?;
                let released_err = self.try_release(StreamTag::Stderr)?;
                emitted += usize::from(released_out) + usize::from(released_err);
                progress |= released_out || released_err;
            }
            if !progress {
                return Ok(true);
            }
        }
    }

    /// Release the structured event named by this stream's head barrier.
    ///
    /// Holds the barrier when the record has not arrived yet — skipping
    /// would lose an event; the next poll retries after a fresh fill.
    fn try_release(&mut self, tag: StreamTag) -> Result<bool, StreamError> {
        let Some(barrier) = self.stream(tag).head_barrier().cloned() else {
            return Ok(false);
        };
        let seen_key = (barrier.tid.clone(), barrier.pid.clone(), barrier.stream_id);
        if self.seen.contains(&seen_key) {
            // The other stream already released this one.
            self.stream_mut(tag).pop_barrier();
            return Ok(true);
        }
        let shard = (barrier.pid.clone(), barrier.tid.clone());
        let Some(queued) = self.events.pop_event(&shard) else {
            return Ok(false);
        };
        self.stream_mut(tag).pop_barrier();
        let record = queued.decode(&shard)?;
        let queued_sid = marker::routing_u64(&record, "stream_id").ok_or_else(|| {
            StreamError::EventDecode {
                pid: barrier.pid.clone(),
                tid: barrier.tid.clone(),
                source: <serde_json::Error as serde::de::Error>::custom("record has no stream_id"),
            }
        })?;
        if queued_sid != barrier.stream_id {
            return Err(StreamError::OrderingViolation {
                pid: barrier.pid,
                tid: barrier.tid,
                barrier: barrier.stream_id,
                queued: queued_sid,
            });
        }
        debug!(
            stream = tag.as_str(),
            pid = %barrier.pid,
            tid = %barrier.tid,
            stream_id = barrier.stream_id,
            "structured event released"
        );
        self.seen.insert(seen_key);
        self.push_structured_event(record);
        Ok(true)
    }

    /// The producer is gone and nothing more will pair up: flush comment
    /// groups, clear blocked barriers, and drain every shard queue.
    fn terminal_flush(&mut self) -> Result<(), StreamError> {
        debug!(job_id = %self.job_id, "terminal flush");
        for tag in [StreamTag::Stdout, StreamTag::Stderr] {
            loop {
                self.drive_stream(tag, None)?;
                let Some(barrier) = self.stream(tag).head_barrier().cloned() else {
                    break;
                };
                if !self.try_release(tag)? {
                    warn!(
                        pid = %barrier.pid,
                        tid = %barrier.tid,
                        stream_id = barrier.stream_id,
                        "dropping barrier with no event record at shutdown"
                    );
                    self.stream_mut(tag).pop_barrier();
                }
            }
            if let Some(facet) = self.stream_mut(tag).flush_group() {
                self.push_text_event(facet);
            }
        }
        for (key, queue) in self.events.take_all() {
            for queued in queue {
                let record = queued.decode(&key)?;
                self.push_structured_event(record);
            }
        }
        Ok(())
    }

    // ── Emission ──

    fn push_text_event(&mut self, mut facet: Value) {
        let event_id = ensure_event_id(&mut facet, &mut self.ids);
        self.ready.push_back(HarnessEvent {
            event_id,
            job_id: self.job_id.clone(),
            run_id: self.run_id.clone(),
            stamp: self.last_stamp,
            facet_data: facet,
        });
    }

    fn push_structured_event(&mut self, record: Value) {
        if let Some(stamp) = record.get("stamp").and_then(Value::as_f64) {
            self.last_stamp = Some(stamp);
        }
        let mut facet = match record {
            Value::Object(mut map) => match map.remove("facet_data") {
                Some(facet) => facet,
                None => Value::Object(map),
            },
            other => other,
        };
        let event_id = ensure_event_id(&mut facet, &mut self.ids);
        self.ready.push_back(HarnessEvent {
            event_id,
            job_id: self.job_id.clone(),
            run_id: self.run_id.clone(),
            stamp: self.last_stamp,
            facet_data: facet,
        });
    }

    fn start_event(&mut self) -> Result<HarnessEvent, StreamError> {
        let script = self
            .script_file
            .read_line()?
            .unwrap_or_else(|| "UNKNOWN".to_string());
        let stamp = self.start_stamp;
        let details = match stamp {
            Some(stamp) => format!("Job {} started at {stamp}", self.job_id),
            None => format!("Job {} started", self.job_id),
        };
        debug!(job_id = %self.job_id, file = %script, "synthesizing start event");
        let mut facet = json!({
            "harness_job_start": {
                "details": details,
                "job_id": self.job_id,
                "stamp": stamp,
                "file": script,
                "rel_file": script,
                "abs_file": absolutize(&script),
            }
        });
        let event_id = ensure_event_id(&mut facet, &mut self.ids);
        Ok(HarnessEvent {
            event_id,
            job_id: self.job_id.clone(),
            run_id: self.run_id.clone(),
            stamp,
            facet_data: facet,
        })
    }

    fn exit_event(&mut self) -> HarnessEvent {
        let value = self.exit_value.clone().unwrap_or_else(|| "-1".to_string());
        let (code, stamp) = parse_exit_value(&value);
        // Whole-file copies for downstream convenience; unreadable means
        // null, never an error this late.
        let stdout = fs::read_to_string(JobFile::Stdout.path(&self.job_root)).ok();
        let stderr = fs::read_to_string(JobFile::Stderr.path(&self.job_root)).ok();
        debug!(job_id = %self.job_id, code, "synthesizing exit event");
        let mut facet = json!({
            "harness_job_exit": {
                "details": format!("Test script exited {code}"),
                "exit": code,
                "job_id": self.job_id,
                "stamp": stamp,
                "stdout": stdout,
                "stderr": stderr,
            }
        });
        let event_id = ensure_event_id(&mut facet, &mut self.ids);
        HarnessEvent {
            event_id,
            job_id: self.job_id.clone(),
            run_id: self.run_id.clone(),
            stamp,
            facet_data: facet,
        }
    }
}

fn absolutize(script: &str) -> String {
    if script == "UNKNOWN" {
        return script.to_string();
    }
    match std::path::absolute(script) {
        Ok(path) => path.display().to_string(),
        Err(_) => script.to_string(),
    }
}

/// Split `"<exit_code> <stamp>"`. A bare code has no stamp; an
/// unparsable code degrades to -1.
fn parse_exit_value(raw: &str) -> (i32, Option<f64>) {
    let raw = raw.trim();
    let (code_str, stamp_str) = match raw.split_once(' ') {
        Some((code, stamp)) => (code, Some(stamp)),
        None => (raw, None),
    };
    let code = match code_str.parse() {
        Ok(code) => code,
        Err(_) => {
            warn!(value = %raw, "unparsable exit code");
            -1
        }
    };
    let stamp = stamp_str.and_then(|s| s.trim().parse().ok());
    (code, stamp)
}
