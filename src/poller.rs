//! Per-stream line state machine.
//!
//! Consumes buffered raw lines from one output stream (stdout or stderr),
//! recognizes inline harness markers, coalesces TAP comment runs, and
//! synthesizes facet payloads for plain text. Driving stops at an ESYNC
//! barrier — crossing one is the synchronizer's decision, not ours.

use std::collections::VecDeque;

use serde_json::{Value, json};
use tracing::debug;

use crate::comment::{CommentGroup, comment_indent};
use crate::error::StreamError;
use crate::events::EventsBuffer;
use crate::marker::{self, Barrier};

/// Which output stream a poller owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTag {
    Stdout,
    Stderr,
}

impl StreamTag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "STDOUT",
            Self::Stderr => "STDERR",
        }
    }

    /// stderr carries diagnostic-grade output.
    fn is_debug(self) -> bool {
        matches!(self, Self::Stderr)
    }
}

/// One buffered item: a raw text line or an installed ESYNC barrier.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Line(String),
    Barrier(Barrier),
}

/// A TAP line parser injected by the harness. Returns facet data for
/// lines it understands, `None` for free-form text.
pub type LineParser = Box<dyn Fn(&str) -> Option<Value> + Send>;

/// Line buffer and comment state for one output stream.
pub struct StreamBuffer {
    tag: StreamTag,
    chunks: VecDeque<Chunk>,
    group: Option<CommentGroup>,
    parser: Option<LineParser>,
}

impl StreamBuffer {
    pub fn new(tag: StreamTag, parser: Option<LineParser>) -> Self {
        Self {
            tag,
            chunks: VecDeque::new(),
            group: None,
            parser,
        }
    }

    pub fn push_line(&mut self, line: String) {
        self.chunks.push_back(Chunk::Line(line));
    }

    pub fn has_chunks(&self) -> bool {
        !self.chunks.is_empty()
    }

    pub fn head_barrier(&self) -> Option<&Barrier> {
        match self.chunks.front() {
            Some(Chunk::Barrier(barrier)) => Some(barrier),
            _ => None,
        }
    }

    /// Remove the head barrier. Only meaningful after `head_barrier`.
    pub fn pop_barrier(&mut self) -> Option<Barrier> {
        match self.chunks.front() {
            Some(Chunk::Barrier(_)) => match self.chunks.pop_front() {
                Some(Chunk::Barrier(barrier)) => Some(barrier),
                _ => None,
            },
            _ => None,
        }
    }

    /// Close the active comment group into one diagnostic facet.
    pub fn flush_group(&mut self) -> Option<Value> {
        let group = self.group.take()?;
        Some(self.facet_for(&group.joined()))
    }

    /// Process buffered lines until a barrier, an empty buffer, or the
    /// budget (`None` = unbounded) is reached. Emitted facet payloads are
    /// appended to `out`, in order; the caller owns the sink so facets
    /// resolved before a corrupt line survive the error — their source
    /// lines are already off the buffer and must not be lost. Inline
    /// EVENT payloads are routed into `events`.
    pub fn drive(
        &mut self,
        budget: Option<usize>,
        sep: &str,
        events: &mut EventsBuffer,
        out: &mut Vec<Value>,
    ) -> Result<(), StreamError> {
        let emitted_before = out.len();
        loop {
            if budget.is_some_and(|max| out.len() - emitted_before >= max) {
                break;
            }
            let line = match self.chunks.front() {
                None | Some(Chunk::Barrier(_)) => break,
                Some(Chunk::Line(_)) => match self.chunks.pop_front() {
                    Some(Chunk::Line(raw)) => strip_newline(&raw).to_string(),
                    _ => break,
                },
            };

            if let Some(hit) = marker::scan_line(&line, sep)? {
                // Leading residue is real output for this line; it takes
                // one normal trip through the comment/emit steps.
                if !hit.before.is_empty() {
                    self.absorb(&hit.before, out);
                }
                // A comment run never straddles a barrier.
                if let Some(facet) = self.flush_group() {
                    out.push(facet);
                }
                if let Some(event) = hit.event {
                    events.enqueue_inline(
                        (hit.barrier.pid.clone(), hit.barrier.tid.clone()),
                        event,
                    );
                }
                debug!(
                    stream = self.tag.as_str(),
                    pid = %hit.barrier.pid,
                    tid = %hit.barrier.tid,
                    stream_id = hit.barrier.stream_id,
                    "barrier installed"
                );
                self.chunks.push_front(Chunk::Barrier(hit.barrier));
                // Trailing residue belongs to the next logical line.
                if !hit.after.is_empty() {
                    match self.chunks.get_mut(1) {
                        Some(Chunk::Line(next)) => next.insert_str(0, &hit.after),
                        _ => self.chunks.insert(1, Chunk::Line(hit.after)),
                    }
                }
                break;
            }

            if let Some(indent) = comment_indent(&line) {
                let matches_group = self
                    .group
                    .as_ref()
                    .is_none_or(|group| group.indent() == indent);
                if !matches_group {
                    // Indentation changed: the flush is this iteration's
                    // output; the line waits for the next one.
                    if let Some(facet) = self.flush_group() {
                        out.push(facet);
                    }
                    self.chunks.push_front(Chunk::Line(line));
                    continue;
                }
                let indent = indent.to_string();
                self.group
                    .get_or_insert_with(|| CommentGroup::new(indent))
                    .push(&line);
                continue;
            }

            if self.group.is_some() {
                // Same two-step as above: flush now, re-process the line.
                if let Some(facet) = self.flush_group() {
                    out.push(facet);
                }
                self.chunks.push_front(Chunk::Line(line));
                continue;
            }

            let facet = self.facet_for(&line);
            out.push(facet);
        }
        Ok(())
    }

    /// One pass of the comment/emit steps for a line fragment that is
    /// already off the buffer (marker residue).
    fn absorb(&mut self, text: &str, out: &mut Vec<Value>) {
        if let Some(indent) = comment_indent(text) {
            let matches_group = self
                .group
                .as_ref()
                .is_none_or(|group| group.indent() == indent);
            if !matches_group {
                if let Some(facet) = self.flush_group() {
                    out.push(facet);
                }
            }
            let indent = indent.to_string();
            self.group
                .get_or_insert_with(|| CommentGroup::new(indent))
                .push(text);
        } else {
            if let Some(facet) = self.flush_group() {
                out.push(facet);
            }
            out.push(self.facet_for(text));
        }
    }

    /// Facet data for one line (or joined comment body): the injected
    /// parser's result, or a plain info facet.
    fn facet_for(&self, text: &str) -> Value {
        if let Some(parser) = &self.parser {
            if let Some(facet) = parser(text) {
                return facet;
            }
        }
        json!({
            "info": [{
                "details": text,
                "tag": self.tag.as_str(),
                "debug": self.tag.is_debug(),
            }]
        })
    }
}

fn strip_newline(raw: &str) -> &str {
    let s = raw.strip_suffix('\n').unwrap_or(raw);
    s.strip_suffix('\r').unwrap_or(s)
}
