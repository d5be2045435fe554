//! TAP comment grouping.
//!
//! Consecutive `#`-prefixed lines at the same indentation coalesce into a
//! single diagnostic payload. A group never straddles an ESYNC barrier, a
//! non-comment line, or an indentation change — the poller flushes it at
//! each of those boundaries.

use std::sync::OnceLock;

use regex::Regex;

fn comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\s*)#").unwrap())
}

/// The indentation prefix of a TAP comment line, `None` for anything else.
pub fn comment_indent(line: &str) -> Option<&str> {
    comment_re()
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// An open run of same-indentation comment lines.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentGroup {
    indent: String,
    lines: Vec<String>,
}

impl CommentGroup {
    pub fn new(indent: String) -> Self {
        Self {
            indent,
            lines: Vec::new(),
        }
    }

    pub fn indent(&self) -> &str {
        &self.indent
    }

    pub fn push(&mut self, line: &str) {
        self.lines.push(line.to_string());
    }

    /// The group as one newline-joined diagnostic body.
    pub fn joined(&self) -> String {
        self.lines.join("\n")
    }
}
