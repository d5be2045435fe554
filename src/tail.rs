//! Atomic-line tail reading of a growing file.
//!
//! The producer appends newline-framed records while we read. A read
//! attempt only advances the tracked offset when it got a complete line,
//! so a half-written trailing line is never emitted — it is re-read from
//! the same offset on the next attempt, by which time the producer has
//! usually finished it. Once the producer is known dead the final
//! unterminated line is accepted as-is.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};

/// Tail-reads one file line by line from a tracked offset.
pub struct TailReader {
    file: File,
    pos: u64,
}

impl TailReader {
    pub fn new(file: File) -> Self {
        Self { file, pos: 0 }
    }

    /// Attempt to read the next complete line.
    ///
    /// Returns `None` when no complete line is available yet. With
    /// `producer_done` set, a trailing line without a newline is accepted
    /// too. The newline is retained; stripping is the caller's business.
    /// Seeking back to the saved offset on every attempt also clears any
    /// sticky EOF, so data appended after a previous read attempt is seen.
    pub fn read_line(&mut self, producer_done: bool) -> io::Result<Option<String>> {
        self.file.seek(SeekFrom::Start(self.pos))?;
        let mut reader = BufReader::new(&self.file);
        let mut buf = Vec::new();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        if buf.last() != Some(&b'\n') && !producer_done {
            // Partial trailing line: leave the offset where it was.
            return Ok(None);
        }
        self.pos += n as u64;
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    /// Byte offset of the next read attempt.
    #[allow(dead_code)]
    pub fn offset(&self) -> u64 {
        self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use std::path::Path;

    fn open(path: &Path) -> TailReader {
        TailReader::new(File::open(path).unwrap())
    }

    #[test]
    fn reads_complete_lines_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stdout");
        fs::write(&path, "one\ntwo\n").unwrap();

        let mut reader = open(&path);
        assert_eq!(reader.read_line(false).unwrap().as_deref(), Some("one\n"));
        assert_eq!(reader.read_line(false).unwrap().as_deref(), Some("two\n"));
        assert_eq!(reader.read_line(false).unwrap(), None);
    }

    #[test]
    fn withholds_partial_trailing_line() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stdout");
        fs::write(&path, "complete\nhal").unwrap();

        let mut reader = open(&path);
        assert_eq!(
            reader.read_line(false).unwrap().as_deref(),
            Some("complete\n")
        );
        assert_eq!(reader.read_line(false).unwrap(), None);
        // Offset stayed put, so completing the line makes it readable.
        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(f, "f line\n").unwrap();
        assert_eq!(
            reader.read_line(false).unwrap().as_deref(),
            Some("half line\n")
        );
    }

    #[test]
    fn accepts_partial_line_once_producer_done() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stdout");
        fs::write(&path, "truncated").unwrap();

        let mut reader = open(&path);
        assert_eq!(reader.read_line(false).unwrap(), None);
        assert_eq!(
            reader.read_line(true).unwrap().as_deref(),
            Some("truncated")
        );
        assert_eq!(reader.read_line(true).unwrap(), None);
    }

    #[test]
    fn sees_data_appended_after_eof() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stdout");
        fs::write(&path, "first\n").unwrap();

        let mut reader = open(&path);
        assert_eq!(reader.read_line(false).unwrap().as_deref(), Some("first\n"));
        assert_eq!(reader.read_line(false).unwrap(), None);

        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(f, "second\n").unwrap();
        assert_eq!(
            reader.read_line(false).unwrap().as_deref(),
            Some("second\n")
        );
    }

    #[test]
    fn empty_file_yields_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stdout");
        fs::write(&path, "").unwrap();

        let mut reader = open(&path);
        assert_eq!(reader.read_line(false).unwrap(), None);
        assert_eq!(reader.read_line(true).unwrap(), None);
    }
}
