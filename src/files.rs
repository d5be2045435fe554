//! The known files of a job output directory.
//!
//! A job directory holds exactly five named files plus the `events/`
//! shard directory. `ValueFile` covers the write-once files (`start`,
//! `exit`, `file`); `StreamFile` covers the append-only streams. All of
//! them may not exist yet when the streamer is constructed — everything
//! opens lazily and tolerates absence.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use crate::tail::TailReader;

/// Name of the structured-event shard directory under the job root.
pub const EVENTS_DIR: &str = "events";

/// The closed set of per-job files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFile {
    /// Wall-clock stamp recorded at job start.
    Start,
    /// `"<exit_code> <stamp>"`, written when the script exits.
    Exit,
    /// Path of the test script being executed.
    File,
    Stdout,
    Stderr,
}

impl JobFile {
    pub fn path(self, job_root: &Path) -> PathBuf {
        let name = match self {
            Self::Start => "start",
            Self::Exit => "exit",
            Self::File => "file",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        };
        job_root.join(name)
    }
}

/// A single-value file: one line, read once, cached forever.
///
/// Existence is also cached once observed — the producer never removes
/// these files.
pub struct ValueFile {
    path: PathBuf,
    exists: bool,
    value: Option<String>,
}

impl ValueFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            exists: false,
            value: None,
        }
    }

    pub fn exists(&mut self) -> bool {
        if !self.exists {
            self.exists = self.path.exists();
        }
        self.exists
    }

    /// The file's single line, once it has content.
    ///
    /// A file that exists but is still empty reads as not-there-yet; the
    /// producer writes these in one shot, so the next poll gets it.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        if let Some(value) = &self.value {
            return Ok(Some(value.clone()));
        }
        if !self.exists() {
            return Ok(None);
        }
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        if content.is_empty() {
            return Ok(None);
        }
        let line = content.lines().next().unwrap_or("").to_string();
        self.value = Some(line.clone());
        Ok(Some(line))
    }
}

/// An append-only text stream, opened lazily, tail-read line by line.
pub struct StreamFile {
    path: PathBuf,
    reader: Option<TailReader>,
}

impl StreamFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path, reader: None }
    }

    /// Next complete line, newline retained. `None` while the file is
    /// missing or no complete line is available.
    pub fn read_line(&mut self, producer_done: bool) -> io::Result<Option<String>> {
        if self.reader.is_none() {
            match File::open(&self.path) {
                Ok(file) => self.reader = Some(TailReader::new(file)),
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(err) => return Err(err),
            }
        }
        match &mut self.reader {
            Some(reader) => reader.read_line(producer_done),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // ── JobFile ──

    #[test]
    fn job_file_paths() {
        let root = Path::new("/jobs/42");
        assert_eq!(JobFile::Start.path(root), root.join("start"));
        assert_eq!(JobFile::Exit.path(root), root.join("exit"));
        assert_eq!(JobFile::File.path(root), root.join("file"));
        assert_eq!(JobFile::Stdout.path(root), root.join("stdout"));
        assert_eq!(JobFile::Stderr.path(root), root.join("stderr"));
    }

    // ── ValueFile ──

    #[test]
    fn value_file_missing_then_appears() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("start");
        let mut vf = ValueFile::new(path.clone());

        assert!(!vf.exists());
        assert_eq!(vf.read_line().unwrap(), None);

        fs::write(&path, "1000.5\n").unwrap();
        assert!(vf.exists());
        assert_eq!(vf.read_line().unwrap().as_deref(), Some("1000.5"));
    }

    #[test]
    fn value_file_caches_first_read() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("exit");
        fs::write(&path, "0 1001.0\n").unwrap();

        let mut vf = ValueFile::new(path.clone());
        assert_eq!(vf.read_line().unwrap().as_deref(), Some("0 1001.0"));

        // Later rewrites are invisible; the value was read exactly once.
        fs::write(&path, "1 9999.9\n").unwrap();
        assert_eq!(vf.read_line().unwrap().as_deref(), Some("0 1001.0"));
    }

    #[test]
    fn value_file_waits_for_content() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("start");
        fs::write(&path, "").unwrap();

        let mut vf = ValueFile::new(path.clone());
        assert_eq!(vf.read_line().unwrap(), None);

        fs::write(&path, "7.25\n").unwrap();
        assert_eq!(vf.read_line().unwrap().as_deref(), Some("7.25"));
    }

    #[test]
    fn value_file_takes_only_the_first_line() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("file");
        fs::write(&path, "t/basic.t\ntrailing junk\n").unwrap();

        let mut vf = ValueFile::new(path);
        assert_eq!(vf.read_line().unwrap().as_deref(), Some("t/basic.t"));
    }

    // ── StreamFile ──

    #[test]
    fn stream_file_tolerates_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sf = StreamFile::new(tmp.path().join("stdout"));
        assert_eq!(sf.read_line(false).unwrap(), None);
    }

    #[test]
    fn stream_file_reads_appended_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stdout");
        let mut sf = StreamFile::new(path.clone());

        assert_eq!(sf.read_line(false).unwrap(), None);

        fs::write(&path, "ok 1\n").unwrap();
        assert_eq!(sf.read_line(false).unwrap().as_deref(), Some("ok 1\n"));
        assert_eq!(sf.read_line(false).unwrap(), None);

        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(f, "ok 2\n").unwrap();
        assert_eq!(sf.read_line(false).unwrap().as_deref(), Some("ok 2\n"));
    }
}
