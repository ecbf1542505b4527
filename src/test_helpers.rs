//! Fixtures shared by unit tests that need a real log directory.

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use crate::session_log::{Console, InstanceLog, LogEntry, SessionLog};
use crate::test_support::SharedBuffer;

/// A session log rooted in a temporary directory, with the console captured.
pub struct ScratchLog {
    _tmp: TempDir,
    /// Session the instance log belongs to.
    pub session: SessionLog,
    /// Log for an instance named `vm`.
    pub log: InstanceLog,
    /// Everything written to the console.
    pub console: SharedBuffer,
}

impl ScratchLog {
    /// Creates a fresh session and instance log.
    ///
    /// # Panics
    ///
    /// Panics when the temporary directory cannot be prepared.
    #[must_use]
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non-utf8 tempdir: {}", path.display()));
        let console = SharedBuffer::default();
        let session = SessionLog::create(&root, "session", Console::from_writer(console.clone()))
            .unwrap_or_else(|err| panic!("session log: {err}"));
        let log = session
            .instance_log("vm")
            .unwrap_or_else(|err| panic!("instance log: {err}"));
        Self {
            _tmp: tmp,
            session,
            log,
            console,
        }
    }

    /// Entries written to the instance log so far.
    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        read_entries(self.log.path())
    }

    /// Messages of every entry, in order.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.entries().into_iter().map(|entry| entry.message).collect()
    }
}

/// Parses a JSON-lines log file.
///
/// # Panics
///
/// Panics when the file cannot be read or a line is not a log entry.
#[must_use]
pub fn read_entries(path: &Utf8Path) -> Vec<LogEntry> {
    let contents =
        std::fs::read_to_string(path).unwrap_or_else(|err| panic!("read {path}: {err}"));
    contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap_or_else(|err| panic!("parse {line}: {err}")))
        .collect()
}
