//! Per-session structured log files.
//!
//! Every session writes into its own directory below the configured log root
//! (`<root>/<session id>/`), with one JSON-lines file per instance named after
//! the instance. Entries are mirrored to `tracing` so the same events reach
//! the process-wide subscriber, and selected messages are duplicated on the
//! operator console.

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::OpenOptions;
use cap_std::{ambient_authority, fs_utf8::Dir, fs_utf8::File};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Context used for entries the log sink writes about itself.
const SINK_CONTEXT: &str = "taster";

/// Severity of a log entry.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Verbose diagnostics.
    Debug,
    /// Routine progress.
    Info,
    /// Something unexpected that does not stop the session.
    Warn,
    /// A failure affecting a suite or the session.
    Error,
    /// A failure that ends the session.
    Fatal,
    /// Severity the caller could not classify.
    Unknown,
}

impl Severity {
    /// Returns the canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a severity name does not match any [`Severity`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("'{0}' is not a logging severity name")]
pub struct UnknownSeverity(pub String);

impl FromStr for Severity {
    type Err = UnknownSeverity;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "fatal" => Ok(Self::Fatal),
            "unknown" => Ok(Self::Unknown),
            _ => Err(UnknownSeverity(value.to_owned())),
        }
    }
}

/// One line of an instance log file.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LogEntry {
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// Severity the entry was written at.
    pub severity: Severity,
    /// Subsystem that produced the entry (for example `SSH`).
    pub context: Option<String>,
    /// Free-form message.
    pub message: String,
    /// Severity name the caller asked for when it could not be parsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_severity: Option<String>,
}

/// Errors raised while preparing log files.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LogError {
    /// Raised when the session directory cannot be created or opened.
    #[error("failed to prepare log directory {path}: {message}")]
    Directory {
        /// Directory that could not be prepared.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when an instance log file cannot be opened.
    #[error("failed to open log file {path}: {message}")]
    File {
        /// File that could not be opened.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
}

/// Operator-facing output stream used for progress messages.
#[derive(Clone)]
pub struct Console {
    sink: Arc<Mutex<dyn Write + Send>>,
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Console").finish_non_exhaustive()
    }
}

impl Console {
    /// Writes progress to the process's standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self::from_writer(io::stdout())
    }

    /// Discards progress output.
    #[must_use]
    pub fn silent() -> Self {
        Self::from_writer(io::sink())
    }

    /// Writes progress to an arbitrary writer.
    #[must_use]
    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            sink: Arc::new(Mutex::new(writer)),
        }
    }

    /// Writes one line of progress. Failures are ignored.
    pub fn say(&self, message: &str) {
        if let Ok(mut sink) = self.sink.lock() {
            writeln!(sink, "{message}").ok();
            sink.flush().ok();
        }
    }
}

/// Log directory belonging to a single session.
#[derive(Debug)]
pub struct SessionLog {
    session_id: String,
    path: Utf8PathBuf,
    dir: Dir,
    console: Console,
}

impl SessionLog {
    /// Creates `<root>/<session_id>/`, including any missing parents.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Directory`] when the directory cannot be created
    /// or opened.
    pub fn create(
        root: &Utf8Path,
        session_id: &str,
        console: Console,
    ) -> Result<Self, LogError> {
        let path = root.join(session_id);
        let to_error = |err: io::Error| LogError::Directory {
            path: path.clone(),
            message: err.to_string(),
        };
        Dir::create_ambient_dir_all(&path, ambient_authority()).map_err(to_error)?;
        let dir = Dir::open_ambient_dir(&path, ambient_authority()).map_err(to_error)?;

        Ok(Self {
            session_id: session_id.to_owned(),
            path,
            dir,
            console,
        })
    }

    /// Directory holding this session's files.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Console shared by every log opened from this session.
    #[must_use]
    pub const fn console(&self) -> &Console {
        &self.console
    }

    /// Opens (or appends to) `<instance_name>.log` inside the session
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::File`] when the file cannot be opened.
    pub fn instance_log(&self, instance_name: &str) -> Result<InstanceLog, LogError> {
        let file_name = format!("{instance_name}.log");
        let path = self.path.join(&file_name);
        let file = self
            .dir
            .open_with(&file_name, OpenOptions::new().create(true).append(true))
            .map_err(|err| LogError::File {
                path: path.clone(),
                message: err.to_string(),
            })?;

        Ok(InstanceLog {
            session_id: self.session_id.clone(),
            instance: instance_name.to_owned(),
            path,
            file: Arc::new(Mutex::new(file)),
            console: self.console.clone(),
        })
    }
}

/// Structured log for one instance, paired with the instance for its whole
/// lifetime.
#[derive(Clone, Debug)]
pub struct InstanceLog {
    session_id: String,
    instance: String,
    path: Utf8PathBuf,
    file: Arc<Mutex<File>>,
    console: Console,
}

impl InstanceLog {
    /// Location of the log file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Writes an entry without context.
    pub fn info(&self, message: &str) {
        self.record(Severity::Info, None, message);
    }

    /// Writes a warning without context.
    pub fn warn(&self, message: &str) {
        self.record(Severity::Warn, None, message);
    }

    /// Writes an error without context.
    pub fn error(&self, message: &str) {
        self.record(Severity::Error, None, message);
    }

    /// Writes an entry and duplicates the message on the console.
    pub fn announce(&self, severity: Severity, message: &str) {
        self.console.say(message);
        self.record(severity, None, message);
    }

    /// Writes a message to the console only.
    pub fn say(&self, message: &str) {
        self.console.say(message);
    }

    /// Writes an entry at `severity` tagged with an optional context.
    pub fn record(&self, severity: Severity, context: Option<&str>, message: &str) {
        self.write_entry(LogEntry {
            timestamp: Utc::now(),
            severity,
            context: context.map(str::to_owned),
            message: message.to_owned(),
            requested_severity: None,
        });
    }

    /// Writes an entry whose severity is given by name.
    ///
    /// Unrecognised names never fail the caller: an error entry describes
    /// the bad name and the message is then written at `INFO`, tagged with
    /// the name that was asked for.
    pub fn record_named(&self, level: &str, context: Option<&str>, message: &str, echo: bool) {
        if echo {
            self.console.say(message);
        }

        match level.parse::<Severity>() {
            Ok(severity) => self.record(severity, context, message),
            Err(err) => {
                self.console
                    .say(&format!("{err}; use a valid severity when logging"));
                self.record(
                    Severity::Error,
                    Some(SINK_CONTEXT),
                    &format!("{err}. Defaulting to INFO."),
                );
                self.write_entry(LogEntry {
                    timestamp: Utc::now(),
                    severity: Severity::Info,
                    context: context.map(str::to_owned),
                    message: message.to_owned(),
                    requested_severity: Some(level.to_owned()),
                });
            }
        }
    }

    fn write_entry(&self, entry: LogEntry) {
        self.mirror(&entry);

        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(path = %self.path, error = %err, "failed to encode log entry");
                return;
            }
        };

        let Ok(mut file) = self.file.lock() else {
            tracing::warn!(path = %self.path, "log file lock poisoned; entry dropped");
            return;
        };
        if let Err(err) = writeln!(file, "{line}") {
            tracing::warn!(path = %self.path, error = %err, "failed to write log entry");
        }
    }

    fn mirror(&self, entry: &LogEntry) {
        let session = self.session_id.as_str();
        let instance = self.instance.as_str();
        let context = entry.context.as_deref().unwrap_or("-");
        let message = entry.message.as_str();
        match entry.severity {
            Severity::Debug => tracing::debug!(session, instance, context, "{message}"),
            Severity::Info | Severity::Unknown => {
                tracing::info!(session, instance, context, "{message}");
            }
            Severity::Warn => tracing::warn!(session, instance, context, "{message}"),
            Severity::Error | Severity::Fatal => {
                tracing::error!(session, instance, context, "{message}");
            }
        }
    }
}
