/*============================================================
  Synavera Project: Syn-Till
  Module: syntill_core::logger
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1
  ------------------------------------------------------------
  Purpose:
    Provide structured, append-only logging for update checks,
    staging, applies, and process handoffs.

  Security / Safety Notes:
    Registered secrets (the remote bearer credential) are
    masked before any line reaches stderr or the log file.

  Dependencies:
    std::fs::File, std::sync::Mutex, sha2 for integrity hashing.

  Operational Scope:
    Shared by every component; the session digest is written
    when the binary exits through a normal path.

  Revision History:
    2024-11-04 COD  Established logging module.
    2025-11-12 COD  Added secret redaction for update credentials.
  ------------------------------------------------------------
  SSE Principles Observed:
    - Append-only logging with UTC timestamps
    - Deterministic formatting for auditability
    - Graceful error propagation on I/O failures
============================================================*/

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use sha2::{Digest, Sha256};

use crate::error::{Result, SynTillError};

const REDACTED: &str = "[redacted]";

/// Structured log level for Syn-Till-Core events.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Shared logger that emits append-only entries in Synavera format.
pub struct Logger {
    file: Option<Mutex<BufWriter<File>>>,
    path: Option<PathBuf>,
    verbose: bool,
    secrets: Vec<String>,
}

impl Logger {
    /// Build a logger that writes to stderr and optionally to a file.
    pub fn new(path: Option<PathBuf>, verbose: bool) -> Result<Self> {
        let file = match path.as_deref() {
            Some(file_path) => Some(Mutex::new(BufWriter::new(open_append(file_path)?))),
            None => None,
        };

        Ok(Self {
            file,
            path,
            verbose,
            secrets: Vec::new(),
        })
    }

    /// Logger with no file sink and no stderr chatter below WARN.
    pub fn silent() -> Self {
        Self {
            file: None,
            path: None,
            verbose: false,
            secrets: Vec::new(),
        }
    }

    /// Register a value that must never appear in emitted lines.
    pub fn with_secret(mut self, secret: Option<&str>) -> Self {
        if let Some(value) = secret.filter(|value| !value.is_empty()) {
            self.secrets.push(value.to_string());
        }
        self
    }

    /// Emit a log entry with the given level, code, and message.
    pub fn log<S: AsRef<str>>(&self, level: LogLevel, code: &str, message: S) {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let payload = self.render(&timestamp, level, code, message.as_ref());

        if self.verbose || level == LogLevel::Error || level == LogLevel::Warn {
            eprintln!("{payload}");
        }

        let Some(file) = &self.file else {
            return;
        };
        if let Ok(mut guard) = file.lock() {
            if writeln!(guard, "{payload}").is_err() || guard.flush().is_err() {
                eprintln!(
                    "{timestamp} [{}] [LOGGER] Failed to write to log file",
                    LogLevel::Error.as_str()
                );
            }
        }
    }

    fn render(&self, timestamp: &str, level: LogLevel, code: &str, message: &str) -> String {
        let mut masked = message.to_string();
        for secret in &self.secrets {
            masked = masked.replace(secret.as_str(), REDACTED);
        }
        format!("{timestamp} [{}] [{code}] {masked}", level.as_str())
    }

    /// Convenience wrapper for `INFO` level events.
    pub fn info<S: AsRef<str>>(&self, code: &str, message: S) {
        self.log(LogLevel::Info, code, message);
    }

    /// Convenience wrapper for `WARN` level events.
    pub fn warn<S: AsRef<str>>(&self, code: &str, message: S) {
        self.log(LogLevel::Warn, code, message);
    }

    /// Convenience wrapper for `ERROR` level events.
    pub fn error<S: AsRef<str>>(&self, code: &str, message: S) {
        self.log(LogLevel::Error, code, message);
    }

    /// Convenience wrapper for `DEBUG` level events.
    pub fn debug<S: AsRef<str>>(&self, code: &str, message: S) {
        self.log(LogLevel::Debug, code, message);
    }

    /// Return the path backing this logger, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Compute and persist SHA-256 digest of the session log.
    pub fn finalize(&self) -> Result<()> {
        let Some(path) = self.path() else {
            return Ok(());
        };
        if let Some(file) = &self.file {
            if let Ok(mut guard) = file.lock() {
                guard.flush()?;
            }
        }
        let data = std::fs::read(path).map_err(|err| {
            SynTillError::Filesystem(format!(
                "Failed to read log for hashing {}: {err}",
                path.display()
            ))
        })?;
        let digest = Sha256::digest(&data);
        let mut hash_os = path.as_os_str().to_os_string();
        hash_os.push(".hash");
        let hash_path = PathBuf::from(hash_os);
        let line = format!(
            "{:x}  {}\n",
            digest,
            path.file_name().unwrap_or_default().to_string_lossy()
        );
        std::fs::write(&hash_path, line).map_err(|err| {
            SynTillError::Filesystem(format!(
                "Failed to write hash file {}: {err}",
                hash_path.display()
            ))
        })
    }
}

fn open_append(file_path: &Path) -> Result<File> {
    if let Some(parent) = file_path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| {
            SynTillError::Filesystem(format!(
                "Failed to create log directory {}: {err}",
                parent.display()
            ))
        })?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(file_path)
        .map_err(|err| {
            SynTillError::Filesystem(format!(
                "Failed to open log file {}: {err}",
                file_path.display()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_secret_is_masked_in_file_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("logs/session.log");
        let logger = Logger::new(Some(log_path.clone()), false)
            .expect("logger")
            .with_secret(Some("ghp_supersecret"));

        logger.info("REMOTE", "Authorization: Bearer ghp_supersecret");
        logger.finalize().expect("finalize");

        let written = std::fs::read_to_string(&log_path).expect("log contents");
        assert!(written.contains("[INFO] [REMOTE] Authorization: Bearer [redacted]"));
        assert!(!written.contains("ghp_supersecret"));

        let hash = std::fs::read_to_string(dir.path().join("logs/session.log.hash"))
            .expect("hash file");
        assert!(hash.trim_end().ends_with("session.log"));
        assert_eq!(hash.split_whitespace().next().map(str::len), Some(64));
    }

    #[test]
    fn empty_secret_is_ignored() {
        let logger = Logger::silent().with_secret(Some(""));
        assert!(logger.secrets.is_empty());
        let line = logger.render("t", LogLevel::Debug, "X", "hello");
        assert_eq!(line, "t [DEBUG] [X] hello");
    }
}
