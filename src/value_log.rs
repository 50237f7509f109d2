//! Append-only per-source value log
//!
//! Each source with logging enabled gets a text file named after it under the
//! log directory. Every successful extraction appends one entry:
//!
//! ```text
//! [10-15-2026 14:01:12]
//! 101.5
//!
//! ```

use crate::error::LogSinkError;
use log::{debug, warn};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

const UNSAFE_CHARS: [char; 9] = ['\\', '/', ':', '"', '*', '?', '<', '>', '|'];

/// One value to append
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub source_name: String,
    /// Local request time, `MM-DD-YYYY HH:MM:SS`
    pub date_time: String,
    pub raw_value: String,
}

/// Writes value log entries under a directory
#[derive(Debug, Clone)]
pub struct ValueLog {
    dir: PathBuf,
}

impl ValueLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// File name a source's entries are written to
    ///
    /// Spaces become underscores and characters that are unsafe in file names
    /// are dropped.
    pub fn file_name_for(source_name: &str) -> String {
        let stem: String = source_name
            .replace(' ', "_")
            .chars()
            .filter(|c| !UNSAFE_CHARS.contains(c))
            .collect();
        if stem.is_empty() {
            "unnamed.txt".to_string()
        } else {
            format!("{}.txt", stem)
        }
    }

    /// Append one entry, creating the directory and file as needed
    ///
    /// # Returns
    ///
    /// Path of the file that was written
    ///
    /// # Errors
    ///
    /// Returns `LogSinkError::Io` if the directory or file cannot be written.
    pub fn append(&self, entry: &LogEntry) -> Result<PathBuf, LogSinkError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(Self::file_name_for(&entry.source_name));

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        write!(file, "[{}]\n{}\n\n", entry.date_time, entry.raw_value)?;

        debug!("{}: Logging to {}", entry.source_name, path.display());
        Ok(path)
    }

    /// Append an entry, logging rather than returning any failure
    pub fn append_or_warn(&self, entry: &LogEntry) {
        if let Err(e) = self.append(entry) {
            warn!("{}: Logging failed: {}", entry.source_name, e);
        }
    }
}
