//! Per-run log files plus listing/cleanup of the log directory.
//!
//! Each line is written as `[HH:MM:SS] <classification> <text>` and flushed
//! immediately, so a crash loses at most the line being written.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::PersistenceError;
use crate::runner::LogLine;

const LOG_EXT: &str = "log";
const SNIFF_BYTES: u64 = 4096;

/// Opens log files under one directory.
#[derive(Debug, Clone)]
pub struct LogWriter {
    dir: PathBuf,
}

impl LogWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the log file for a run started at `started_at` for `script`.
    /// The file exists (empty) when this returns.
    pub fn open(&self, started_at: DateTime<Local>, script: &Path) -> Result<LogHandle, PersistenceError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| PersistenceError::write(&self.dir, e))?;

        let base = format!("{}_{}", sanitize_stem(script), started_at.format("%Y-%m-%d_%H-%M-%S"));
        let mut attempt = 0u32;
        loop {
            let name = if attempt == 0 {
                format!("{}.{}", base, LOG_EXT)
            } else {
                format!("{}_{}.{}", base, attempt, LOG_EXT)
            };
            let path = self.dir.join(name);
            // Never reuse an existing file.
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    debug!(path = %path.display(), "log file opened");
                    return Ok(LogHandle {
                        path,
                        file: Some(file),
                        lines: 0,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(PersistenceError::write(path, e)),
            }
        }
    }
}

/// An open run log. Closed on drop.
#[derive(Debug)]
pub struct LogHandle {
    path: PathBuf,
    file: Option<File>,
    lines: usize,
}

impl LogHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of lines appended so far.
    pub fn lines(&self) -> usize {
        self.lines
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    /// Append and flush one formatted line.
    pub fn append(&mut self, line: &LogLine) -> Result<(), PersistenceError> {
        let Some(file) = self.file.as_mut() else {
            return Err(PersistenceError::Closed {
                path: self.path.clone(),
            });
        };
        let record = format_line(line);
        file.write_all(record.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| PersistenceError::write(&self.path, e))?;
        self.lines += 1;
        Ok(())
    }

    /// Close the file. Calling it again does nothing.
    pub fn close(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.sync_all() {
                warn!(path = %self.path.display(), error = %e, "failed to sync log file");
            }
            debug!(path = %self.path.display(), lines = self.lines, "log file closed");
        }
    }
}

impl Drop for LogHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// `[HH:MM:SS] <classification> <text>\n`
pub fn format_line(line: &LogLine) -> String {
    format!(
        "[{}] {} {}\n",
        line.timestamp.format("%H:%M:%S"),
        line.classification,
        line.text
    )
}

/// Keep `[A-Za-z0-9._-]` from the script's file stem, replace the rest.
pub fn sanitize_stem(script: &Path) -> String {
    let stem = script
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches(|c| c == '_' || c == '.').is_empty() {
        "output".to_string()
    } else {
        cleaned
    }
}

// ---------------------------------------------------------------------------
// Log directory browsing
// ---------------------------------------------------------------------------

/// Coarse tag for a whole log file, from its first few KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    Error,
    Warning,
    Success,
    Other,
}

impl std::fmt::Display for LogCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogCategory::Error => write!(f, "error"),
            LogCategory::Warning => write!(f, "warning"),
            LogCategory::Success => write!(f, "success"),
            LogCategory::Other => write!(f, "other"),
        }
    }
}

impl std::str::FromStr for LogCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" | "errors" => Ok(LogCategory::Error),
            "warning" | "warnings" => Ok(LogCategory::Warning),
            "success" => Ok(LogCategory::Success),
            "other" => Ok(LogCategory::Other),
            other => Err(format!("unknown log category '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub path: PathBuf,
    pub modified: Option<DateTime<Local>>,
    pub category: LogCategory,
}

/// All `.log` files in `dir`, newest first. A missing directory is empty.
pub fn list_logs(dir: &Path) -> Vec<LogEntry> {
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut entries: Vec<LogEntry> = read_dir
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| is_log_file(p))
        .map(|path| {
            let modified = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Local>::from);
            let category = categorize(&path);
            LogEntry {
                path,
                modified,
                category,
            }
        })
        .collect();
    entries.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.path.cmp(&a.path)));
    entries
}

/// Tag a log by scanning its head for error, warning and success markers, in
/// that priority.
pub fn categorize(path: &Path) -> LogCategory {
    let mut head = Vec::new();
    let read = File::open(path).and_then(|f| f.take(SNIFF_BYTES).read_to_end(&mut head));
    if read.is_err() {
        return LogCategory::Other;
    }
    let head = String::from_utf8_lossy(&head).to_lowercase();
    let tags: [(LogCategory, &[&str]); 3] = [
        (LogCategory::Error, &["error", "exception", "traceback"]),
        (LogCategory::Warning, &["warning"]),
        (LogCategory::Success, &["success", "done"]),
    ];
    tags.iter()
        .find(|(_, needles)| needles.iter().any(|n| head.contains(n)))
        .map(|(category, _)| *category)
        .unwrap_or(LogCategory::Other)
}

/// Delete one log file. Refuses anything that is not a `.log` file.
pub fn delete_log(path: &Path) -> Result<(), PersistenceError> {
    if !is_log_file(path) {
        return Err(PersistenceError::write(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a .log file"),
        ));
    }
    std::fs::remove_file(path).map_err(|e| PersistenceError::write(path, e))
}

/// Delete every `.log` file in `dir`. Returns how many were removed; files
/// that cannot be removed are skipped with a warning.
pub fn clear_logs(dir: &Path) -> usize {
    let mut removed = 0;
    for entry in list_logs(dir) {
        match std::fs::remove_file(&entry.path) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %entry.path.display(), error = %e, "failed to delete log"),
        }
    }
    removed
}

fn is_log_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(LOG_EXT))
}
