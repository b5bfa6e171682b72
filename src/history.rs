//! Run history: one record per run, kept in insertion order.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::interpreter::ResolvedCommand;
use crate::runner::RunOutcome;

/// Default number of records kept.
pub const DEFAULT_HISTORY_LIMIT: usize = 40;

/// One invocation. `end`, `exit_code` and `error` are filled in once, when
/// the process terminates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: Uuid,
    pub script: PathBuf,
    /// Program that was spawned.
    pub interpreter: String,
    /// Arguments placed between the program and the script.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interpreter_args: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub log_path: PathBuf,
}

impl RunRecord {
    pub fn is_finished(&self) -> bool {
        self.end.is_some()
    }

    pub fn command(&self) -> ResolvedCommand {
        ResolvedCommand::new(self.interpreter.clone(), self.interpreter_args.clone())
    }

    /// Case-insensitive match against the script path and each argument.
    /// `needle` must already be lowercase.
    fn matches(&self, needle: &str) -> bool {
        self.script.to_string_lossy().to_lowercase().contains(needle)
            || self.args.iter().any(|a| a.to_lowercase().contains(needle))
    }
}

/// Ordered list of run records, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct History {
    records: Vec<RunRecord>,
}

impl<'de> Deserialize<'de> for History {
    /// Entries that do not parse (older formats, hand edits) are dropped one
    /// by one instead of failing the whole document.
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Vec::<serde_json::Value>::deserialize(deserializer)?;
        let total = raw.len();
        let records: Vec<RunRecord> = raw
            .into_iter()
            .filter_map(|value| serde_json::from_value(value).ok())
            .collect();
        if records.len() != total {
            warn!(dropped = total - records.len(), "ignored unreadable history entries");
        }
        Ok(Self { records })
    }
}

impl History {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RunRecord> {
        self.records.iter()
    }

    pub fn get(&self, id: Uuid) -> Option<&RunRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Append a record for a run that just started. When the history grows
    /// past `limit`, the oldest records are dropped.
    pub fn record_start(
        &mut self,
        script: &Path,
        command: &ResolvedCommand,
        args: &[String],
        log_path: &Path,
        start: DateTime<Utc>,
        limit: usize,
    ) -> RunRecord {
        let record = RunRecord {
            id: Uuid::new_v4(),
            script: script.to_path_buf(),
            interpreter: command.program.clone(),
            interpreter_args: command.args.clone(),
            args: args.to_vec(),
            start,
            end: None,
            exit_code: None,
            error: None,
            log_path: log_path.to_path_buf(),
        };
        self.records.push(record.clone());
        let limit = limit.max(1);
        if self.records.len() > limit {
            let excess = self.records.len() - limit;
            self.records.drain(..excess);
            debug!(dropped = excess, "trimmed history");
        }
        record
    }

    /// Fill in the end of a run. Unknown ids and already-finished records
    /// are logged and ignored.
    pub fn record_end(&mut self, id: Uuid, outcome: &RunOutcome, end: DateTime<Utc>) -> Option<&RunRecord> {
        let Some(record) = self.records.iter_mut().find(|r| r.id == id) else {
            warn!(%id, "no history entry for finished run");
            return None;
        };
        if record.is_finished() {
            warn!(%id, "history entry already finished, ignoring");
            return None;
        }
        record.end = Some(end);
        record.exit_code = outcome.exit_code();
        record.error = outcome.error().map(ToString::to_string);
        Some(record)
    }

    /// Remove a record, optionally deleting its log file as well. A log that
    /// is already gone is not an error.
    pub fn remove(&mut self, id: Uuid, delete_log: bool) -> Option<RunRecord> {
        let index = self.records.iter().position(|r| r.id == id)?;
        let record = self.records.remove(index);
        if delete_log {
            match std::fs::remove_file(&record.log_path) {
                Ok(()) => debug!(path = %record.log_path.display(), "deleted run log"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %record.log_path.display(), error = %e, "failed to delete run log"),
            }
        }
        Some(record)
    }

    /// Case-insensitive substring search over script path and arguments, in
    /// stored order. An empty query returns everything.
    pub fn search(&self, query: &str) -> Vec<&RunRecord> {
        let needle = query.to_lowercase();
        self.records.iter().filter(|r| r.matches(&needle)).collect()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
