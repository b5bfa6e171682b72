//! Error taxonomy shared by the runner, the stores and the session.

use std::path::PathBuf;

use thiserror::Error;

/// The run never started.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("script not found: {}", path.display())]
    ScriptNotFound { path: PathBuf },

    #[error("interpreter '{program}' not found (is it installed and on PATH?)")]
    InterpreterNotFound { program: String },

    #[error("no interpreter configured for {}; pass --interpreter or --profile", path.display())]
    UnknownInterpreter { path: PathBuf },

    #[error("interpreter profile '{name}' does not exist")]
    UnknownProfile { name: String },

    #[error("failed to open log file: {0}")]
    Log(#[from] PersistenceError),

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Why `ProcessRunner::start` refused to start a run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("a script is already running; stop it first")]
    AlreadyRunning,
}

/// The process ended without producing an exit code of its own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TerminationError {
    #[error("stopped by user")]
    Stopped { signal: Option<i32> },

    #[error("killed by signal {signal}")]
    Signaled { signal: i32 },

    #[error("lost track of the process: {0}")]
    Wait(String),
}

/// Config or log I/O failed. In-memory state is still usable.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("log file {} is already closed", path.display())]
    Closed { path: PathBuf },
}

impl PersistenceError {
    pub(crate) fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }
}

/// An existing config file could not be parsed. Recovered inside the
/// config store by falling back to defaults.
#[derive(Debug, Error)]
#[error("malformed config at {}: {source}", path.display())]
pub(crate) struct MalformedConfigError {
    pub path: PathBuf,
    #[source]
    pub source: serde_json::Error,
}

/// Everything a session operation can report back to the front end.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("no history entry with id {0}")]
    UnknownRun(uuid::Uuid),

    #[error("unknown theme '{0}' (expected 'dark' or 'light')")]
    UnknownTheme(String),
}

impl From<LaunchError> for SessionError {
    fn from(err: LaunchError) -> Self {
        Self::Run(RunError::Launch(err))
    }
}
