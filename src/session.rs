//! Application state: config, history, runner and log writer behind one
//! owner, plus the event surface a front end listens to.
//!
//! Every mutation of config or history rewrites the config file. A failed
//! save is reported (returned error and [`AppEvent::Notice`]) but the
//! in-memory state stays valid for the rest of the session.

use std::path::{Path, PathBuf};

use chrono::{Local, Utc};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{Config, ConfigStore, Theme};
use crate::error::{LaunchError, PersistenceError, RunError, SessionError, TerminationError};
use crate::history::{History, RunRecord};
use crate::interpreter::{self, Interpreter, InterpreterProfile, ResolvedCommand};
use crate::logwriter::{LogHandle, LogWriter};
use crate::paths::{absolutize, AppPaths};
use crate::runner::{LaunchOptions, LogLine, ProcessRunner, RunEvent, RunHandle, RunOutcome, StopHandle};

/// What a front end is told about.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    RunStarted(RunRecord),
    LineReceived(LogLine),
    RunFinished(RunRecord),
    HistoryChanged,
    ConfigChanged,
    /// Something the user should see that did not stop the operation.
    Notice(String),
}

/// A request to run a script.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub script: PathBuf,
    pub args: Vec<String>,
    pub interpreter: Option<Interpreter>,
    pub profile: Option<String>,
    /// Bypass resolution entirely (used by rerun).
    pub command: Option<ResolvedCommand>,
    pub stdin: bool,
}

impl RunRequest {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            ..Self::default()
        }
    }

    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn interpreter(mut self, interpreter: Interpreter) -> Self {
        self.interpreter = Some(interpreter);
        self
    }

    pub fn profile(mut self, name: impl Into<String>) -> Self {
        self.profile = Some(name.into());
        self
    }

    pub fn command(mut self, command: ResolvedCommand) -> Self {
        self.command = Some(command);
        self
    }

    pub fn stdin(mut self, enabled: bool) -> Self {
        self.stdin = enabled;
        self
    }
}

/// A started run: its history record, the live process and its log.
#[derive(Debug)]
pub struct ActiveRun {
    record: RunRecord,
    handle: RunHandle,
    log: LogHandle,
}

impl ActiveRun {
    pub fn record(&self) -> &RunRecord {
        &self.record
    }

    pub fn stopper(&self) -> StopHandle {
        self.handle.stopper()
    }

    pub fn stdin(&self) -> Option<mpsc::Sender<String>> {
        self.handle.stdin()
    }
}

pub struct Session {
    paths: AppPaths,
    store: ConfigStore,
    config: Config,
    runner: ProcessRunner,
    logs: LogWriter,
    events: Option<mpsc::UnboundedSender<AppEvent>>,
}

impl Session {
    /// Load the config under `paths` (defaults if missing or malformed).
    pub fn open(paths: AppPaths) -> Self {
        if let Err(e) = paths.ensure() {
            warn!(root = %paths.root().display(), error = %e, "failed to create application directory");
        }
        let store = ConfigStore::new(paths.config_file());
        let config = store.load();
        let runner = ProcessRunner::new(config.classification.clone());
        let logs = LogWriter::new(paths.log_dir());
        Self {
            paths,
            store,
            config,
            runner,
            logs,
            events: None,
        }
    }

    /// Start receiving [`AppEvent`]s. Replaces any previous subscriber.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<AppEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    /// Drop the subscriber so its receiver drains and ends.
    pub fn unsubscribe(&mut self) {
        self.events = None;
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn history(&self) -> &History {
        &self.config.history
    }

    pub fn is_running(&self) -> bool {
        self.runner.is_busy()
    }

    fn emit(&self, event: AppEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn persist(&self) -> Result<(), PersistenceError> {
        self.store.save(&self.config).map_err(|e| {
            warn!(error = %e, "failed to save config");
            self.emit(AppEvent::Notice(format!("could not save settings: {}", e)));
            e
        })
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Decide which command runs `req.script`: explicit command, named
    /// profile, explicit interpreter, active profile, a profile registered
    /// for the script's extension, then detection.
    pub fn resolve(&self, req: &RunRequest) -> Result<ResolvedCommand, LaunchError> {
        if let Some(command) = &req.command {
            return Ok(command.clone());
        }
        if let Some(name) = &req.profile {
            let profile = self
                .config
                .profile(name)
                .ok_or_else(|| LaunchError::UnknownProfile { name: name.clone() })?;
            if !profile.command.is_empty() {
                return Ok(profile.command());
            }
        }
        if let Some(kind) = req.interpreter {
            return Ok(self.interpreter_command(kind, &req.script));
        }
        if let Some(name) = &self.config.active_profile {
            match self.config.profile(name) {
                Some(profile) if applies_to(profile, &req.script) => return Ok(profile.command()),
                Some(_) => {}
                None => warn!(profile = %name, "active profile no longer exists"),
            }
        }
        if let Some(profile) = self
            .config
            .profiles
            .iter()
            .find(|p| !p.command.is_empty() && p.matches_script(&req.script))
        {
            return Ok(profile.command());
        }
        interpreter::detect(&req.script)
            .map(|kind| self.interpreter_command(kind, &req.script))
            .ok_or_else(|| LaunchError::UnknownInterpreter {
                path: req.script.clone(),
            })
    }

    fn interpreter_command(&self, kind: Interpreter, script: &Path) -> ResolvedCommand {
        match kind {
            Interpreter::Python => interpreter::resolve_python(script, self.config.fallback_python.as_deref()),
            other => other.default_command(),
        }
    }

    /// Launch a run: open its log, spawn the process, record it in history.
    ///
    /// # Errors
    /// `AlreadyRunning` while another run is in flight; a `LaunchError` if
    /// nothing could be started. Neither leaves a history entry behind.
    pub fn start(&mut self, mut req: RunRequest) -> Result<ActiveRun, SessionError> {
        if self.runner.is_busy() {
            return Err(RunError::AlreadyRunning.into());
        }
        // Recorded and spawned as an absolute path.
        req.script = absolutize(&req.script);
        if !req.script.is_file() {
            return Err(LaunchError::ScriptNotFound {
                path: req.script.clone(),
            }
            .into());
        }
        let command = self.resolve(&req)?;

        let started = Local::now();
        let log = self.logs.open(started, &req.script).map_err(LaunchError::from)?;
        let options = LaunchOptions {
            working_dir: None,
            stdin: req.stdin,
        };
        let handle = match self.runner.start_with(&command, &req.script, &req.args, options) {
            Ok(handle) => handle,
            Err(e) => {
                let path = log.path().to_path_buf();
                drop(log);
                let _ = std::fs::remove_file(&path);
                warn!(script = %req.script.display(), error = %e, "launch failed");
                return Err(e.into());
            }
        };

        let record = self.config.history.record_start(
            &req.script,
            &command,
            &req.args,
            log.path(),
            started.with_timezone(&Utc),
            self.config.history_limit,
        );
        self.config.remember_arguments(&req.args);
        info!(run_id = %record.id, script = %record.script.display(), command = %command, "run started");
        let _ = self.persist();
        self.emit(AppEvent::RunStarted(record.clone()));
        self.emit(AppEvent::HistoryChanged);

        Ok(ActiveRun { record, handle, log })
    }

    /// Drive a run to completion: log and forward every line, then record
    /// the outcome.
    pub async fn finish(&mut self, run: ActiveRun) -> RunRecord {
        let ActiveRun {
            record,
            mut handle,
            mut log,
        } = run;

        let mut outcome = None;
        let mut log_failed = false;
        while let Some(event) = handle.next().await {
            match event {
                RunEvent::Line(line) => {
                    if let Err(e) = log.append(&line) {
                        if !log_failed {
                            warn!(run_id = %record.id, error = %e, "failed to write run log");
                            self.emit(AppEvent::Notice(format!("log is incomplete: {}", e)));
                            log_failed = true;
                        }
                    }
                    self.emit(AppEvent::LineReceived(line));
                }
                RunEvent::Finished(result) => outcome = Some(result),
            }
        }
        log.close();

        let outcome = outcome.unwrap_or_else(|| {
            RunOutcome::Terminated(TerminationError::Wait("run ended without a status".to_string()))
        });
        let ended = Utc::now();
        let finished = match self.config.history.record_end(record.id, &outcome, ended) {
            Some(updated) => updated.clone(),
            None => RunRecord {
                end: Some(ended),
                exit_code: outcome.exit_code(),
                error: outcome.error().map(ToString::to_string),
                ..record
            },
        };
        info!(run_id = %finished.id, %outcome, lines = log.lines(), "run finished");
        let _ = self.persist();
        self.emit(AppEvent::RunFinished(finished.clone()));
        self.emit(AppEvent::HistoryChanged);
        finished
    }

    /// Start and finish a run.
    pub async fn run(&mut self, req: RunRequest) -> Result<RunRecord, SessionError> {
        let active = self.start(req)?;
        Ok(self.finish(active).await)
    }

    /// Request for repeating a recorded run with the same command and
    /// arguments.
    pub fn rerun_request(&self, id: Uuid) -> Result<RunRequest, SessionError> {
        let record = self.config.history.get(id).ok_or(SessionError::UnknownRun(id))?;
        Ok(RunRequest::new(&record.script)
            .args(record.args.clone())
            .command(record.command()))
    }

    pub async fn rerun(&mut self, id: Uuid) -> Result<RunRecord, SessionError> {
        let req = self.rerun_request(id)?;
        self.run(req).await
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    pub fn remove_history(&mut self, id: Uuid, delete_log: bool) -> Result<RunRecord, SessionError> {
        let removed = self
            .config
            .history
            .remove(id, delete_log)
            .ok_or(SessionError::UnknownRun(id))?;
        self.emit(AppEvent::HistoryChanged);
        self.persist()?;
        Ok(removed)
    }

    /// Drop every history entry. Returns how many were removed.
    pub fn clear_history(&mut self) -> Result<usize, SessionError> {
        let count = self.config.history.len();
        self.config.history.clear();
        self.emit(AppEvent::HistoryChanged);
        self.persist()?;
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    /// Add or replace a profile by name. A blank name becomes "Custom".
    pub fn upsert_profile(&mut self, mut profile: InterpreterProfile) -> Result<(), SessionError> {
        if profile.name.trim().is_empty() {
            profile.name = "Custom".to_string();
        }
        self.config.upsert_profile(profile);
        self.emit(AppEvent::ConfigChanged);
        self.persist()?;
        Ok(())
    }

    pub fn remove_profile(&mut self, name: &str) -> Result<Option<InterpreterProfile>, SessionError> {
        let removed = self.config.remove_profile(name);
        if removed.is_some() {
            self.emit(AppEvent::ConfigChanged);
            self.persist()?;
        }
        Ok(removed)
    }

    /// Select (or with `None`, clear) the default profile.
    pub fn set_active_profile(&mut self, name: Option<&str>) -> Result<(), SessionError> {
        if let Some(name) = name {
            if self.config.profile(name).is_none() {
                return Err(LaunchError::UnknownProfile {
                    name: name.to_string(),
                }
                .into());
            }
        }
        self.config.active_profile = name.map(str::to_string);
        self.emit(AppEvent::ConfigChanged);
        self.persist()?;
        Ok(())
    }

    pub fn set_theme(&mut self, theme: &str) -> Result<Theme, SessionError> {
        let theme: Theme = theme
            .parse()
            .map_err(SessionError::UnknownTheme)?;
        self.config.theme = theme;
        self.emit(AppEvent::ConfigChanged);
        self.persist()?;
        Ok(theme)
    }
}

/// An active profile applies unless it is tied to a different extension.
fn applies_to(profile: &InterpreterProfile, script: &Path) -> bool {
    !profile.command.is_empty() && (profile.extension.is_none() || profile.matches_script(script))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn session() -> (tempfile::TempDir, Session) {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::open(AppPaths::at(dir.path().join("home")));
        (dir, session)
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_resolution_order() {
        let (dir, mut session) = session();
        let script = write_script(dir.path(), "job.py", "print(1)\n");

        let py = InterpreterProfile {
            name: "py-venv".to_string(),
            command: "/opt/venv/bin/python".to_string(),
            args: vec!["-u".to_string()],
            extension: Some("py".to_string()),
        };
        let node = InterpreterProfile {
            name: "node".to_string(),
            command: "node".to_string(),
            args: vec![],
            extension: Some(".js".to_string()),
        };
        session.upsert_profile(py.clone()).unwrap();
        session.upsert_profile(node.clone()).unwrap();

        // Extension-bound profile beats detection.
        assert_eq!(session.resolve(&RunRequest::new(&script)).unwrap(), py.command());
        // Explicit interpreter beats profiles.
        let bash = session.resolve(&RunRequest::new(&script).interpreter(Interpreter::Bash)).unwrap();
        assert_eq!(bash.program, "bash");
        // Explicit profile beats everything but an explicit command.
        let named = session.resolve(&RunRequest::new(&script).profile("node")).unwrap();
        assert_eq!(named, node.command());
        // An active profile tied to another extension does not apply.
        session.set_active_profile(Some("node")).unwrap();
        assert_eq!(session.resolve(&RunRequest::new(&script)).unwrap(), py.command());

        let err = session.resolve(&RunRequest::new(&script).profile("ghost")).unwrap_err();
        assert!(matches!(err, LaunchError::UnknownProfile { .. }));

        let unknown = write_script(dir.path(), "notes.txt", "hello\n");
        assert!(matches!(
            session.resolve(&RunRequest::new(&unknown)),
            Err(LaunchError::UnknownInterpreter { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_records_history_and_log() {
        let (dir, mut session) = session();
        let script = write_script(dir.path(), "hello.sh", "echo hello\necho 'warn: low' \necho oops >&2\n");
        let mut events = session.subscribe();

        let record = session
            .run(RunRequest::new(&script).interpreter(Interpreter::Bash).args(vec!["--x".to_string()]))
            .await
            .unwrap();

        assert_eq!(record.exit_code, Some(0));
        assert!(record.end.is_some());
        assert_eq!(record.args, vec!["--x"]);
        let log = std::fs::read_to_string(&record.log_path).unwrap();
        assert_eq!(log.lines().count(), 3);
        assert!(log.lines().any(|l| l.ends_with("plain hello")));
        assert!(log.contains("warning warn: low"));
        assert!(log.contains("error oops"));

        session.unsubscribe();
        let mut lines = 0;
        let mut saw_started = false;
        let mut saw_finished = false;
        while let Some(event) = events.recv().await {
            match event {
                AppEvent::RunStarted(r) => saw_started = r.id == record.id,
                AppEvent::LineReceived(_) => lines += 1,
                AppEvent::RunFinished(r) => saw_finished = r == record,
                _ => {}
            }
        }
        assert!(saw_started && saw_finished);
        assert_eq!(lines, 3);

        // Persisted and reloadable.
        let reopened = Session::open(session.paths().clone());
        assert_eq!(reopened.history().get(record.id), Some(&record));
        assert_eq!(reopened.config().argument_suggestions, vec!["--x"]);
    }

    #[tokio::test]
    async fn test_launch_failure_leaves_no_trace() {
        let (dir, mut session) = session();
        let script = write_script(dir.path(), "a.sh", "echo a\n");
        let bogus = ResolvedCommand::new("no-such-interpreter-zz", Vec::new());

        let err = session.start(RunRequest::new(&script).command(bogus)).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Run(RunError::Launch(LaunchError::InterpreterNotFound { .. }))
        ));
        assert!(session.history().is_empty());
        assert!(crate::logwriter::list_logs(&session.paths().log_dir()).is_empty());

        let err = session.start(RunRequest::new(dir.path().join("missing.sh"))).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Run(RunError::Launch(LaunchError::ScriptNotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_second_start_rejected() {
        let (dir, mut session) = session();
        let slow = write_script(dir.path(), "slow.sh", "sleep 1\n");
        let quick = write_script(dir.path(), "quick.sh", "echo hi\n");

        let active = session.start(RunRequest::new(&slow).interpreter(Interpreter::Bash)).unwrap();
        let err = session.start(RunRequest::new(&quick).interpreter(Interpreter::Bash)).unwrap_err();
        assert!(matches!(err, SessionError::Run(RunError::AlreadyRunning)));
        assert_eq!(session.history().len(), 1);

        let record = session.finish(active).await;
        assert_eq!(record.exit_code, Some(0));
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_rerun_and_remove() {
        let (dir, mut session) = session();
        let script = write_script(dir.path(), "args.sh", "echo \"$1\"\n");
        let first = session
            .run(RunRequest::new(&script).interpreter(Interpreter::Bash).args(vec!["again".to_string()]))
            .await
            .unwrap();

        let second = session.rerun(first.id).await.unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(second.interpreter, first.interpreter);
        assert_eq!(second.args, first.args);
        assert_ne!(second.log_path, first.log_path);
        assert_eq!(std::fs::read_to_string(&second.log_path).unwrap().lines().count(), 1);

        let removed = session.remove_history(first.id, true).unwrap();
        assert!(!removed.log_path.exists());
        assert_eq!(session.history().len(), 1);
        assert!(matches!(
            session.remove_history(first.id, false),
            Err(SessionError::UnknownRun(_))
        ));
        assert_eq!(session.clear_history().unwrap(), 1);
        assert!(matches!(session.rerun(first.id).await, Err(SessionError::UnknownRun(_))));
    }

    #[test]
    fn test_theme_and_active_profile_validation() {
        let (_dir, mut session) = session();
        assert_eq!(session.set_theme("Light").unwrap(), Theme::Light);
        assert!(matches!(session.set_theme("neon"), Err(SessionError::UnknownTheme(_))));
        assert!(session.set_active_profile(Some("ghost")).is_err());

        let reopened = Session::open(session.paths().clone());
        assert_eq!(reopened.config().theme, Theme::Light);
    }
}
