//! Process runner: spawn an interpreter, stream classified output lines,
//! report exactly one terminal event.
//!
//! Only one run may be in flight per [`ProcessRunner`]. The slot is held
//! until the process has been reaped and its output drained, and is free by
//! the time [`RunEvent::Finished`] is delivered. Dropping the handle stops
//! the process; the slot follows once it is gone.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::{Classification, ClassificationPolicy, Stream};
use crate::error::{LaunchError, RunError, TerminationError};
use crate::interpreter::ResolvedCommand;
use crate::paths::absolutize;

const EVENT_BUFFER: usize = 1024;
const STDIN_BUFFER: usize = 64;
/// How long output pipes may stay open after the process itself exited.
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// One captured output line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub text: String,
    pub stream: Stream,
    pub classification: Classification,
    pub timestamp: DateTime<Local>,
}

impl LogLine {
    pub fn new(text: impl Into<String>, stream: Stream, policy: &ClassificationPolicy) -> Self {
        let text = text.into();
        let classification = policy.classify(&text, stream);
        Self {
            text,
            stream,
            classification,
            timestamp: Local::now(),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Exited { code: i32 },
    Terminated(TerminationError),
}

impl RunOutcome {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RunOutcome::Exited { code } => Some(*code),
            RunOutcome::Terminated(_) => None,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code() == Some(0)
    }

    pub fn error(&self) -> Option<&TerminationError> {
        match self {
            RunOutcome::Exited { .. } => None,
            RunOutcome::Terminated(err) => Some(err),
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Exited { code } => write!(f, "exited with code {}", code),
            RunOutcome::Terminated(err) => write!(f, "{}", err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Line(LogLine),
    Finished(RunOutcome),
}

/// Per-launch knobs.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Defaults to the script's directory.
    pub working_dir: Option<PathBuf>,
    /// Pipe the child's stdin so lines can be forwarded to it.
    pub stdin: bool,
}

/// Spawns runs one at a time.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    busy: Arc<AtomicBool>,
    policy: Arc<ClassificationPolicy>,
}

impl ProcessRunner {
    pub fn new(policy: ClassificationPolicy) -> Self {
        Self {
            busy: Arc::new(AtomicBool::new(false)),
            policy: Arc::new(policy),
        }
    }

    /// True while a run's terminal event has not been observed.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn start(
        &self,
        command: &ResolvedCommand,
        script: &Path,
        args: &[String],
    ) -> Result<RunHandle, RunError> {
        self.start_with(command, script, args, LaunchOptions::default())
    }

    /// Spawn `command.program command.args... script args...`.
    ///
    /// # Errors
    /// `RunError::AlreadyRunning` if another run is in flight, otherwise a
    /// `LaunchError` when the script or interpreter is missing or the spawn
    /// fails.
    pub fn start_with(
        &self,
        command: &ResolvedCommand,
        script: &Path,
        args: &[String],
        options: LaunchOptions,
    ) -> Result<RunHandle, RunError> {
        let slot = RunSlot::acquire(&self.busy).ok_or(RunError::AlreadyRunning)?;

        // The child runs in the script's directory, so a relative path would
        // no longer point at the script.
        let script = absolutize(script);
        let script = script.as_path();
        if !script.is_file() {
            return Err(LaunchError::ScriptNotFound {
                path: script.to_path_buf(),
            }
            .into());
        }
        let program = which::which(&command.program).map_err(|_| LaunchError::InterpreterNotFound {
            program: command.program.clone(),
        })?;

        let working_dir = options
            .working_dir
            .or_else(|| script.parent().map(Path::to_path_buf))
            .filter(|d| !d.as_os_str().is_empty());

        let mut cmd = Command::new(&program);
        cmd.args(&command.args)
            .arg(script)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if options.stdin { Stdio::piped() } else { Stdio::null() })
            .env("PYTHONUNBUFFERED", "1")
            .kill_on_drop(true);
        if let Some(dir) = &working_dir {
            cmd.current_dir(dir);
        }
        // Own process group so a stop request reaches the whole script tree.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: command.program.clone(),
            source,
        })?;
        let pid = child.id();
        info!(
            program = %program.display(),
            argv = ?command.argv(script, args),
            ?pid,
            "process started"
        );

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(stdout, Stream::Stdout, self.policy.clone(), tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(stderr, Stream::Stderr, self.policy.clone(), tx.clone())));
        }

        let stdin = child.stdin.take().map(|pipe| {
            let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_BUFFER);
            tokio::spawn(forward_stdin(pipe, stdin_rx));
            stdin_tx
        });

        tokio::spawn(supervise(child, readers, cancel.clone(), tx, slot));

        Ok(RunHandle {
            rx,
            cancel,
            stdin,
            pid,
            finished: false,
        })
    }
}

/// Live run. Yields `Line` events, then one `Finished`, then ends.
#[derive(Debug)]
pub struct RunHandle {
    rx: mpsc::Receiver<RunEvent>,
    cancel: CancellationToken,
    stdin: Option<mpsc::Sender<String>>,
    pid: Option<u32>,
    finished: bool,
}

impl RunHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// A cloneable handle that can request termination from elsewhere
    /// (e.g. a Ctrl-C listener).
    pub fn stopper(&self) -> StopHandle {
        StopHandle {
            cancel: self.cancel.clone(),
        }
    }

    /// Request termination. Completion is reported by the terminal event.
    pub fn stop(&self) {
        self.stopper().stop();
    }

    /// Sender for lines forwarded to the child's stdin, when the run was
    /// started with [`LaunchOptions::stdin`]. A newline is appended to each.
    pub fn stdin(&self) -> Option<mpsc::Sender<String>> {
        self.stdin.clone()
    }

    fn observe_finish(&mut self) {
        self.finished = true;
        self.stdin = None;
    }
}

impl futures::Stream for RunHandle {
    type Item = RunEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<RunEvent>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if matches!(event, RunEvent::Finished(_)) {
                    self.observe_finish();
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                // Supervisor went away without reporting (it panicked).
                self.observe_finish();
                Poll::Ready(Some(RunEvent::Finished(RunOutcome::Terminated(
                    TerminationError::Wait("event channel closed".to_string()),
                ))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        if !self.finished {
            debug!(pid = ?self.pid, "run handle dropped before finish, stopping process");
            self.cancel.cancel();
        }
    }
}

/// Requests termination of a run.
#[derive(Debug, Clone)]
pub struct StopHandle {
    cancel: CancellationToken,
}

impl StopHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

#[derive(Debug)]
struct RunSlot {
    busy: Arc<AtomicBool>,
    held: bool,
}

impl RunSlot {
    fn acquire(busy: &Arc<AtomicBool>) -> Option<Self> {
        busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                busy: busy.clone(),
                held: true,
            })
    }

    fn release(&mut self) {
        if self.held {
            self.busy.store(false, Ordering::Release);
            self.held = false;
        }
    }
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        self.release();
    }
}

async fn pump<R>(reader: R, stream: Stream, policy: Arc<ClassificationPolicy>, tx: mpsc::Sender<RunEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = LogLine::new(decode_line(&buf), stream, &policy);
                if tx.send(RunEvent::Line(line)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(?stream, error = %e, "failed to read process output");
                break;
            }
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

async fn forward_stdin(mut pipe: ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = pipe.write_all(line.as_bytes()).await {
            debug!(error = %e, "child stdin closed");
            break;
        }
        if pipe.flush().await.is_err() {
            break;
        }
    }
}

async fn supervise(
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    tx: mpsc::Sender<RunEvent>,
    mut slot: RunSlot,
) {
    let pid = child.id();
    let mut stopped = false;
    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => {
            stopped = true;
            request_termination(&mut child);
            child.wait().await
        }
    };

    // Every line must be delivered before the terminal event.
    drain_output(readers, pid, &cancel, stopped).await;

    let outcome = match status {
        Ok(status) => outcome_from_status(status, stopped),
        Err(e) => RunOutcome::Terminated(TerminationError::Wait(e.to_string())),
    };
    info!(?pid, %outcome, "process finished");
    slot.release();
    let _ = tx.send(RunEvent::Finished(outcome)).await;
}

/// Wait for both readers to reach EOF. Descendants that inherited the pipes
/// can keep them open after the process exited: a stop request signals the
/// process group again, and after [`OUTPUT_GRACE`] the readers are abandoned.
async fn drain_output(readers: Vec<JoinHandle<()>>, pid: Option<u32>, cancel: &CancellationToken, stopped: bool) {
    let aborts: Vec<AbortHandle> = readers.iter().map(JoinHandle::abort_handle).collect();
    let all = futures::future::join_all(readers);
    tokio::pin!(all);

    let drained = tokio::select! {
        _ = &mut all => true,
        _ = cancel.cancelled(), if !stopped => {
            if let Some(pid) = pid {
                signal_group(pid);
            }
            tokio::time::timeout(OUTPUT_GRACE, all.as_mut()).await.is_ok()
        }
        _ = tokio::time::sleep(OUTPUT_GRACE) => false,
    };
    if !drained {
        warn!(?pid, "output still open after the process exited, detaching");
        for abort in aborts {
            abort.abort();
        }
    }
}

fn outcome_from_status(status: ExitStatus, stopped: bool) -> RunOutcome {
    let signal = exit_signal(&status);
    if stopped {
        return RunOutcome::Terminated(TerminationError::Stopped { signal });
    }
    match (status.code(), signal) {
        (Some(code), _) => RunOutcome::Exited { code },
        (None, Some(signal)) => RunOutcome::Terminated(TerminationError::Signaled { signal }),
        (None, None) => RunOutcome::Terminated(TerminationError::Wait(format!("unexpected status {}", status))),
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    if let Some(pid) = child.id() {
        signal_group(pid);
    }
}

/// The child leads its own process group (see `process_group(0)`), so this
/// reaches everything it started.
#[cfg(unix)]
fn signal_group(pid: u32) {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGTERM) };
    if rc != 0 {
        warn!(pid, error = %std::io::Error::last_os_error(), "failed to send SIGTERM");
    } else {
        info!(pid, "sent SIGTERM");
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "failed to terminate process");
    }
}

#[cfg(not(unix))]
fn signal_group(pid: u32) {
    debug!(pid, "process already exited, nothing left to signal");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn sh() -> ResolvedCommand {
        ResolvedCommand::new("sh", Vec::new())
    }

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    async fn wait_until_idle(runner: &ProcessRunner) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while runner.is_busy() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("slot should be released");
    }

    async fn collect(mut handle: RunHandle) -> (Vec<LogLine>, RunOutcome) {
        let mut lines = Vec::new();
        while let Some(event) = handle.next().await {
            match event {
                RunEvent::Line(line) => lines.push(line),
                RunEvent::Finished(outcome) => {
                    assert!(handle.next().await.is_none(), "stream must end after Finished");
                    return (lines, outcome);
                }
            }
        }
        panic!("stream ended without a terminal event");
    }

    #[test]
    fn test_decode_line_strips_line_endings() {
        assert_eq!(decode_line(b"hello\r\n"), "hello");
        assert_eq!(decode_line(b"hello\n"), "hello");
        assert_eq!(decode_line(b"partial"), "partial");
        assert_eq!(decode_line(b"bad \xff byte\n"), "bad \u{fffd} byte");
    }

    #[tokio::test]
    async fn test_echo_hello() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "hello.sh", "echo hello\n");
        let runner = ProcessRunner::default();

        let handle = runner.start(&sh(), &path, &[]).unwrap();
        let (lines, outcome) = collect(handle).await;

        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "hello");
        assert_eq!(lines[0].classification, Classification::Plain);
        assert_eq!(lines[0].stream, Stream::Stdout);
        assert_eq!(outcome, RunOutcome::Exited { code: 0 });
        assert!(!runner.is_busy());
    }

    #[tokio::test]
    async fn test_stderr_line_is_error_and_exit_code_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "fail.sh", "echo 'ERROR: disk full' >&2\nexit 3\n");
        let runner = ProcessRunner::default();

        let (lines, outcome) = collect(runner.start(&sh(), &path, &[]).unwrap()).await;

        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].stream, Stream::Stderr);
        assert_eq!(lines[0].classification, Classification::Error);
        assert_eq!(outcome.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn test_args_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "args.sh", "for a in \"$@\"; do echo \"$a\"; done\nbasename \"$PWD\"\nprintf 'tail'\n");
        let runner = ProcessRunner::default();
        let args = vec!["one".to_string(), "two words".to_string()];

        let (lines, outcome) = collect(runner.start(&sh(), &path, &args).unwrap()).await;
        let texts: Vec<_> = lines.iter().map(|l| l.text.as_str()).collect();
        let dir_name = dir.path().file_name().unwrap().to_string_lossy().to_string();

        assert_eq!(texts, vec!["one", "two words", dir_name.as_str(), "tail"]);
        assert!(outcome.success());
    }

    #[tokio::test]
    async fn test_second_start_rejected_while_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let slow = script(dir.path(), "slow.sh", "sleep 1\necho done\n");
        let quick = script(dir.path(), "quick.sh", "echo quick\n");
        let runner = ProcessRunner::default();

        let first = runner.start(&sh(), &slow, &[]).unwrap();
        let err = runner.start(&sh(), &quick, &[]).unwrap_err();
        assert!(matches!(err, RunError::AlreadyRunning));

        let (lines, outcome) = collect(first).await;
        assert_eq!(lines.last().map(|l| l.text.as_str()), Some("done"));
        assert_eq!(outcome, RunOutcome::Exited { code: 0 });

        // Slot is free again once the terminal event was observed.
        let (lines, _) = collect(runner.start(&sh(), &quick, &[]).unwrap()).await;
        assert_eq!(lines[0].text, "quick");
    }

    #[tokio::test]
    async fn test_stop_terminates_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "sleepy.sh", "echo started\nsleep 30\necho never\n");
        let runner = ProcessRunner::default();

        let mut handle = runner.start(&sh(), &path, &[]).unwrap();
        match handle.next().await {
            Some(RunEvent::Line(line)) => assert_eq!(line.text, "started"),
            other => panic!("unexpected event {:?}", other),
        }
        handle.stop();

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(10), collect(handle))
            .await
            .expect("stop should end the run")
            .1;
        assert_eq!(
            outcome,
            RunOutcome::Terminated(TerminationError::Stopped { signal: Some(libc::SIGTERM) })
        );
    }

    #[tokio::test]
    async fn test_missing_script_and_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::default();

        let err = runner.start(&sh(), &dir.path().join("nope.sh"), &[]).unwrap_err();
        assert!(matches!(err, RunError::Launch(LaunchError::ScriptNotFound { .. })));
        assert!(!runner.is_busy());

        let path = script(dir.path(), "ok.sh", "echo ok\n");
        let bogus = ResolvedCommand::new("definitely-not-an-interpreter-xyz", Vec::new());
        let err = runner.start(&bogus, &path, &[]).unwrap_err();
        assert!(matches!(err, RunError::Launch(LaunchError::InterpreterNotFound { .. })));
        assert!(!runner.is_busy());
    }

    #[tokio::test]
    async fn test_stdin_forwarding() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "echoer.sh", "read name\necho \"hi $name\"\n");
        let runner = ProcessRunner::default();
        let options = LaunchOptions {
            stdin: true,
            ..LaunchOptions::default()
        };

        let handle = runner.start_with(&sh(), &path, &[], options).unwrap();
        handle.stdin().unwrap().send("ada".to_string()).await.unwrap();
        let (lines, outcome) = collect(handle).await;

        assert_eq!(lines[0].text, "hi ada");
        assert!(outcome.success());
    }

    #[tokio::test]
    async fn test_dropped_handle_holds_slot_until_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "sleepy.sh", "sleep 30\n");
        let runner = ProcessRunner::default();

        let handle = runner.start(&sh(), &path, &[]).unwrap();
        assert!(runner.is_busy());
        drop(handle);
        // Still held until the stopped process has been reaped.
        assert!(matches!(runner.start(&sh(), &path, &[]), Err(RunError::AlreadyRunning)));

        wait_until_idle(&runner).await;
        let (_, outcome) = collect(runner.start(&sh(), &script(dir.path(), "ok.sh", "echo ok\n"), &[]).unwrap()).await;
        assert!(outcome.success());
    }

    #[tokio::test]
    async fn test_relative_script_path() {
        let dir = tempfile::Builder::new().tempdir_in(".").unwrap();
        script(dir.path(), "rel.sh", "echo ok\nbasename \"$PWD\"\n");
        let rel = dir.path().strip_prefix(std::env::current_dir().unwrap()).unwrap_or(dir.path()).join("rel.sh");
        assert!(rel.is_relative());
        let runner = ProcessRunner::default();

        let (lines, outcome) = collect(runner.start(&sh(), &rel, &[]).unwrap()).await;
        let texts: Vec<_> = lines.iter().map(|l| l.text.as_str()).collect();
        let dir_name = dir.path().file_name().unwrap().to_string_lossy().to_string();

        assert_eq!(texts, vec!["ok", dir_name.as_str()]);
        assert_eq!(outcome, RunOutcome::Exited { code: 0 });
    }

    #[tokio::test]
    async fn test_background_child_does_not_hold_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "bg.sh", "sleep 8 &\necho done\nexit 0\n");
        let runner = ProcessRunner::default();

        let handle = runner.start(&sh(), &path, &[]).unwrap();
        let (lines, outcome) = tokio::time::timeout(Duration::from_secs(6), collect(handle))
            .await
            .expect("run should finish once the script exits");
        assert_eq!(lines[0].text, "done");
        assert_eq!(outcome, RunOutcome::Exited { code: 0 });
        assert!(!runner.is_busy());
    }

    #[tokio::test]
    async fn test_stop_reaches_background_child_after_exit() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "bg.sh", "sleep 8 &\necho done\nexit 0\n");
        let runner = ProcessRunner::default();

        let mut handle = runner.start(&sh(), &path, &[]).unwrap();
        match handle.next().await {
            Some(RunEvent::Line(line)) => assert_eq!(line.text, "done"),
            other => panic!("unexpected event {:?}", other),
        }
        let started = std::time::Instant::now();
        handle.stop();

        tokio::time::timeout(Duration::from_secs(6), collect(handle))
            .await
            .expect("stop should end the run");
        assert!(started.elapsed() < OUTPUT_GRACE);
        assert!(!runner.is_busy());
    }
}
