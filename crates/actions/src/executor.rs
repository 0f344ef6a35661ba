//! Runs custom quick actions as child processes.
//!
//! Each run gets a supervisor task that forwards output lines and races the
//! process against its cancel signal and deadline. Stopping escalates
//! terminate to kill after a grace window. At most one run per action key is
//! live at a time.

use crate::template::render_command;
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use touchdeck_core::{CustomQuickAction, MediaState};
use tracing::{debug, info, warn};

const TERMINATE_GRACE: Duration = Duration::from_secs(2);
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

#[cfg(unix)]
const DEFAULT_SHELL: &str = "sh";
#[cfg(not(unix))]
const DEFAULT_SHELL: &str = "cmd";

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("action `{0}` has an empty command")]
    EmptyCommand(String),
    #[error("failed to start `{key}`: {source}")]
    Spawn {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// How a run ended. At most one of `timed_out` and `canceled` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub canceled: bool,
    pub last_line: String,
}

impl ExecOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && !self.canceled && self.exit_code == Some(0)
    }

    pub fn label(&self) -> &'static str {
        if self.timed_out {
            "timed_out"
        } else if self.canceled {
            "canceled"
        } else if self.succeeded() {
            "succeeded"
        } else {
            "failed"
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Output {
        key: String,
        line: String,
    },
    Finished {
        key: String,
        title: String,
        outcome: ExecOutcome,
    },
}

/// Handle to a live run. Dropping it does not stop the process.
#[derive(Debug, Clone)]
pub struct RunHandle {
    key: String,
    cancel: Arc<Notify>,
}

impl RunHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn cancel(&self) {
        self.cancel.notify_one();
    }
}

type RunningMap = Arc<Mutex<HashMap<String, Arc<Notify>>>>;

fn lock(running: &RunningMap) -> MutexGuard<'_, HashMap<String, Arc<Notify>>> {
    running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct CommandExecutor {
    shell: String,
    running: RunningMap,
    events: mpsc::UnboundedSender<ExecEvent>,
}

impl CommandExecutor {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExecEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                shell: DEFAULT_SHELL.to_string(),
                running: Arc::new(Mutex::new(HashMap::new())),
                events,
            },
            rx,
        )
    }

    /// Uses `program` instead of the platform shell to interpret commands.
    pub fn with_shell(mut self, program: impl Into<String>) -> Self {
        self.shell = program.into();
        self
    }

    /// Starts `action` against `state`. Returns `Ok(None)` when the same key
    /// is already running. Must be called inside a tokio runtime.
    pub fn run(
        &self,
        action: &CustomQuickAction,
        state: &MediaState,
    ) -> Result<Option<RunHandle>, ExecutorError> {
        let command = render_command(&action.command, state);
        if command.trim().is_empty() {
            return Err(ExecutorError::EmptyCommand(action.key.clone()));
        }

        let mut running = lock(&self.running);
        if running.contains_key(&action.key) {
            debug!(key = %action.key, "action already running; ignoring trigger");
            return Ok(None);
        }

        let mut child = match shell_command(&self.shell, &command).spawn() {
            Ok(child) => child,
            Err(source) => {
                warn!(key = %action.key, title = %action.title, outcome = "failed", error = %source, "action could not start");
                return Err(ExecutorError::Spawn {
                    key: action.key.clone(),
                    source,
                });
            }
        };

        let cancel = Arc::new(Notify::new());
        running.insert(action.key.clone(), cancel.clone());
        drop(running);

        info!(key = %action.key, pid = ?child.id(), timeout_ms = action.timeout_ms, "action started");

        let output = OutputLines::attach(&mut child);
        let run = Supervised {
            key: action.key.clone(),
            title: action.title.clone(),
            timeout: Duration::from_millis(action.timeout_ms.max(1)),
            cancel: cancel.clone(),
            running: self.running.clone(),
            events: self.events.clone(),
        };
        tokio::spawn(run.supervise(child, output));

        Ok(Some(RunHandle {
            key: action.key.clone(),
            cancel,
        }))
    }

    /// Requests a cooperative stop. Returns false when nothing was running.
    pub fn cancel(&self, key: &str) -> bool {
        match lock(&self.running).get(key) {
            Some(signal) => {
                signal.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, key: &str) -> bool {
        lock(&self.running).contains_key(key)
    }

    pub fn running_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = lock(&self.running).keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(unix)]
fn shell_command(shell: &str, command: &str) -> Command {
    let mut cmd = Command::new(shell);
    cmd.arg("-c").arg(command);
    // Own process group so terminate reaches the whole pipeline.
    cmd.process_group(0);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

#[cfg(not(unix))]
fn shell_command(shell: &str, command: &str) -> Command {
    let mut cmd = Command::new(shell);
    cmd.arg("/C").arg(command);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Merged stdout and stderr lines, read by one task per stream.
struct OutputLines {
    rx: mpsc::UnboundedReceiver<String>,
    readers: Vec<JoinHandle<()>>,
}

impl OutputLines {
    fn attach(child: &mut Child) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(forward_lines(out, tx.clone()));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(forward_lines(err, tx));
        }
        Self { rx, readers }
    }
}

impl Drop for OutputLines {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

fn forward_lines<R>(stream: R, tx: mpsc::UnboundedSender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    })
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    // Negative pid targets the process group created in `shell_command`.
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGTERM) };
    if rc != 0 {
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn force_kill(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: as in `terminate`.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn force_kill(child: &mut Child) {
    let _ = child.start_kill();
}

/// Terminate, wait out the grace window, then kill.
async fn stop(child: &mut Child) -> Option<ExitStatus> {
    terminate(child);
    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(status)) => return Some(status),
        Ok(Err(err)) => debug!(error = %err, "wait after terminate failed"),
        Err(_) => debug!("grace window elapsed; killing"),
    }
    force_kill(child);
    child.wait().await.ok()
}

enum StopReason {
    Exited(ExitStatus),
    Lost(std::io::Error),
    Canceled,
    TimedOut,
}

struct Supervised {
    key: String,
    title: String,
    timeout: Duration,
    cancel: Arc<Notify>,
    running: RunningMap,
    events: mpsc::UnboundedSender<ExecEvent>,
}

impl Supervised {
    async fn supervise(self, mut child: Child, mut output: OutputLines) {
        let started = Instant::now();
        let mut last_line = String::new();
        let mut streams_open = true;

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let reason = loop {
            tokio::select! {
                biased;
                status = child.wait() => break match status {
                    Ok(status) => StopReason::Exited(status),
                    Err(err) => StopReason::Lost(err),
                },
                line = output.rx.recv(), if streams_open => match line {
                    Some(line) => self.forward(line, &mut last_line),
                    None => streams_open = false,
                },
                _ = self.cancel.notified() => break StopReason::Canceled,
                _ = &mut deadline => break StopReason::TimedOut,
            }
        };

        let (exit_code, timed_out, canceled) = match reason {
            StopReason::Exited(status) => (status.code(), false, false),
            StopReason::Lost(err) => {
                warn!(key = %self.key, error = %err, "lost track of action process; stopping it");
                (stop(&mut child).await.and_then(|s| s.code()), false, false)
            }
            StopReason::Canceled => {
                stop(&mut child).await;
                (None, false, true)
            }
            StopReason::TimedOut => {
                stop(&mut child).await;
                (None, true, false)
            }
        };

        let drain = tokio::time::sleep(OUTPUT_DRAIN);
        tokio::pin!(drain);
        while streams_open {
            tokio::select! {
                line = output.rx.recv() => match line {
                    Some(line) => self.forward(line, &mut last_line),
                    None => streams_open = false,
                },
                _ = &mut drain => break,
            }
        }
        drop(output);

        let outcome = ExecOutcome {
            exit_code,
            timed_out,
            canceled,
            last_line,
        };

        lock(&self.running).remove(&self.key);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if outcome.succeeded() {
            info!(key = %self.key, title = %self.title, outcome = outcome.label(), elapsed_ms, "action finished");
        } else {
            warn!(
                key = %self.key,
                title = %self.title,
                outcome = outcome.label(),
                exit_code = ?outcome.exit_code,
                last_line = %outcome.last_line,
                elapsed_ms,
                "action finished"
            );
        }

        let _ = self.events.send(ExecEvent::Finished {
            key: self.key,
            title: self.title,
            outcome,
        });
    }

    fn forward(&self, line: String, last_line: &mut String) {
        if !line.trim().is_empty() {
            last_line.clone_from(&line);
        }
        let _ = self.events.send(ExecEvent::Output {
            key: self.key.clone(),
            line,
        });
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use touchdeck_core::PlaybackStatus;

    fn action(key: &str, command: &str, timeout_ms: u64) -> CustomQuickAction {
        CustomQuickAction {
            key: key.into(),
            title: format!("Action {key}"),
            command: command.into(),
            timeout_ms,
        }
    }

    async fn finished(rx: &mut mpsc::UnboundedReceiver<ExecEvent>) -> (Vec<String>, ExecOutcome) {
        let mut output = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("executor went quiet")
                .expect("event channel closed");
            match event {
                ExecEvent::Output { line, .. } => output.push(line),
                ExecEvent::Finished { outcome, .. } => return (output, outcome),
            }
        }
    }

    #[tokio::test]
    async fn timeout_stops_the_process() {
        let (exec, mut rx) = CommandExecutor::new();
        let handle = exec
            .run(&action("slow", "sleep 5", 100), &MediaState::default())
            .unwrap();
        assert!(handle.is_some());
        assert!(exec.is_running("slow"));

        let started = Instant::now();
        let (_, outcome) = finished(&mut rx).await;
        assert!(outcome.timed_out);
        assert!(!outcome.canceled);
        assert_eq!(outcome.label(), "timed_out");
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(!exec.is_running("slow"));
    }

    #[tokio::test]
    async fn second_trigger_is_ignored_while_running() {
        let (exec, mut rx) = CommandExecutor::new();
        let a = action("dup", "sleep 5", 30_000);
        let first = exec.run(&a, &MediaState::default()).unwrap();
        let second = exec.run(&a, &MediaState::default()).unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(exec.running_keys(), vec!["dup".to_string()]);

        assert!(exec.cancel("dup"));
        let (_, outcome) = finished(&mut rx).await;
        assert!(outcome.canceled);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.exit_code, None);
        assert!(exec.running_keys().is_empty());
        assert!(!exec.cancel("dup"));
    }

    #[tokio::test]
    async fn handle_cancel_is_observed() {
        let (exec, mut rx) = CommandExecutor::new();
        let handle = exec
            .run(&action("h", "sleep 5", 30_000), &MediaState::default())
            .unwrap()
            .unwrap();
        assert_eq!(handle.key(), "h");
        handle.cancel();
        let (_, outcome) = finished(&mut rx).await;
        assert_eq!(outcome.label(), "canceled");
    }

    #[tokio::test]
    async fn streams_output_with_placeholders() {
        let (exec, mut rx) = CommandExecutor::new();
        let state = MediaState {
            title: "Song".into(),
            status: PlaybackStatus::Playing,
            ..MediaState::default()
        };
        exec.run(&action("echo", "echo '{title}'; echo done >&2", 5_000), &state)
            .unwrap();
        let (output, outcome) = finished(&mut rx).await;
        assert!(output.contains(&"Song".to_string()));
        assert!(output.contains(&"done".to_string()));
        assert!(outcome.succeeded());
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failure() {
        let (exec, mut rx) = CommandExecutor::new();
        exec.run(&action("bad", "echo oops; exit 3", 5_000), &MediaState::default())
            .unwrap();
        let (_, outcome) = finished(&mut rx).await;
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.label(), "failed");
        assert_eq!(outcome.last_line, "oops");
    }

    #[test]
    fn empty_command_is_rejected() {
        let (exec, _rx) = CommandExecutor::new();
        let err = exec
            .run(&action("blank", "{missing}  ", 1_000), &MediaState::default())
            .unwrap_err();
        assert!(matches!(err, ExecutorError::EmptyCommand(_)));
        assert!(!exec.is_running("blank"));
    }

    #[tokio::test]
    async fn retrigger_while_running_starts_nothing_new() {
        let (exec, mut rx) = CommandExecutor::new();
        let a = action("once", "echo start; sleep 0.3", 5_000);
        assert!(exec.run(&a, &MediaState::default()).unwrap().is_some());
        for _ in 0..3 {
            assert!(exec.run(&a, &MediaState::default()).unwrap().is_none());
        }

        let (output, outcome) = finished(&mut rx).await;
        assert_eq!(output, vec!["start".to_string()]);
        assert!(outcome.succeeded());
        assert!(!exec.is_running("once"));

        // Free again once the first run has finished.
        assert!(exec.run(&a, &MediaState::default()).unwrap().is_some());
        let (output, _) = finished(&mut rx).await;
        assert_eq!(output, vec!["start".to_string()]);
    }

    #[tokio::test]
    async fn spawn_failure_is_surfaced() {
        let (exec, _rx) = CommandExecutor::new();
        let exec = exec.with_shell("/nonexistent/touchdeck-shell");
        let err = exec
            .run(&action("nope", "echo hi", 1_000), &MediaState::default())
            .unwrap_err();
        match err {
            ExecutorError::Spawn { key, source } => {
                assert_eq!(key, "nope");
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!exec.is_running("nope"));
        assert!(exec.running_keys().is_empty());
    }
}
