// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervised execution of one external process.
//!
//! The child runs in its own process group. Stdout and stderr are drained by
//! two reader tasks; every line is either a structured event (a JSON object
//! with a string `event` field), appended verbatim to the [`EventLog`] and
//! forwarded to the caller, or a plain `console.line` entry.
//!
//! While the child runs, the supervisor invokes the heartbeat when it is due
//! (on the heartbeat's own schedule when it keeps one, so consecutive
//! processes of one attempt share a cadence) and enforces the deadline.
//! Termination is SIGTERM to the group, a grace period, then SIGKILL.

use std::ffi::{OsStr, OsString};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::event_log::EventLog;

/// Exit code reported for a process killed at its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Subprocess supervision errors.
#[derive(Debug, Error)]
pub enum SubprocessError {
    /// The process could not be started.
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Reading the process output failed.
    #[error("Failed to read process output: {0}")]
    Reader(std::io::Error),

    /// Waiting for the process failed.
    #[error("Failed to wait for process: {0}")]
    Wait(std::io::Error),

    /// The heartbeat reported lease loss; the process was terminated.
    #[error("Lease lost while the process was running")]
    LeaseLost,
}

/// Liveness callback invoked while a process runs.
///
/// Returning `false` means the caller no longer owns the work: the process
/// is terminated and supervision fails with [`SubprocessError::LeaseLost`].
#[async_trait]
pub trait Heartbeat: Send + Sync {
    /// Renew ownership; `false` when it was lost.
    async fn beat(&self) -> bool;

    /// Deadline of the next beat when the heartbeat keeps its own schedule.
    ///
    /// `None` lets the runner beat every `heartbeat_interval` from spawn.
    fn next_due(&self) -> Option<tokio::time::Instant> {
        None
    }
}

/// Program, arguments, working directory and extra environment of a process.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: PathBuf,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    env: Vec<(OsString, OsString)>,
}

impl CommandSpec {
    /// Start a command for `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Run in `dir`.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Set an environment variable for the process.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Human readable command line.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(|part| part.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Per-invocation supervision parameters.
pub struct Supervision<'a> {
    /// Hard deadline for the process.
    pub timeout: Duration,
    /// Liveness callback; `None` disables heartbeating.
    pub heartbeat: Option<&'a dyn Heartbeat>,
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
    /// Receives every structured event the process emits.
    pub on_event: Option<&'a (dyn Fn(&Map<String, Value>) + Send + Sync)>,
    /// Sink for output lines.
    pub log: &'a EventLog,
}

/// Result of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubprocessOutcome {
    /// Exit code; [`TIMEOUT_EXIT_CODE`] when the deadline hit, `128 + signal` when signalled.
    pub exit_code: i32,
    /// Whether the process was killed at its deadline.
    pub timed_out: bool,
    /// Wall-clock runtime.
    pub duration: Duration,
}

impl SubprocessOutcome {
    /// Exited on its own with code 0.
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn as_str(&self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

enum ReaderMessage {
    Line(Stream, String),
    Failed(std::io::Error),
}

/// Spawns and supervises external processes.
#[derive(Debug, Clone)]
pub struct SubprocessRunner {
    grace_period: Duration,
    drain_timeout: Duration,
}

impl Default for SubprocessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl SubprocessRunner {
    /// Runner waiting `grace_period` between SIGTERM and SIGKILL.
    pub fn new(grace_period: Duration) -> Self {
        Self {
            grace_period,
            drain_timeout: Duration::from_secs(2),
        }
    }

    /// Bound on draining buffered output after the process exits.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Run `spec` to completion under `supervision`.
    ///
    /// Non-zero exits and timeouts are reported in the outcome, not as errors.
    pub async fn run(
        &self,
        spec: &CommandSpec,
        supervision: Supervision<'_>,
    ) -> Result<SubprocessOutcome, SubprocessError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| SubprocessError::Spawn {
            program: spec.program.display().to_string(),
            source,
        })?;
        debug!(command = %spec.display(), pid = ?child.id(), "Spawned subprocess");

        let (tx, mut rx) = mpsc::channel(256);
        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, Stream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, Stream::Stderr, tx.clone()));
        }
        drop(tx);

        let deadline = tokio::time::Instant::now() + supervision.timeout;
        let mut next_beat = tokio::time::Instant::now() + supervision.heartbeat_interval;
        let mut output_open = true;

        let outcome: Result<(ExitStatus, bool), SubprocessError> = loop {
            let beat_at = supervision
                .heartbeat
                .and_then(|heartbeat| heartbeat.next_due())
                .unwrap_or(next_beat);

            tokio::select! {
                biased;

                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        command = %spec.display(),
                        timeout_secs = supervision.timeout.as_secs_f64(),
                        "Subprocess timed out, terminating"
                    );
                    break self.terminate(&mut child).await.map(|status| (status, true));
                }

                _ = tokio::time::sleep_until(beat_at), if supervision.heartbeat.is_some() => {
                    let alive = match supervision.heartbeat {
                        Some(heartbeat) => heartbeat.beat().await,
                        None => true,
                    };
                    if !alive {
                        warn!(command = %spec.display(), "Heartbeat failed, terminating subprocess");
                        if let Err(e) = self.terminate(&mut child).await {
                            warn!(error = %e, "Failed to reap terminated subprocess");
                        }
                        break Err(SubprocessError::LeaseLost);
                    }
                    next_beat = tokio::time::Instant::now() + supervision.heartbeat_interval;
                }

                status = child.wait() => {
                    break status.map(|status| (status, false)).map_err(SubprocessError::Wait);
                }

                message = rx.recv(), if output_open => match message {
                    Some(ReaderMessage::Line(stream, line)) => {
                        handle_line(stream, &line, &supervision);
                    }
                    Some(ReaderMessage::Failed(e)) => {
                        if let Err(wait_err) = self.terminate(&mut child).await {
                            warn!(error = %wait_err, "Failed to reap terminated subprocess");
                        }
                        break Err(SubprocessError::Reader(e));
                    }
                    None => output_open = false,
                },
            }
        };

        // Output written just before exit is still buffered in the channel.
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while let Some(message) = rx.recv().await {
                if let ReaderMessage::Line(stream, line) = message {
                    handle_line(stream, &line, &supervision);
                }
            }
        })
        .await;
        if drained.is_err() {
            debug!(command = %spec.display(), "Output still open after exit, abandoning readers");
        }
        for reader in readers {
            reader.abort();
        }
        supervision.log.flush();

        let (status, timed_out) = outcome?;
        let exit_code = if timed_out {
            TIMEOUT_EXIT_CODE
        } else {
            exit_code_of(status)
        };
        let duration = started.elapsed();
        info!(
            command = %spec.display(),
            exit_code,
            timed_out,
            duration_ms = duration.as_millis() as u64,
            "Subprocess finished"
        );

        Ok(SubprocessOutcome {
            exit_code,
            timed_out,
            duration,
        })
    }

    /// SIGTERM the process group, wait the grace period, then SIGKILL it.
    async fn terminate(&self, child: &mut Child) -> Result<ExitStatus, SubprocessError> {
        let Some(pid) = child.id() else {
            return child.wait().await.map_err(SubprocessError::Wait);
        };
        let group = Pid::from_raw(pid as i32);

        if let Err(e) = killpg(group, Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM to process group failed");
        }

        let status = match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(status) => status.map_err(SubprocessError::Wait)?,
            Err(_) => {
                warn!(pid, "Subprocess ignored SIGTERM, sending SIGKILL");
                if let Err(e) = killpg(group, Signal::SIGKILL) {
                    debug!(pid, error = %e, "SIGKILL to process group failed");
                }
                child.wait().await.map_err(SubprocessError::Wait)?
            }
        };

        // Descendants that outlived the leader.
        let _ = killpg(group, Signal::SIGKILL);
        Ok(status)
    }
}

fn spawn_reader<R>(source: R, stream: Stream, tx: mpsc::Sender<ReaderMessage>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(source);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if tx.send(ReaderMessage::Line(stream, line)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(ReaderMessage::Failed(e)).await;
                    break;
                }
            }
        }
    })
}

fn handle_line(stream: Stream, line: &str, supervision: &Supervision<'_>) {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return;
    }
    match parse_structured_event(line) {
        Some(event) => {
            supervision.log.append_raw(&event);
            if let Some(on_event) = supervision.on_event {
                on_event(&event);
            }
        }
        None => supervision.log.console(stream.as_str(), line),
    }
}

/// Recognize a structured event: a JSON object carrying a string `event` field.
pub fn parse_structured_event(line: &str) -> Option<Map<String, Value>> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) if map.get("event").is_some_and(Value::is_string) => Some(map),
        _ => None,
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}
