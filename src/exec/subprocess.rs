//! Logged subprocess execution
//!
//! Runs an external generation command with stdout and stderr merged
//! line-by-line into an append-only log file, emitting a heartbeat progress
//! event while the process keeps running. The exit code is the sole error
//! signal; the runner never interprets output.

use crate::error::{KilnError, KilnResult};
use crate::events::{self, Event};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::debug;

/// Seconds of continued execution between heartbeat events
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// A fully-resolved external command
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    /// Build from an argv-style list (config launcher prefix + arguments)
    pub fn new(argv: Vec<String>) -> KilnResult<Self> {
        let mut iter = argv.into_iter();
        let program = iter
            .next()
            .ok_or_else(|| KilnError::ConfigMissing("empty command".to_string()))?;
        Ok(Self {
            program,
            args: iter.collect(),
            env: vec![],
            cwd: None,
        })
    }

    pub fn env(mut self, vars: Vec<(String, String)>) -> Self {
        self.env.extend(vars);
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// One-line rendering for logs and error messages
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Heartbeat state: due when the interval has passed since the last emit
struct Heartbeat {
    started: Instant,
    last: Instant,
    interval: Duration,
}

impl Heartbeat {
    fn new(interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last: now,
            interval,
        }
    }

    /// Elapsed seconds since start if a heartbeat is due, else None
    fn tick(&mut self) -> Option<u64> {
        if self.last.elapsed() >= self.interval {
            self.last = Instant::now();
            Some(self.started.elapsed().as_secs())
        } else {
            None
        }
    }
}

/// Run `spec`, streaming its merged output into `log_path`.
///
/// The log is opened in append mode and prior content is never truncated.
/// Heartbeats are emitted between output lines, not on a separate timer, so
/// a silent process produces no events until its next line.
pub async fn run_logged(
    spec: &CommandSpec,
    log_path: Option<&Path>,
    heartbeat_label: &str,
) -> KilnResult<i32> {
    debug!("running: {}", spec.display());

    let mut child = spec
        .build()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| KilnError::command_failed(spec.display(), e))?;

    let mut log = match log_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| KilnError::io("creating log directory", e))?;
            }
            Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(|e| KilnError::io(format!("opening log {}", path.display()), e))?,
            )
        }
        None => None,
    };

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();

    let mut heartbeat = Heartbeat::new(HEARTBEAT_INTERVAL);
    let mut stdout_done = false;
    let mut stderr_done = false;

    while !stdout_done || !stderr_done {
        let line = tokio::select! {
            line = stdout_lines.next_line(), if !stdout_done => {
                match line {
                    Ok(Some(line)) => Some(line),
                    _ => {
                        stdout_done = true;
                        None
                    }
                }
            }
            line = stderr_lines.next_line(), if !stderr_done => {
                match line {
                    Ok(Some(line)) => Some(line),
                    _ => {
                        stderr_done = true;
                        None
                    }
                }
            }
        };

        if let Some(line) = line {
            if let Some(log) = log.as_mut() {
                let mut entry = line;
                entry.push('\n');
                log.write_all(entry.as_bytes())
                    .await
                    .map_err(|e| KilnError::io("appending to log", e))?;
            }
            if let Some(elapsed_s) = heartbeat.tick() {
                events::emit(&Event::progress(heartbeat_label, elapsed_s));
            }
        }
    }

    if let Some(log) = log.as_mut() {
        log.flush()
            .await
            .map_err(|e| KilnError::io("flushing log", e))?;
    }

    let status = child
        .wait()
        .await
        .map_err(|e| KilnError::command_failed(spec.display(), e))?;

    Ok(status.code().unwrap_or(-1))
}

/// Last `n` lines of a log file, for error excerpts
pub fn tail_lines(path: &Path, n: usize) -> Vec<String> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return vec![];
    };
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|l| l.to_string()).collect()
}
