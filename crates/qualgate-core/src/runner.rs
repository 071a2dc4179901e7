//! Subprocess runner.
//!
//! Executes one script as `/bin/bash -c "set -e\n<script>"` in a given
//! working directory and environment, under a deadline. Stdout and stderr
//! are read concurrently and merged into one line stream in arrival order,
//! with partial lines carried across read boundaries. Each line is secret
//! redacted and then classified as structured (valid JSON, numbers kept at
//! their original precision) or plain text.

use indexmap::IndexMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::logging::redact;
use crate::model::Environment;

/// Exit code reserved for deadline expiry.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported when the command could not be started at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = -1;

/// Which stream a captured line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Stdout,
    Stderr,
}

/// One captured, redacted output line.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub source: LogSource,
    pub text: String,
    /// Present when the line is valid JSON.
    pub json: Option<serde_json::Value>,
}

/// Captured result of one script execution.
#[derive(Debug, Clone)]
pub struct ScriptOutput {
    pub exit_code: i32,
    /// All lines in arrival order, stdout and stderr interleaved.
    pub logs: Vec<LogLine>,
    /// Decoded values of the structured stdout lines, in order.
    pub json_stdout: Vec<serde_json::Value>,
}

impl ScriptOutput {
    pub fn log_texts(&self) -> Vec<String> {
        self.logs.iter().map(|l| l.text.clone()).collect()
    }
}

/// Runs scripts with a fixed deadline and secret table.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    pub timeout: Duration,
    pub secrets: IndexMap<String, String>,
}

impl ScriptRunner {
    pub fn new(timeout: Duration, secrets: IndexMap<String, String>) -> Self {
        Self { timeout, secrets }
    }

    /// Execute `script` in `workdir` with exactly the given environment.
    ///
    /// Normal termination yields the process exit code; exceeding the
    /// deadline kills the process, forces exit code 124 and appends a
    /// synthetic stderr line; failure to start yields exit code -1.
    pub async fn run(&self, script: &str, workdir: &Path, env: &Environment) -> ScriptOutput {
        let mut cmd = Command::new("/bin/bash");
        cmd.arg("-c")
            .arg(format!("set -e\n{script}"))
            .current_dir(workdir)
            .env_clear()
            .envs(env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            // Own process group, so the deadline can take background
            // children down with the script.
            .process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                return ScriptOutput {
                    exit_code: SPAWN_FAILURE_EXIT_CODE,
                    logs: vec![LogLine {
                        source: LogSource::Stderr,
                        text: format!("failed to start command: {err}"),
                        json: None,
                    }],
                    json_stdout: Vec::new(),
                };
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<(LogSource, String)>();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_lines(stdout, LogSource::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_lines(stderr, LogSource::Stderr, tx.clone()));
        }
        // Readers own the remaining senders; dropping ours lets rx terminate.
        drop(tx);

        let mut timed_out = false;
        let exit_code = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status.code().unwrap_or(SPAWN_FAILURE_EXIT_CODE),
            Ok(Err(_)) => SPAWN_FAILURE_EXIT_CODE,
            Err(_) => {
                timed_out = true;
                // Kill the whole group: background children inherit the
                // output pipes and would otherwise hold them open past the
                // deadline, stalling the line drain below.
                kill_process_group(&child);
                let _ = child.start_kill();
                let _ = child.wait().await;
                TIMEOUT_EXIT_CODE
            }
        };

        let mut logs = Vec::new();
        let mut json_stdout = Vec::new();
        while let Some((source, raw)) = rx.recv().await {
            let text = redact(&raw, &self.secrets);
            let json = parse_json_line(&text);
            if source == LogSource::Stdout {
                if let Some(value) = &json {
                    json_stdout.push(value.clone());
                }
            }
            logs.push(LogLine { source, text, json });
        }

        if timed_out {
            logs.push(LogLine {
                source: LogSource::Stderr,
                text: format!("Command timed out after {}s", self.timeout.as_secs()),
                json: None,
            });
        }

        ScriptOutput {
            exit_code,
            logs,
            json_stdout,
        }
    }
}

/// Send SIGKILL to the child's process group (the child was spawned as the
/// group leader). A child that already exited has no id and is skipped.
fn kill_process_group(child: &tokio::process::Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
}

/// Classify one line: `Some(value)` when the trimmed line is valid JSON.
/// Numbers keep their original text (arbitrary precision), not f64.
fn parse_json_line(line: &str) -> Option<serde_json::Value> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// Read a stream byte-wise, splitting into lines with partial-line carry,
/// forwarding each completed line in arrival order.
async fn read_lines<R: AsyncRead + Unpin>(
    mut reader: R,
    source: LogSource,
    tx: mpsc::UnboundedSender<(LogSource, String)>,
) {
    let mut buf = [0u8; 4096];
    let mut carry: Vec<u8> = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                carry.extend_from_slice(&buf[..n]);
                while let Some(pos) = carry.iter().position(|&b| b == b'\n') {
                    let mut line: Vec<u8> = carry.drain(..=pos).collect();
                    line.pop();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    let text = String::from_utf8_lossy(&line).into_owned();
                    if tx.send((source, text)).is_err() {
                        return;
                    }
                }
            }
        }
    }
    if !carry.is_empty() {
        let _ = tx.send((source, String::from_utf8_lossy(&carry).into_owned()));
    }
}
