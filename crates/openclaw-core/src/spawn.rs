//! Worker process spawning.
//!
//! Workers are external CLI agents: payload in on stdin, line-delimited
//! JSON events out on stdout. They are launched with a whitelisted
//! environment; inheriting the parent environment wholesale would leak
//! session markers that make the agent believe it is running nested inside
//! another session and abort.

use std::process::Stdio;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

use crate::error::SpawnError;
use crate::model::ModelFamily;

/// Environment variables a worker inherits from the parent process.
const ENV_ALLOWLIST: &[&str] = &[
    "HOME",
    "PATH",
    "USER",
    "SHELL",
    "LANG",
    "LC_ALL",
    "TMPDIR",
    "XDG_RUNTIME_DIR",
];

/// Variables pinned to fixed values: non-interactive terminal, no color,
/// no telemetry, no auto-update, no keychain prompts.
const ENV_PINNED: &[(&str, &str)] = &[
    ("TERM", "dumb"),
    ("NO_COLOR", "1"),
    ("CI", "true"),
    ("DISABLE_TELEMETRY", "1"),
    ("DISABLE_AUTOUPDATER", "1"),
    ("DISABLE_ERROR_REPORTING", "1"),
];

/// How a pool credential is billed, which decides the header/env it rides in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    /// Subscription (OAuth-style) credential.
    Flat,
    /// Pay-per-token API key.
    Metered,
}

impl Default for TokenKind {
    fn default() -> Self {
        TokenKind::Flat
    }
}

/// A worker definition from configuration. Immutable after boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub name: String,
    pub bin: String,
    /// Overrides the generated agent CLI flags when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub token_kind: TokenKind,
}

/// One decoded line of worker output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerLine {
    Out(String),
    Err(String),
}

/// A spawned worker child with its stdio plumbed into a line channel.
///
/// Reader tasks continuously drain stdout and stderr, so the child can
/// never block on a full pipe no matter how long the receiver goes
/// unpolled. Whoever holds this struct owns the child's lifecycle.
pub struct WorkerProcess {
    pub pid: u32,
    pub worker: String,
    pub spawned_at: Instant,
    child: Child,
    stdin: Option<ChildStdin>,
    lines: mpsc::UnboundedReceiver<WorkerLine>,
}

impl WorkerProcess {
    /// Spawn `spec.bin` in stream-json mode for `model`.
    pub fn spawn(spec: &WorkerSpec, model: ModelFamily, stream: bool) -> Result<Self, SpawnError> {
        let mut cmd = Command::new(&spec.bin);
        match &spec.args {
            Some(args) => {
                cmd.args(args);
            }
            None => {
                cmd.arg("-p")
                    .arg("--model")
                    .arg(model.as_str())
                    .arg("--output-format")
                    .arg(if stream { "stream-json" } else { "json" });
                if stream {
                    cmd.arg("--verbose");
                }
            }
        }

        cmd.env_clear();
        for key in ENV_ALLOWLIST {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        for (key, value) in ENV_PINNED {
            cmd.env(key, value);
        }
        if let Some(token) = &spec.token {
            match spec.token_kind {
                TokenKind::Flat => cmd.env("CLAUDE_CODE_OAUTH_TOKEN", token),
                TokenKind::Metered => cmd.env("ANTHROPIC_API_KEY", token),
            };
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| SpawnError::Spawn {
            worker: spec.name.clone(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| SpawnError::MissingPipe {
            worker: spec.name.clone(),
            stream: "pid",
        })?;
        let stdin = child.stdin.take().ok_or_else(|| SpawnError::MissingPipe {
            worker: spec.name.clone(),
            stream: "stdin",
        })?;
        let stdout = child.stdout.take().ok_or_else(|| SpawnError::MissingPipe {
            worker: spec.name.clone(),
            stream: "stdout",
        })?;
        let stderr = child.stderr.take().ok_or_else(|| SpawnError::MissingPipe {
            worker: spec.name.clone(),
            stream: "stderr",
        })?;

        let (tx, lines) = mpsc::unbounded_channel();
        let out_tx = tx.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if out_tx.send(WorkerLine::Out(line)).is_err() {
                    break;
                }
            }
        });
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if tx.send(WorkerLine::Err(line)).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            pid,
            worker: spec.name.clone(),
            spawned_at: Instant::now(),
            child,
            stdin: Some(stdin),
            lines,
        })
    }

    /// Write the request payload and close stdin so the worker starts.
    pub async fn send_payload(&mut self, payload: &str) -> Result<(), SpawnError> {
        let mut stdin = self
            .stdin
            .take()
            .ok_or_else(|| SpawnError::MissingPipe {
                worker: self.worker.clone(),
                stream: "stdin",
            })?;
        stdin.write_all(payload.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.shutdown().await?;
        Ok(())
    }

    /// Next decoded output line, or `None` once both pipes hit EOF.
    pub async fn next_line(&mut self) -> Option<WorkerLine> {
        self.lines.recv().await
    }

    /// Drain whatever the readers have already buffered, without waiting.
    pub fn try_next_line(&mut self) -> Option<WorkerLine> {
        self.lines.try_recv().ok()
    }

    /// Non-blocking exit probe.
    pub fn try_exit(&mut self) -> Option<std::process::ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Wait for the child to exit.
    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }

    /// Begin TERMination without waiting.
    pub fn terminate(&mut self) {
        if let Err(err) = self.child.start_kill() {
            tracing::debug!(pid = self.pid, %err, "terminate: child already gone");
        }
    }
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("pid", &self.pid)
            .field("worker", &self.worker)
            .finish()
    }
}
