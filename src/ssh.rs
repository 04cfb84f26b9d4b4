//! Connection lifecycle management for one remote session.
//!
//! Drives the system `ssh` binary via `tokio::process::Command` for maximum
//! compatibility with existing SSH configurations and agent forwarding. The
//! processor script is streamed to the remote shell's stdin (`sh -s`) and is
//! never written to remote disk; the cutoff travels as an explicit runtime
//! argument. `kill_on_drop` guarantees the session is torn down on every
//! exit path, timeout and abort included.

use crate::config::{CollectionRequest, Credential};
use crate::hosts::Host;
use crate::retry::RetryableError;
use std::fmt;
use std::future::Future;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Lifecycle of a single host attempt. Any phase can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Authenticating,
    Executing,
    Streaming,
    Closed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Executing => "executing",
            Self::Streaming => "streaming",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Captured result of a successful remote execution.
#[derive(Debug, Clone)]
pub struct SessionOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
    pub duration: Duration,
}

/// Distinguishable per-session failure kinds.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("session timed out after {timeout_secs}s on {host}")]
    Timeout { host: String, timeout_secs: u64 },

    #[error("connection refused by {host}: {reason}")]
    Refused { host: String, reason: String },

    #[error("could not resolve {host}: {reason}")]
    Dns { host: String, reason: String },

    #[error("authentication failed for {user}@{host}")]
    Auth { host: String, user: String },

    #[error("remote processor exited with status {exit_status} on {host}: {stderr}")]
    NonZeroExit {
        host: String,
        exit_status: i32,
        stderr: String,
    },

    #[error("failed to start session for {host}: {reason}")]
    Spawn { host: String, reason: String },
}

impl SessionError {
    /// Stable kind label for reports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Refused { .. } => "connection_refused",
            Self::Dns { .. } => "dns",
            Self::Auth { .. } => "auth",
            Self::NonZeroExit { .. } => "non_zero_exit",
            Self::Spawn { .. } => "spawn",
        }
    }

    /// Remote exit status, when the session got far enough to have one.
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            Self::NonZeroExit { exit_status, .. } => Some(*exit_status),
            _ => None,
        }
    }
}

impl RetryableError for SessionError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Refused { .. } | Self::Dns { .. }
        )
    }
}

/// Classify a failed ssh invocation from its stderr.
///
/// Conservative: anything not clearly a transport or authentication
/// problem is treated as the remote command failing.
pub fn classify_failure(
    host: &str,
    user: &str,
    exit_status: i32,
    stderr: &str,
    connect_timeout: Duration,
) -> SessionError {
    let lower = stderr.to_lowercase();

    if lower.contains("permission denied")
        || lower.contains("authentication failed")
        || lower.contains("host key verification failed")
    {
        return SessionError::Auth {
            host: host.to_string(),
            user: user.to_string(),
        };
    }

    if lower.contains("could not resolve hostname")
        || lower.contains("name or service not known")
        || lower.contains("temporary failure in name resolution")
    {
        return SessionError::Dns {
            host: host.to_string(),
            reason: first_line(stderr),
        };
    }

    if lower.contains("connection refused") {
        return SessionError::Refused {
            host: host.to_string(),
            reason: first_line(stderr),
        };
    }

    if lower.contains("timed out")
        || lower.contains("network is unreachable")
        || lower.contains("no route to host")
    {
        return SessionError::Timeout {
            host: host.to_string(),
            timeout_secs: connect_timeout.as_secs(),
        };
    }

    SessionError::NonZeroExit {
        host: host.to_string(),
        exit_status,
        stderr: first_line(stderr),
    }
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
        .to_string()
}

/// Single-quote a value for a remote shell.
fn shell_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\"'\"'");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// One remote session per call; implementors own connect-to-close.
pub trait Transport: Send + Sync + 'static {
    fn run(
        &self,
        host: &Host,
        request: &CollectionRequest,
    ) -> impl Future<Output = Result<SessionOutput, SessionError>> + Send;
}

/// Production transport backed by the system `ssh` binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshTransport;

/// The invocation for one session: program, argv, and any extra
/// environment (the password channel for sshpass).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Option<(String, String)>,
}

/// The command handed to the remote shell: read the processor from stdin,
/// cutoff as the only argument, optionally under `sudo -n`.
pub fn remote_invocation(request: &CollectionRequest) -> String {
    let since = shell_escape(&request.since.remote_arg());
    if request.sudo {
        format!("sudo -n sh -s -- {since}")
    } else {
        format!("sh -s -- {since}")
    }
}

/// Build the full local invocation for one host.
pub fn build_session_command(host: &Host, request: &CollectionRequest) -> SessionCommand {
    let user = host.username_or(&request.default_username);
    let port = host.port_or(request.default_port);
    let destination = format!("{}@{}", user, host.address);

    let mut args = Vec::new();
    let mut env = None;
    let program = match &request.credential {
        Credential::KeyFile(key) => {
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
            args.push("-i".to_string());
            args.push(key.display().to_string());
            "ssh".to_string()
        }
        Credential::Password(password) => {
            // sshpass reads the secret from SSHPASS; it never appears on
            // the command line.
            args.push("-e".to_string());
            args.push("ssh".to_string());
            args.push("-o".to_string());
            args.push("PreferredAuthentications=password".to_string());
            args.push("-o".to_string());
            args.push("PubkeyAuthentication=no".to_string());
            args.push("-o".to_string());
            args.push("NumberOfPasswordPrompts=1".to_string());
            env = Some(("SSHPASS".to_string(), password.clone()));
            "sshpass".to_string()
        }
    };

    args.push("-o".to_string());
    args.push(format!(
        "ConnectTimeout={}",
        request.connect_timeout.as_secs()
    ));
    args.push("-o".to_string());
    args.push("StrictHostKeyChecking=accept-new".to_string());
    args.push("-p".to_string());
    args.push(port.to_string());
    args.push(destination);
    args.push(remote_invocation(request));

    SessionCommand { program, args, env }
}

impl Transport for SshTransport {
    async fn run(
        &self,
        host: &Host,
        request: &CollectionRequest,
    ) -> Result<SessionOutput, SessionError> {
        let user = host.username_or(&request.default_username).to_string();
        let invocation = build_session_command(host, request);

        debug!(
            host = %host.name,
            address = %host.address,
            phase = %SessionPhase::Connecting,
            timeout_secs = request.command_timeout.as_secs(),
            "opening session"
        );

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some((key, value)) = &invocation.env {
            cmd.env(key, value);
        }

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| SessionError::Spawn {
            host: host.address.clone(),
            reason: format!("{}: {e}", invocation.program),
        })?;

        debug!(host = %host.name, phase = %SessionPhase::Authenticating, "session spawned");

        let script = request.script.clone();
        let host_name = host.name.clone();
        let session = async move {
            if let Some(mut stdin) = child.stdin.take() {
                debug!(host = %host_name, phase = %SessionPhase::Executing, "streaming processor script");
                // A failed connection closes stdin early; the exit status
                // tells the story, so a short write is not an error here.
                let _ = stdin.write_all(script.as_bytes()).await;
                let _ = stdin.shutdown().await;
            }
            debug!(host = %host_name, phase = %SessionPhase::Streaming, "awaiting remote output");
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(request.command_timeout, session).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(SessionError::Spawn {
                    host: host.address.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                warn!(
                    host = %host.name,
                    address = %host.address,
                    timeout_secs = request.command_timeout.as_secs(),
                    "session timed out, aborting"
                );
                return Err(SessionError::Timeout {
                    host: host.address.clone(),
                    timeout_secs: request.command_timeout.as_secs(),
                });
            }
        };

        let duration = start.elapsed();
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_status = output.status.code().unwrap_or(-1);

        debug!(
            host = %host.name,
            phase = %SessionPhase::Closed,
            exit_status,
            duration_ms = duration.as_millis() as u64,
            stdout_len = stdout.len(),
            "session closed"
        );

        if output.status.success() {
            Ok(SessionOutput {
                stdout,
                stderr,
                exit_status,
                duration,
            })
        } else {
            Err(classify_failure(
                &host.address,
                &user,
                exit_status,
                &stderr,
                request.connect_timeout,
            ))
        }
    }
}
