//! Run configuration: the immutable collection request and credentials.
//!
//! All knobs are resolved once at startup into a [`CollectionRequest`] that
//! is shared read-only across workers. Nothing consults the environment
//! after run start.

use crate::hosts::SinceCutoff;
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_CONCURRENCY: usize = 16;

/// How a session authenticates.
#[derive(Debug, Clone)]
pub enum Credential {
    /// Private key file, used with `ssh -i` in batch mode.
    KeyFile(PathBuf),
    /// Password, passed to sshpass via the environment, never on argv.
    Password(String),
}

/// Everything one collection run needs, fixed at startup.
#[derive(Debug, Clone)]
pub struct CollectionRequest {
    /// Inclusive lower bound for remote log lines.
    pub since: SinceCutoff,
    /// Prefix the remote invocation with `sudo -n`.
    pub sudo: bool,
    /// Processor script streamed to the remote shell's stdin.
    pub script: String,
    /// SSH connection establishment timeout.
    pub connect_timeout: Duration,
    /// Wall-clock budget for one full session attempt.
    pub command_timeout: Duration,
    /// Additional attempts after the first, for retryable failures.
    pub max_retries: u32,
    /// Upper bound on concurrently open sessions.
    pub concurrency: usize,
    /// Optional future fire time; the run waits until then before the
    /// first connection.
    pub scheduled_start: Option<DateTime<Local>>,
    /// Username for hosts without an override.
    pub default_username: String,
    /// Port for hosts without an override.
    pub default_port: u16,
    /// Shared authentication credential.
    pub credential: Credential,
}

/// Process environment with a `.env` file fallback.
///
/// The file is parsed once; only `FSWEEP_`-prefixed keys are considered and
/// real environment variables always win. The environment itself is never
/// mutated.
#[derive(Debug, Default)]
pub struct EnvSettings {
    fallback: HashMap<String, String>,
}

impl EnvSettings {
    /// Load `.env` from the given directory, if present.
    pub fn load(dir: &Path) -> Self {
        let mut fallback = HashMap::new();
        let path = dir.join(".env");
        if path.exists() {
            debug!(path = %path.display(), "parsing .env fallback");
            if let Ok(content) = std::fs::read_to_string(&path) {
                for (key, value) in parse_env_lines(&content) {
                    if key.starts_with("FSWEEP_") {
                        fallback.insert(key, value);
                    }
                }
            }
        }
        Self { fallback }
    }

    /// Look up a key: process environment first, then the `.env` fallback.
    pub fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().or_else(|| self.fallback.get(key).cloned())
    }
}

fn parse_env_lines(content: &str) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim().to_string();
            let value = value.trim();
            let value = if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
                || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
            {
                &value[1..value.len() - 1]
            } else {
                value
            };
            vars.push((key, value.to_string()));
        }
    }
    vars
}
