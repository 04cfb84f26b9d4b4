//! Deterministic in-process transport for tests.
//!
//! Scripts a behavior per host name and records concurrency so tests can
//! assert the dispatcher's scheduling properties without any network.

use crate::config::CollectionRequest;
use crate::hosts::Host;
use crate::ssh::{SessionError, SessionOutput, Transport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

enum Behavior {
    Success { stdout: String, delay: Duration },
    Fail(SessionError),
    FlakyThen { failures: u32, error: SessionError, stdout: String },
}

/// Transport whose per-host outcomes are scripted up front.
#[derive(Default)]
pub struct ScriptedTransport {
    behaviors: HashMap<String, Behavior>,
    attempts: Mutex<HashMap<String, u32>>,
    active: AtomicUsize,
    high_water: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host succeeds immediately with the given stdout.
    pub fn succeed(mut self, name: &str, stdout: &str) -> Self {
        self.behaviors.insert(
            name.to_string(),
            Behavior::Success {
                stdout: stdout.to_string(),
                delay: Duration::ZERO,
            },
        );
        self
    }

    /// Host succeeds after holding its session open for `delay`.
    pub fn succeed_after(mut self, name: &str, stdout: &str, delay: Duration) -> Self {
        self.behaviors.insert(
            name.to_string(),
            Behavior::Success {
                stdout: stdout.to_string(),
                delay,
            },
        );
        self
    }

    /// Host fails every attempt with the given error.
    pub fn fail(mut self, name: &str, error: SessionError) -> Self {
        self.behaviors.insert(name.to_string(), Behavior::Fail(error));
        self
    }

    /// Host fails `failures` times with `error`, then succeeds.
    pub fn flaky(mut self, name: &str, failures: u32, error: SessionError, stdout: &str) -> Self {
        self.behaviors.insert(
            name.to_string(),
            Behavior::FlakyThen {
                failures,
                error,
                stdout: stdout.to_string(),
            },
        );
        self
    }

    /// Highest number of sessions that were ever open at once.
    pub fn max_concurrent(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }

    /// Total sessions opened, retries included.
    pub fn total_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn record_attempt(&self, name: &str) -> u32 {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let count = attempts.entry(name.to_string()).or_insert(0);
        *count += 1;
        *count
    }
}

impl Transport for ScriptedTransport {
    async fn run(
        &self,
        host: &Host,
        _request: &CollectionRequest,
    ) -> Result<SessionOutput, SessionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(active, Ordering::SeqCst);

        let attempt = self.record_attempt(&host.name);
        let result = match self.behaviors.get(&host.name) {
            Some(Behavior::Success { stdout, delay }) => {
                if !delay.is_zero() {
                    tokio::time::sleep(*delay).await;
                }
                Ok(SessionOutput {
                    stdout: stdout.clone(),
                    stderr: String::new(),
                    exit_status: 0,
                    duration: *delay,
                })
            }
            Some(Behavior::Fail(error)) => Err(error.clone()),
            Some(Behavior::FlakyThen { failures, error, stdout }) => {
                if attempt <= *failures {
                    Err(error.clone())
                } else {
                    Ok(SessionOutput {
                        stdout: stdout.clone(),
                        stderr: String::new(),
                        exit_status: 0,
                        duration: Duration::ZERO,
                    })
                }
            }
            None => Err(SessionError::Spawn {
                host: host.address.clone(),
                reason: "no scripted behavior".to_string(),
            }),
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
