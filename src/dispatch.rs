//! Fleet fan-out: bounded-concurrency collection across the registry.
//!
//! One retried session pipeline per host on a `JoinSet`, gated by a
//! semaphore permit. A watch channel carries the abort signal; both the
//! scheduled-start wait and the in-flight run react to it, and dropping
//! the `JoinSet` kills any open ssh children via `kill_on_drop`.

use crate::config::CollectionRequest;
use crate::hosts::HostRegistry;
use crate::redact::Redactor;
use crate::report::{AggregateReport, HostResult, ResultAggregator};
use crate::retry::{run_with_retry, RetryPolicy};
use crate::ssh::Transport;
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// How a collection run ended.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(AggregateReport),
    /// Aborted before or during the run; partial results are discarded.
    Aborted,
}

/// Drives one collection run over a transport.
pub struct Dispatcher<T: Transport> {
    transport: Arc<T>,
    policy: RetryPolicy,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: Arc<T>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    /// Run the full collection. Returns `Aborted` as soon as the abort
    /// channel fires, whether during the scheduled wait or mid-run.
    pub async fn run(
        &self,
        registry: &HostRegistry,
        request: Arc<CollectionRequest>,
        mut abort: watch::Receiver<bool>,
    ) -> RunOutcome {
        if let Some(fire_at) = request.scheduled_start {
            let delay = (fire_at - Local::now()).to_std().unwrap_or(Duration::ZERO);
            if delay.is_zero() {
                warn!(fire_at = %fire_at, "scheduled start is in the past, running immediately");
            } else {
                info!(
                    fire_at = %fire_at.format("%Y-%m-%d %H:%M:%S"),
                    delay_secs = delay.as_secs(),
                    "waiting for scheduled start"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wait_for_abort(&mut abort) => {
                        info!("aborted during scheduled wait, no host contacted");
                        return RunOutcome::Aborted;
                    }
                }
            }
        }

        info!(
            hosts = registry.len(),
            since = %request.since,
            concurrency = request.concurrency,
            sudo = request.sudo,
            "starting collection"
        );

        let redactor = Arc::new(Redactor::for_credential(&request.credential));
        let semaphore = Arc::new(Semaphore::new(request.concurrency.max(1)));
        let mut aggregator = ResultAggregator::new(
            registry.hosts().to_vec(),
            request.default_username.clone(),
            request.default_port,
            request.since,
        );

        let mut set: JoinSet<(usize, HostResult)> = JoinSet::new();
        for (slot, host) in registry.hosts().iter().cloned().enumerate() {
            let transport = Arc::clone(&self.transport);
            let request = Arc::clone(&request);
            let redactor = Arc::clone(&redactor);
            let semaphore = Arc::clone(&semaphore);
            let policy = self.policy;

            set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        // Abort closes the semaphore; queued hosts resolve
                        // without ever opening a session.
                        return (slot, cancelled(&host, &request));
                    }
                };

                let username = host.username_or(&request.default_username).to_string();
                let port = host.port_or(request.default_port);
                let (result, attempts) = run_with_retry(&policy, &host.name, || {
                    transport.run(&host, &request)
                })
                .await;

                let result = match result {
                    Ok(output) => {
                        info!(
                            host = %host.name,
                            attempts,
                            duration_ms = output.duration.as_millis() as u64,
                            "collection succeeded"
                        );
                        HostResult::from_success(&host, &username, port, &output, attempts, &redactor)
                    }
                    Err(err) => {
                        warn!(host = %host.name, attempts, error = %err, "collection failed");
                        HostResult::from_failure(&host, &username, port, &err, attempts, &redactor)
                    }
                };
                (slot, result)
            });
        }

        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    Some(Ok((slot, result))) => aggregator.insert(slot, result),
                    Some(Err(err)) => {
                        // Panicked worker; finalize fills its slot.
                        warn!(error = %err, "collection worker panicked");
                    }
                    None => break,
                },
                _ = wait_for_abort(&mut abort) => {
                    warn!("abort requested, cancelling in-flight sessions");
                    // Queued hosts first, so nothing new starts, then the
                    // in-flight tasks.
                    semaphore.close();
                    set.abort_all();
                    return RunOutcome::Aborted;
                }
            }
        }

        let report = aggregator.finalize();
        info!(
            ok = report.ok_count(),
            failed = report.failed_count(),
            "collection finished"
        );
        RunOutcome::Completed(report)
    }
}

fn cancelled(host: &crate::hosts::Host, request: &CollectionRequest) -> HostResult {
    let username = host.username_or(&request.default_username).to_string();
    let port = host.port_or(request.default_port);
    let err = crate::ssh::SessionError::Spawn {
        host: host.address.clone(),
        reason: "run cancelled before start".to_string(),
    };
    HostResult::from_failure(host, &username, port, &err, 0, &Redactor::default())
}

/// Resolve once the abort flag turns true; pend forever if the sender is
/// gone, so `select!` arms relying on this never fire spuriously.
async fn wait_for_abort(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credential;
    use crate::hosts::SinceCutoff;
    use crate::ssh::SessionError;
    use crate::testing::ScriptedTransport;
    use chrono::Duration as ChronoDuration;
    use std::path::PathBuf;

    fn request(concurrency: usize, max_retries: u32) -> Arc<CollectionRequest> {
        Arc::new(CollectionRequest {
            since: SinceCutoff::AllTime,
            sudo: false,
            script: "#!/bin/sh\n".to_string(),
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(120),
            max_retries,
            concurrency,
            scheduled_start: None,
            default_username: "admin".to_string(),
            default_port: 22,
            credential: Credential::KeyFile(PathBuf::from("/keys/fleet")),
        })
    }

    fn registry(names: &[&str]) -> HostRegistry {
        let text: String = names
            .iter()
            .enumerate()
            .map(|(i, name)| format!("{name}, 10.0.0.{}\n", i + 1))
            .collect();
        HostRegistry::from_str(&text).unwrap()
    }

    // The receiver pends forever once the sender is gone, so dropping the
    // sender immediately is a valid "never abort" signal.
    fn no_abort() -> watch::Receiver<bool> {
        let (_tx, rx) = watch::channel(false);
        rx
    }

    #[tokio::test]
    async fn concurrency_limit_is_respected() {
        let names: Vec<String> = (0..12).map(|i| format!("H{i:02}")).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let mut transport = ScriptedTransport::new();
        for name in &names {
            transport = transport.succeed_after(name, "0 SAOBO Errors -\n", Duration::from_millis(20));
        }
        let transport = Arc::new(transport);

        let dispatcher = Dispatcher::new(Arc::clone(&transport), RetryPolicy::with_max_retries(0));
        let outcome = dispatcher
            .run(&registry(&name_refs), request(3, 0), no_abort())
            .await;

        let report = match outcome {
            RunOutcome::Completed(report) => report,
            RunOutcome::Aborted => panic!("unexpected abort"),
        };
        assert_eq!(report.results().len(), 12);
        assert_eq!(report.ok_count(), 12);
        assert!(transport.max_concurrent() <= 3, "high water {}", transport.max_concurrent());
    }

    #[tokio::test]
    async fn report_is_registry_ordered_under_any_completion_order() {
        // Later hosts finish first thanks to descending delays.
        let transport = Arc::new(
            ScriptedTransport::new()
                .succeed_after("A1", "0 SAOBO Errors -\n", Duration::from_millis(60))
                .succeed_after("B2", "0 SAOBO Errors -\n", Duration::from_millis(30))
                .succeed("C3", "0 SAOBO Errors -\n"),
        );
        let dispatcher = Dispatcher::new(Arc::clone(&transport), RetryPolicy::with_max_retries(0));
        let outcome = dispatcher
            .run(&registry(&["A1", "B2", "C3"]), request(8, 0), no_abort())
            .await;

        let report = match outcome {
            RunOutcome::Completed(report) => report,
            RunOutcome::Aborted => panic!("unexpected abort"),
        };
        let names: Vec<&str> = report.results().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["A1", "B2", "C3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_fleet_outcome_matrix() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .fail(
                    "SLOW",
                    SessionError::Timeout {
                        host: "10.0.0.1".to_string(),
                        timeout_secs: 10,
                    },
                )
                .fail(
                    "LOCKED",
                    SessionError::Auth {
                        host: "10.0.0.2".to_string(),
                        user: "admin".to_string(),
                    },
                )
                .succeed("GOOD", "12 3220 2025-11-05T20:03:00\n0 SAOBO Errors -\n"),
        );
        let dispatcher = Dispatcher::new(Arc::clone(&transport), RetryPolicy::with_max_retries(2));
        let outcome = dispatcher
            .run(&registry(&["SLOW", "LOCKED", "GOOD"]), request(4, 2), no_abort())
            .await;

        let report = match outcome {
            RunOutcome::Completed(report) => report,
            RunOutcome::Aborted => panic!("unexpected abort"),
        };
        assert_eq!(report.results().len(), 3);

        let slow = &report.results()[0];
        assert!(!slow.ok);
        assert_eq!(slow.error_kind, Some("timeout"));
        assert_eq!(slow.attempts, 3); // retryable, budget exhausted

        let locked = &report.results()[1];
        assert!(!locked.ok);
        assert_eq!(locked.error_kind, Some("auth"));
        assert_eq!(locked.attempts, 1); // terminal on first sight

        let good = &report.results()[2];
        assert!(good.ok);
        assert_eq!(good.output, "12 3220 2025-11-05T20:03:00\n0 SAOBO Errors -\n");

        let summary = report.summary();
        assert_eq!(summary.emcy_events, 12);
        assert_eq!(summary.saobo_failures, 0);
        assert_eq!((summary.ok, summary.failed), (1, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn flaky_host_recovers_within_budget() {
        let transport = Arc::new(ScriptedTransport::new().flaky(
            "F1",
            2,
            SessionError::Refused {
                host: "10.0.0.1".to_string(),
                reason: "connection refused".to_string(),
            },
            "0 SAOBO Errors -\n",
        ));
        let dispatcher = Dispatcher::new(Arc::clone(&transport), RetryPolicy::with_max_retries(2));
        let outcome = dispatcher
            .run(&registry(&["F1"]), request(1, 2), no_abort())
            .await;

        let report = match outcome {
            RunOutcome::Completed(report) => report,
            RunOutcome::Aborted => panic!("unexpected abort"),
        };
        let result = &report.results()[0];
        assert!(result.ok);
        assert_eq!(result.attempts, 3);
        assert_eq!(transport.total_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn mid_run_abort_closes_the_permit_queue() {
        // Concurrency 1: SLOW holds the only permit, QUEUED waits on it.
        let transport = Arc::new(
            ScriptedTransport::new()
                .succeed_after("SLOW", "0 SAOBO Errors -\n", Duration::from_secs(3600))
                .succeed("QUEUED", "0 SAOBO Errors -\n"),
        );
        let dispatcher = Dispatcher::new(Arc::clone(&transport), RetryPolicy::with_max_retries(0));

        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn({
            let registry = registry(&["SLOW", "QUEUED"]);
            let req = request(1, 0);
            async move { dispatcher.run(&registry, req, rx).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).ok();

        let outcome = run.await.unwrap();
        assert!(matches!(outcome, RunOutcome::Aborted));
        // The queued host drained through the closed semaphore without
        // ever opening a session.
        assert_eq!(transport.total_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_during_scheduled_wait_contacts_nobody() {
        let transport = Arc::new(ScriptedTransport::new().succeed("A1", "0 SAOBO Errors -\n"));
        let mut req = (*request(1, 0)).clone();
        req.scheduled_start = Some(Local::now() + ChronoDuration::hours(1));
        let dispatcher = Dispatcher::new(Arc::clone(&transport), RetryPolicy::with_max_retries(0));

        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn({
            let registry = registry(&["A1"]);
            let req = Arc::new(req);
            async move { dispatcher.run(&registry, req, rx).await }
        });

        tokio::time::sleep(Duration::from_secs(60)).await;
        tx.send(true).ok();

        let outcome = run.await.unwrap();
        assert!(matches!(outcome, RunOutcome::Aborted));
        assert_eq!(transport.total_calls(), 0);
    }
}
