//! Per-host outcomes, slot-ordered aggregation, and the text reporter.
//!
//! Results arrive in completion order but are stored by registry slot, so
//! the finished report always reads in the same order as the targets file.

use crate::hosts::{Host, SinceCutoff};
use crate::parse::parse_processor_output;
use crate::redact::Redactor;
use crate::ssh::{SessionError, SessionOutput};
use chrono::{DateTime, Local};
use std::fmt::Write as _;
use tracing::warn;

/// Final outcome for one host, credential-scrubbed at construction.
#[derive(Debug, Clone)]
pub struct HostResult {
    pub name: String,
    pub address: String,
    pub username: String,
    pub port: u16,
    pub ok: bool,
    /// Captured processor stdout on success, empty otherwise.
    pub output: String,
    /// Failure message, empty on success.
    pub error: String,
    /// Stable failure kind label, `None` on success.
    pub error_kind: Option<&'static str>,
    /// Remote exit status when the session produced one.
    pub exit_status: Option<i32>,
    /// Total session attempts, including the successful or final one.
    pub attempts: u32,
}

impl HostResult {
    pub fn from_success(
        host: &Host,
        username: &str,
        port: u16,
        output: &SessionOutput,
        attempts: u32,
        redactor: &Redactor,
    ) -> Self {
        Self {
            name: host.name.clone(),
            address: host.address.clone(),
            username: username.to_string(),
            port,
            ok: true,
            output: redactor.scrub(&output.stdout),
            error: String::new(),
            error_kind: None,
            exit_status: Some(output.exit_status),
            attempts,
        }
    }

    pub fn from_failure(
        host: &Host,
        username: &str,
        port: u16,
        error: &SessionError,
        attempts: u32,
        redactor: &Redactor,
    ) -> Self {
        Self {
            name: host.name.clone(),
            address: host.address.clone(),
            username: username.to_string(),
            port,
            ok: false,
            output: String::new(),
            error: redactor.scrub(&error.to_string()),
            error_kind: Some(error.kind()),
            exit_status: error.exit_status(),
            attempts,
        }
    }

    /// Outcome for a host whose worker never reported back (task panic).
    fn internal_failure(host: &Host, username: &str, port: u16) -> Self {
        Self {
            name: host.name.clone(),
            address: host.address.clone(),
            username: username.to_string(),
            port,
            ok: false,
            output: String::new(),
            error: "collection worker terminated without a result".to_string(),
            error_kind: Some("internal"),
            exit_status: None,
            attempts: 0,
        }
    }
}

/// Collects completion-ordered results into registry order.
#[derive(Debug)]
pub struct ResultAggregator {
    hosts: Vec<Host>,
    slots: Vec<Option<HostResult>>,
    default_username: String,
    default_port: u16,
    since: SinceCutoff,
    started_at: DateTime<Local>,
}

impl ResultAggregator {
    pub fn new(
        hosts: Vec<Host>,
        default_username: String,
        default_port: u16,
        since: SinceCutoff,
    ) -> Self {
        let slots = vec![None; hosts.len()];
        Self {
            hosts,
            slots,
            default_username,
            default_port,
            since,
            started_at: Local::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Store a result in its registry slot. Write-once: a second insert for
    /// the same slot keeps the first and logs the violation.
    pub fn insert(&mut self, slot: usize, result: HostResult) {
        match self.slots.get_mut(slot) {
            Some(cell @ None) => *cell = Some(result),
            Some(_) => {
                warn!(slot, host = %result.name, "duplicate result for slot, keeping first");
            }
            None => {
                warn!(slot, host = %result.name, "result for unknown slot dropped");
            }
        }
    }

    /// Seal the report. Any slot left empty gets an internal-failure result
    /// so the report length always equals the registry length.
    pub fn finalize(mut self) -> AggregateReport {
        let mut results = Vec::with_capacity(self.hosts.len());
        for (slot, cell) in self.slots.drain(..).enumerate() {
            match cell {
                Some(result) => results.push(result),
                None => {
                    let host = &self.hosts[slot];
                    warn!(host = %host.name, "no result reported, recording internal failure");
                    let username = host.username_or(&self.default_username);
                    let port = host.port_or(self.default_port);
                    results.push(HostResult::internal_failure(host, username, port));
                }
            }
        }
        AggregateReport {
            results,
            since: self.since,
            started_at: self.started_at,
        }
    }
}

/// Immutable, registry-ordered outcome of one collection run.
#[derive(Debug, Clone)]
pub struct AggregateReport {
    results: Vec<HostResult>,
    since: SinceCutoff,
    started_at: DateTime<Local>,
}

/// Fleet-wide tallies derived from successful processor outputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub attempted: usize,
    pub ok: usize,
    pub failed: usize,
    pub emcy_events: u64,
    pub saobo_failures: u64,
    /// Hosts that succeeded but whose output did not parse.
    pub unparsed: usize,
}

impl AggregateReport {
    pub fn results(&self) -> &[HostResult] {
        &self.results
    }

    pub fn since(&self) -> &SinceCutoff {
        &self.since
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn ok_count(&self) -> usize {
        self.results.iter().filter(|r| r.ok).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.len() - self.ok_count()
    }

    /// Tally events across hosts from the processors' structured lines.
    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            attempted: self.results.len(),
            ..RunSummary::default()
        };
        for result in &self.results {
            if !result.ok {
                summary.failed += 1;
                continue;
            }
            summary.ok += 1;
            match parse_processor_output(&result.output) {
                Ok(report) => {
                    summary.emcy_events += report.emcy_events();
                    summary.saobo_failures += report.failures.count;
                }
                Err(err) => {
                    summary.unparsed += 1;
                    warn!(host = %result.name, error = %err, "unparseable processor output");
                }
            }
        }
        summary
    }

    /// Render the human-readable console report.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "fault log collection, {} host(s), since {}",
            self.results.len(),
            self.since
        );
        let _ = writeln!(out, "started {}", self.started_at.format("%Y-%m-%d %H:%M:%S"));

        for result in &self.results {
            let _ = writeln!(out);
            let _ = writeln!(out, "===== {} ({}) =====", result.name, result.address);
            if result.ok {
                let body = result.output.trim_end();
                if body.is_empty() {
                    let _ = writeln!(out, "(no output)");
                } else {
                    let _ = writeln!(out, "{body}");
                }
            } else {
                let kind = result.error_kind.unwrap_or("error");
                let _ = writeln!(out, "FAILED ({kind}): {}", result.error);
            }
            if result.attempts > 1 {
                let _ = writeln!(out, "({} attempts)", result.attempts);
            }
        }

        let summary = self.summary();
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "summary: {} ok, {} failed of {} | {} EMCY events, {} SAOBO failures",
            summary.ok, summary.failed, summary.attempted, summary.emcy_events,
            summary.saobo_failures
        );
        if summary.unparsed > 0 {
            let _ = writeln!(out, "warning: {} host(s) returned unparseable output", summary.unparsed);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credential;
    use std::time::Duration;

    fn host(name: &str, address: &str) -> Host {
        Host {
            name: name.to_string(),
            address: address.to_string(),
            username: None,
            port: None,
        }
    }

    fn success(host: &Host, stdout: &str, attempts: u32) -> HostResult {
        let output = SessionOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_status: 0,
            duration: Duration::from_millis(80),
        };
        HostResult::from_success(host, "admin", 22, &output, attempts, &Redactor::default())
    }

    fn aggregator(hosts: Vec<Host>) -> ResultAggregator {
        ResultAggregator::new(hosts, "admin".to_string(), 22, SinceCutoff::AllTime)
    }

    #[test]
    fn report_order_matches_registry_not_completion() {
        let hosts = vec![host("A", "1.1.1.1"), host("B", "2.2.2.2"), host("C", "3.3.3.3")];
        let mut agg = aggregator(hosts.clone());
        agg.insert(2, success(&hosts[2], "0 SAOBO Errors -\n", 1));
        agg.insert(0, success(&hosts[0], "0 SAOBO Errors -\n", 1));
        agg.insert(1, success(&hosts[1], "0 SAOBO Errors -\n", 1));

        let report = agg.finalize();
        let names: Vec<&str> = report.results().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
    }

    #[test]
    fn missing_slots_become_internal_failures() {
        let hosts = vec![host("A", "1.1.1.1"), host("B", "2.2.2.2")];
        let mut agg = aggregator(hosts.clone());
        agg.insert(0, success(&hosts[0], "0 SAOBO Errors -\n", 1));

        let report = agg.finalize();
        assert_eq!(report.results().len(), 2);
        let b = &report.results()[1];
        assert!(!b.ok);
        assert_eq!(b.error_kind, Some("internal"));
        assert_eq!(report.failed_count(), 1);
    }

    #[test]
    fn duplicate_insert_keeps_the_first() {
        let hosts = vec![host("A", "1.1.1.1")];
        let mut agg = aggregator(hosts.clone());
        agg.insert(0, success(&hosts[0], "first\n0 SAOBO Errors -\n", 1));
        agg.insert(0, success(&hosts[0], "second\n0 SAOBO Errors -\n", 1));

        let report = agg.finalize();
        assert!(report.results()[0].output.starts_with("first"));
    }

    #[test]
    fn summary_tallies_structured_lines() {
        let hosts = vec![host("A", "1.1.1.1"), host("B", "2.2.2.2"), host("C", "3.3.3.3")];
        let mut agg = aggregator(hosts.clone());
        agg.insert(
            0,
            success(&hosts[0], "12 3220 2025-11-05T20:03:00\n0 SAOBO Errors -\n", 1),
        );
        agg.insert(
            1,
            success(&hosts[1], "2 FF01 2025-11-04T09:00:12\n5 SAOBO Errors 2025-11-04T10:00:00\n", 2),
        );
        let err = SessionError::Auth {
            host: "3.3.3.3".to_string(),
            user: "admin".to_string(),
        };
        agg.insert(
            2,
            HostResult::from_failure(&hosts[2], "admin", 22, &err, 1, &Redactor::default()),
        );

        let summary = agg.finalize().summary();
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.ok, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.emcy_events, 14);
        assert_eq!(summary.saobo_failures, 5);
        assert_eq!(summary.unparsed, 0);
    }

    #[test]
    fn failure_results_are_scrubbed() {
        let h = host("A", "1.1.1.1");
        let redactor = Redactor::for_credential(&Credential::Password("hunter2".to_string()));
        let err = SessionError::NonZeroExit {
            host: "1.1.1.1".to_string(),
            exit_status: 1,
            stderr: "echoed hunter2 back".to_string(),
        };
        let result = HostResult::from_failure(&h, "admin", 22, &err, 1, &redactor);
        assert!(!result.error.contains("hunter2"));
        assert!(result.error.contains("[redacted]"));
        assert_eq!(result.exit_status, Some(1));
    }

    #[test]
    fn render_shows_sections_and_summary() {
        let hosts = vec![host("PS1204", "10.40.2.15"), host("PS1301", "10.40.3.11")];
        let mut agg = aggregator(hosts.clone());
        agg.insert(
            0,
            success(&hosts[0], "12 3220 2025-11-05T20:03:00\n0 SAOBO Errors -\n", 1),
        );
        let err = SessionError::Timeout {
            host: "10.40.3.11".to_string(),
            timeout_secs: 10,
        };
        agg.insert(
            1,
            HostResult::from_failure(&hosts[1], "admin", 22, &err, 3, &Redactor::default()),
        );

        let text = agg.finalize().render();
        assert!(text.contains("===== PS1204 (10.40.2.15) ====="));
        assert!(text.contains("12 3220 2025-11-05T20:03:00"));
        assert!(text.contains("===== PS1301 (10.40.3.11) ====="));
        assert!(text.contains("FAILED (timeout):"));
        assert!(text.contains("(3 attempts)"));
        assert!(text.contains("1 ok, 1 failed of 2"));
        assert!(text.contains("12 EMCY events, 0 SAOBO failures"));
    }
}
