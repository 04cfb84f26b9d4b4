//! End-to-end collection runs over the scripted in-process transport:
//! targets file in, rendered report and JSON document out.

use fsweep::testing::ScriptedTransport;
use fsweep::{
    parse_processor_output, CollectionRequest, Credential, Dispatcher, HostRegistry, RetryPolicy,
    RunOutcome, SessionError, SinceCutoff,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn request(registry: &HostRegistry, max_retries: u32) -> Arc<CollectionRequest> {
    Arc::new(CollectionRequest {
        since: registry.since(),
        sudo: false,
        script: fsweep::default_script(),
        connect_timeout: Duration::from_secs(10),
        command_timeout: Duration::from_secs(120),
        max_retries,
        concurrency: 8,
        scheduled_start: None,
        default_username: "admin".to_string(),
        default_port: 22,
        credential: Credential::KeyFile(PathBuf::from("/keys/fleet")),
    })
}

fn no_abort() -> watch::Receiver<bool> {
    let (_tx, rx) = watch::channel(false);
    rx
}

#[tokio::test(start_paused = true)]
async fn mixed_fleet_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let targets = dir.path().join("fleet.txt");
    std::fs::write(
        &targets,
        "SINCE=202511052000\n\
         # bench row A\n\
         PS1204, 10.40.2.15\n\
         PS1301, 10.40.3.11\n\
         PS1311, 10.40.2.31, service, 2222\n",
    )
    .unwrap();

    let registry = HostRegistry::from_path(&targets).unwrap();
    assert_eq!(registry.since().remote_arg(), "202511052000");

    let transport = Arc::new(
        ScriptedTransport::new()
            .succeed("PS1204", "12 3220 2025-11-05T20:03:00\n0 SAOBO Errors -\n")
            .fail(
                "PS1301",
                SessionError::Timeout {
                    host: "10.40.3.11".to_string(),
                    timeout_secs: 10,
                },
            )
            .fail(
                "PS1311",
                SessionError::Auth {
                    host: "10.40.2.31".to_string(),
                    user: "service".to_string(),
                },
            ),
    );

    let dispatcher = Dispatcher::new(Arc::clone(&transport), RetryPolicy::with_max_retries(2));
    let outcome = dispatcher
        .run(&registry, request(&registry, 2), no_abort())
        .await;
    let report = match outcome {
        RunOutcome::Completed(report) => report,
        RunOutcome::Aborted => panic!("unexpected abort"),
    };

    // One result per registry entry, in registry order.
    assert_eq!(report.results().len(), registry.len());
    let names: Vec<&str> = report.results().iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["PS1204", "PS1301", "PS1311"]);

    let good = &report.results()[0];
    assert!(good.ok);
    assert_eq!(good.attempts, 1);
    let parsed = parse_processor_output(&good.output).unwrap();
    assert_eq!(parsed.faults[0].count, 12);
    assert_eq!(parsed.faults[0].code, "3220");
    assert_eq!(parsed.faults[0].last_seen, "2025-11-05T20:03:00");
    assert_eq!(parsed.failures.count, 0);

    let slow = &report.results()[1];
    assert!(!slow.ok);
    assert_eq!(slow.error_kind, Some("timeout"));
    assert_eq!(slow.attempts, 3);

    let locked = &report.results()[2];
    assert!(!locked.ok);
    assert_eq!(locked.error_kind, Some("auth"));
    assert_eq!(locked.attempts, 1);
    assert_eq!(locked.username, "service");
    assert_eq!(locked.port, 2222);

    let rendered = report.render();
    assert!(rendered.contains("===== PS1204 (10.40.2.15) ====="));
    assert!(rendered.contains("FAILED (timeout)"));
    assert!(rendered.contains("FAILED (auth)"));
    assert!(rendered.contains("1 ok, 2 failed of 3"));

    // JSON export lands atomically next to the targets file.
    let json_path = dir.path().join("fleet.json");
    fsweep::write_json(&report, &json_path).unwrap();
    let rows: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&json_path).unwrap()).unwrap();
    assert_eq!(rows.as_array().unwrap().len(), 3);
    assert_eq!(rows[0]["name"], "PS1204");
    assert_eq!(rows[0]["ok"], true);
    assert!(rows[0]["error"].is_null());
    assert_eq!(rows[2]["port"], 2222);
    assert_eq!(rows[2]["ok"], false);
    assert!(rows[2]["output"].is_null());
}

#[tokio::test]
async fn all_time_registry_collects_with_zero_cutoff() {
    let registry = HostRegistry::from_str("BENCH, 10.1.1.1\n").unwrap();
    assert_eq!(registry.since(), SinceCutoff::AllTime);

    let transport =
        Arc::new(ScriptedTransport::new().succeed("BENCH", "0 SAOBO Errors -\n"));
    let dispatcher = Dispatcher::new(Arc::clone(&transport), RetryPolicy::with_max_retries(0));
    let req = request(&registry, 0);
    assert_eq!(req.since.remote_arg(), "0");

    let outcome = dispatcher.run(&registry, req, no_abort()).await;
    let report = match outcome {
        RunOutcome::Completed(report) => report,
        RunOutcome::Aborted => panic!("unexpected abort"),
    };
    assert_eq!(report.failed_count(), 0);
    let summary = report.summary();
    assert_eq!(summary.emcy_events, 0);
    assert_eq!(summary.saobo_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn mid_run_abort_discards_partial_results() {
    let registry = HostRegistry::from_str("FAST, 10.1.1.1\nSLOW, 10.1.1.2\n").unwrap();
    let transport = Arc::new(
        ScriptedTransport::new()
            .succeed("FAST", "0 SAOBO Errors -\n")
            .succeed_after("SLOW", "0 SAOBO Errors -\n", Duration::from_secs(3600)),
    );
    let dispatcher = Dispatcher::new(Arc::clone(&transport), RetryPolicy::with_max_retries(0));

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn({
        let req = request(&registry, 0);
        async move { dispatcher.run(&registry, req, rx).await }
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    tx.send(true).unwrap();

    let outcome = handle.await.unwrap();
    assert!(matches!(outcome, RunOutcome::Aborted));
}
