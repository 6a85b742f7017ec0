mod common;

use common::{blueprint, harness, postgres_blueprint};
use serde_json::json;
use stackrun::orchestration::RunState;
use stackrun::runtime::{drain_submitted_once, run_worker};
use stackrun::shared::EventLog;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn drain_builds_submitted_runs_and_parks_failures() {
    let h = harness();
    h.orchestrator
        .submit_as("a", postgres_blueprint("ws-a"))
        .expect("submit");
    h.orchestrator
        .submit_as("b", blueprint(json!({"kind": "mainframe"})))
        .expect("submit");
    h.orchestrator
        .submit_as("c", postgres_blueprint("ws-c"))
        .expect("submit");

    let first = drain_submitted_once(&h.orchestrator, 10).expect("drain");
    assert_eq!(first.built, vec!["a".to_string(), "c".to_string()]);
    assert_eq!(first.failed.len(), 1);
    assert_eq!(first.failed[0].run_id, "b");

    let second = drain_submitted_once(&h.orchestrator, 10).expect("drain again");
    assert!(second.built.is_empty());
    assert!(second.failed.is_empty(), "failed builds are not retried automatically");
    assert_eq!(
        h.orchestrator.status("b").expect("status").state,
        RunState::Submitted
    );
}

#[test]
fn drain_respects_the_limit() {
    let h = harness();
    for run_id in ["r1", "r2", "r3"] {
        h.orchestrator
            .submit_as(run_id, postgres_blueprint(run_id))
            .expect("submit");
    }
    let report = drain_submitted_once(&h.orchestrator, 2).expect("drain");
    assert_eq!(report.built.len(), 2);
    assert_eq!(
        h.orchestrator
            .runs_in_state(RunState::Submitted)
            .expect("submitted")
            .len(),
        1
    );
}

#[test]
fn worker_loop_exits_when_stopped() {
    let h = Arc::new(harness());
    h.orchestrator
        .submit_as("r1", postgres_blueprint("ws-1"))
        .expect("submit");
    let stop = Arc::new(AtomicBool::new(false));

    let worker = {
        let h = Arc::clone(&h);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            run_worker(
                &h.orchestrator,
                &EventLog::disabled(),
                &stop,
                Duration::from_millis(50),
                10,
            )
        })
    };
    thread::sleep(Duration::from_millis(300));
    stop.store(true, Ordering::Relaxed);
    let built = worker.join().expect("worker thread");

    assert_eq!(built, 1);
    assert_eq!(
        h.orchestrator.status("r1").expect("status").state,
        RunState::Built
    );
}
