mod common;

use common::MockHttpServer;
use serde_json::{json, Value};
use stackrun::backend::{
    launch_run, BackendError, BackendRunStatus, ConfigVersionStatus, PlanBackend, RunOptions,
    RunStage, TfeClient, TfeClientOptions,
};
use stackrun::shared::{EventLog, PollPolicy, RetryPolicy};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TOKEN: &str = "at-test-token";

fn client(base_url: &str) -> TfeClient {
    TfeClient::new(
        TfeClientOptions {
            api_url: format!("{base_url}/api/v2/"),
            organization: "acme".to_string(),
            token: TOKEN.to_string(),
            request_timeout: Duration::from_secs(5),
            max_retries: 0,
            retry_delay: Duration::from_millis(1),
            run_poll: PollPolicy::new(Duration::from_millis(1), Duration::from_secs(2)),
            config_poll: PollPolicy::new(Duration::from_millis(1), Duration::from_secs(2)),
        },
        EventLog::disabled(),
    )
    .expect("client")
}

fn data(id: &str, attributes: Value) -> String {
    json!({"data": {"id": id, "attributes": attributes}}).to_string()
}

#[test]
fn plan_launch_walks_the_configuration_version_flow() {
    let base = Arc::new(Mutex::new(String::new()));
    let base_for_server = Arc::clone(&base);
    let server = MockHttpServer::start(6, move |method, path| {
        let base = base_for_server.lock().expect("base").clone();
        match (method, path) {
            ("GET", "/api/v2/organizations/acme/workspaces/ws-1") => {
                (200, data("ws-abc", json!({"name": "ws-1"})))
            }
            ("POST", "/api/v2/workspaces/ws-abc/configuration-versions") => (
                201,
                data("cv-1", json!({"upload-url": format!("{base}/upload/cv-1")})),
            ),
            ("PUT", "/upload/cv-1") => (200, String::new()),
            ("GET", "/api/v2/configuration-versions/cv-1") => {
                (200, data("cv-1", json!({"status": "uploaded"})))
            }
            ("POST", "/api/v2/runs") => (201, data("run-9", json!({"status": "pending"}))),
            ("GET", "/api/v2/runs/run-9") => (200, data("run-9", json!({"status": "planned"}))),
            _ => (404, r#"{"errors":[{"title":"not found"}]}"#.to_string()),
        }
    });
    *base.lock().expect("base") = server.base_url.clone();

    let tfe = client(&server.base_url);
    let workspace_id = tfe.resolve_workspace("ws-1").expect("workspace");
    assert_eq!(workspace_id, "ws-abc");
    let launched = launch_run(
        &tfe,
        &workspace_id,
        b"bundle-bytes",
        &RunOptions {
            auto_apply: false,
            message: "stackrun plan for r1".to_string(),
        },
        RetryPolicy::once(),
    )
    .expect("launch");
    assert_eq!(launched.config_version_id, "cv-1");
    assert_eq!(launched.run_id, "run-9");
    let status = tfe
        .wait_for_completion(&launched.run_id, RunStage::Plan)
        .expect("settles");
    assert_eq!(status, BackendRunStatus::Planned);

    let requests = server.finish();
    let auth = format!("Bearer {TOKEN}");
    for request in &requests {
        if request.path.starts_with("/upload/") {
            assert!(request.auth_header.is_empty(), "upload URL carries its own auth");
            assert_eq!(request.body, "bundle-bytes");
        } else {
            assert_eq!(request.auth_header, auth, "{}", request.path);
        }
    }
    let create_run: Value = serde_json::from_str(&requests[4].body).expect("run payload");
    assert_eq!(create_run["data"]["attributes"]["auto-apply"], json!(false));
    assert_eq!(
        create_run["data"]["relationships"]["configuration-version"]["data"]["id"],
        json!("cv-1")
    );
}

#[test]
fn still_processing_conflicts_are_classified() {
    let server = MockHttpServer::start(1, |_, _| {
        (
            422,
            r#"{"errors":[{"title":"invalid run","detail":"Configuration version is still being processed"}]}"#
                .to_string(),
        )
    });
    let tfe = client(&server.base_url);
    let err = tfe
        .create_run(
            "ws-abc",
            "cv-1",
            &RunOptions {
                auto_apply: true,
                message: "apply".to_string(),
            },
        )
        .expect_err("still processing");
    assert!(err.is_still_processing(), "{err}");
    server.finish();
}

#[test]
fn missing_workspaces_surface_as_not_found() {
    let server = MockHttpServer::start(1, |_, _| {
        (404, r#"{"errors":[{"status":"404","title":"not found"}]}"#.to_string())
    });
    let tfe = client(&server.base_url);
    let err = tfe.resolve_workspace("ghost").expect_err("missing");
    assert!(err.is_not_found());
    assert!(!err.is_unavailable());
    assert_eq!(err.status_code(), Some(404));
    server.finish();
}

#[test]
fn errored_configuration_versions_stop_the_wait() {
    let server = MockHttpServer::start(2, |_, path| {
        if path.ends_with("/cv-2") {
            (200, data("cv-2", json!({"status": "errored"})))
        } else {
            (200, data("cv-1", json!({"status": "pending"})))
        }
    });
    let tfe = client(&server.base_url);
    assert_eq!(
        tfe.config_version_status("cv-1").expect("status"),
        ConfigVersionStatus::Pending
    );
    let err = tfe.wait_for_configuration("cv-2").expect_err("errored");
    assert!(matches!(err, BackendError::ConfigVersionFailed { .. }), "{err}");
    server.finish();
}

#[test]
fn plan_output_follows_the_log_read_url_and_apply_confirms() {
    let base = Arc::new(Mutex::new(String::new()));
    let base_for_server = Arc::clone(&base);
    let server = MockHttpServer::start(3, move |method, path| {
        let base = base_for_server.lock().expect("base").clone();
        match (method, path) {
            ("GET", "/api/v2/runs/run-9/plan") => (
                200,
                data("plan-1", json!({"log-read-url": format!("{base}/logs/plan-1")})),
            ),
            ("GET", "/logs/plan-1") => (200, "Plan: 2 to add".to_string()),
            ("POST", "/api/v2/runs/run-9/actions/apply") => (202, String::new()),
            _ => (404, String::new()),
        }
    });
    *base.lock().expect("base") = server.base_url.clone();

    let tfe = client(&server.base_url);
    assert_eq!(tfe.plan_output("run-9").expect("output"), "Plan: 2 to add");
    tfe.apply("run-9", "stackrun apply for r1").expect("apply");

    let requests = server.finish();
    let apply: Value = serde_json::from_str(&requests[2].body).expect("apply payload");
    assert_eq!(apply["comment"], json!("stackrun apply for r1"));
}

#[test]
fn unreachable_backends_are_unavailable() {
    let tfe = client("http://127.0.0.1:9");
    let err = tfe.run_status("run-1").expect_err("connection refused");
    assert!(err.is_unavailable(), "{err}");
}
