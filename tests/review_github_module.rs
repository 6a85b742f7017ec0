mod common;

use common::{MockHttpServer, SHA};
use serde_json::{json, Value};
use stackrun::review::{
    CheckConclusion, CheckOutput, CheckTarget, GithubChecksClient, GithubChecksOptions,
    ReviewChecks, ReviewError,
};
use stackrun::shared::EventLog;
use std::time::Duration;

fn client(base_url: &str) -> GithubChecksClient {
    GithubChecksClient::new(
        GithubChecksOptions {
            api_url: format!("{base_url}/"),
            token: "ghp_test".to_string(),
            details_url: Some("https://ci.example.com/runs".to_string()),
            request_timeout: Duration::from_secs(5),
            max_retries: 0,
            retry_delay: Duration::from_millis(1),
        },
        EventLog::disabled(),
    )
    .expect("client")
}

#[test]
fn check_is_opened_in_progress_then_completed() {
    let server = MockHttpServer::start(2, |method, _| match method {
        "POST" => (201, json!({"id": 77, "status": "in_progress"}).to_string()),
        _ => (200, json!({"id": 77, "status": "completed"}).to_string()),
    });
    let github = client(&server.base_url);
    let target = CheckTarget::parse(&format!("github:acme/infra@{SHA}")).expect("target");

    let handle = github.create_check(&target, "stackrun/plan").expect("create");
    assert_eq!(handle.id, 77);
    github
        .update_check(
            &handle,
            CheckConclusion::Failure,
            &CheckOutput {
                title: "Plan failed".to_string(),
                summary: "backend returned 500".to_string(),
            },
        )
        .expect("update");

    let requests = server.finish();
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].path, "/repos/acme/infra/check-runs");
    assert_eq!(requests[0].auth_header, "Bearer ghp_test");
    let created: Value = serde_json::from_str(&requests[0].body).expect("create payload");
    assert_eq!(created["head_sha"], json!(SHA));
    assert_eq!(created["status"], json!("in_progress"));
    assert_eq!(created["details_url"], json!("https://ci.example.com/runs"));

    assert_eq!(requests[1].method, "PATCH");
    assert_eq!(requests[1].path, "/repos/acme/infra/check-runs/77");
    let updated: Value = serde_json::from_str(&requests[1].body).expect("update payload");
    assert_eq!(updated["conclusion"], json!("failure"));
    assert_eq!(updated["output"]["title"], json!("Plan failed"));
}

#[test]
fn rejected_requests_carry_the_status() {
    let server = MockHttpServer::start(1, |_, _| (422, r#"{"message":"No commit found"}"#.to_string()));
    let github = client(&server.base_url);
    let target = CheckTarget::parse(&format!("github:acme/infra@{SHA}")).expect("target");
    match github.create_check(&target, "stackrun/plan") {
        Err(ReviewError::Status { status, message }) => {
            assert_eq!(status, 422);
            assert!(message.contains("No commit found"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    server.finish();
}

#[test]
fn malformed_targets_never_reach_the_api() {
    assert!(matches!(
        CheckTarget::parse("github:acme/infra@not-a-sha"),
        Err(ReviewError::InvalidSha { .. })
    ));
    assert!(matches!(
        CheckTarget::parse("gitlab:acme/infra@abcdef1"),
        Err(ReviewError::InvalidTarget { .. })
    ));
}
