//! Status API tests, run against the router without binding a socket.


use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use ci_looper::dashboard::{router, DashboardState};
use ci_looper::protocol::SessionRegistry;
use test_harness::{commit_id, linear_history, machine_result, master, worker, TestScheduler, DEFINITIONS};

async fn scheduler_with_history() -> TestScheduler {
    let scheduler = TestScheduler::new(2);
    linear_history(&scheduler.source, &["a", "b"], DEFINITIONS).await;
    scheduler.refresh().await;
    scheduler
}

fn app(scheduler: &TestScheduler) -> Router {
    router(DashboardState {
        manager: scheduler.manager.clone(),
        registry: Arc::new(SessionRegistry::new()),
    })
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

async fn post_json(app: Router, uri: &str, payload: Value) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_status_summary() {
    let scheduler = scheduler_with_history().await;

    let (status, json) = get_json(app(&scheduler), "/api/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["branches"], 1);
    assert_eq!(json["commits"], 2);
    assert_eq!(json["commitsPendingDefinitions"], 0);
    assert_eq!(json["runningTests"], 0);
    assert_eq!(json["sessions"], 0);
}

#[tokio::test]
async fn test_branches_list_commits_newest_first() {
    let scheduler = scheduler_with_history().await;

    let (status, json) = get_json(app(&scheduler), "/api/branches").await;
    assert_eq!(status, StatusCode::OK);

    let branches = json.as_array().unwrap();
    assert_eq!(branches.len(), 1);
    assert_eq!(branches[0]["branch"], "repo/master");
    assert_eq!(branches[0]["deepTest"], true);

    let commits = branches[0]["commits"].as_array().unwrap();
    assert_eq!(commits.len(), 2);
    assert_eq!(commits[0]["commitId"], "repo/b");
    assert_eq!(commits[0]["needsBuild"], true);
    assert_eq!(commits[1]["commitId"], "repo/a");
}

#[tokio::test]
async fn test_lookup_and_clear_a_run() {
    let scheduler = scheduler_with_history().await;
    let test_id = {
        let mut manager = scheduler.manager.lock().await;
        let task = manager.get_task(&worker("m1", "10.0.0.1")).unwrap();
        manager.record_machine_result(machine_result("m1", &task.commit_id, &task.record.test_id, true));
        task.record.test_id
    };

    let (status, json) = get_json(app(&scheduler), &format!("/api/tests/{test_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["testName"], "build");
    assert_eq!(json["commitId"], "repo/b");
    assert_eq!(json["machine"], "m1");

    let (status, json) = post_json(
        app(&scheduler),
        "/api/clear",
        json!({"commitId": "repo/b", "testId": test_id}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);

    let (status, _) = get_json(app(&scheduler), &format!("/api/tests/{test_id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(scheduler
        .manager
        .lock()
        .await
        .commit(&commit_id("b"))
        .unwrap()
        .needs_build());
}

#[tokio::test]
async fn test_clear_unknown_commit_is_not_found() {
    let scheduler = scheduler_with_history().await;

    let (status, json) = post_json(app(&scheduler), "/api/clear", json!({"commitId": "repo/zzz"})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["success"], false);
    assert!(json["error"].as_str().unwrap().contains("repo/zzz"));
}

#[tokio::test]
async fn test_targeting_updates_branch() {
    let scheduler = scheduler_with_history().await;

    let (status, json) = post_json(
        app(&scheduler),
        "/api/targeting",
        json!({"branch": "repo/master", "tests": ["unit"], "commitIds": ["repo/a"], "deepTest": false}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);

    let manager = scheduler.manager.lock().await;
    let branch = manager.branch(&master()).unwrap();
    assert!(!branch.is_deep_test());
    assert_eq!(branch.targeted_tests(), ["unit".to_string()]);
    let commit = manager.commit(&commit_id("a")).unwrap();
    assert!(manager.is_targeted_commit_and_test(commit, "unit"));
    let other = manager.commit(&commit_id("b")).unwrap();
    assert!(!manager.is_targeted_commit_and_test(other, "unit"));
}

#[tokio::test]
async fn test_targeting_unknown_branch_is_not_found() {
    let scheduler = scheduler_with_history().await;

    let (status, _) = post_json(
        app(&scheduler),
        "/api/targeting",
        json!({"branch": "repo/nope", "deepTest": true}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
