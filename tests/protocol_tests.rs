//! Worker protocol tests over real TCP connections.


use std::time::Duration;

use tokio::net::TcpStream;

use ci_looper::model::HeartbeatResponse;
use ci_looper::protocol::{
    FrameStream, MALFORMED_REQUEST, PROTOCOL_MATCH, PROTOCOL_VERSION, UNKNOWN_REQUEST,
    VERSION_MISMATCH,
};
use ci_looper::worker::HeartbeatSender;
use test_harness::{
    commit_id, linear_history, machine_result, wait_for, worker, TestScheduler, TestServer,
    DEFINITIONS,
};

async fn raw_connection(server: &TestServer) -> FrameStream<TcpStream> {
    let stream = TcpStream::connect(server.addr).await.unwrap();
    FrameStream::new(stream)
}

#[tokio::test]
async fn test_handshake_registers_session() {
    let scheduler = TestScheduler::new(1);
    let server = TestServer::start(scheduler.manager.clone()).await;

    let client = server.client().await;
    let registry = server.registry.clone();
    assert!(wait_for(Duration::from_secs(2), || registry.len() == 1).await);

    client.close().await.unwrap();
    assert!(wait_for(Duration::from_secs(2), || registry.is_empty()).await);

    server.shutdown().await;
}

#[tokio::test]
async fn test_version_mismatch_closes_connection() {
    let scheduler = TestScheduler::new(1);
    let server = TestServer::start(scheduler.manager.clone()).await;

    let mut frames = raw_connection(&server).await;
    frames.send("0.0.1").await.unwrap();
    assert_eq!(frames.recv().await.unwrap().as_deref(), Some(VERSION_MISMATCH));
    assert!(frames.recv().await.unwrap_or(None).is_none());

    let mut frames = raw_connection(&server).await;
    frames.send(PROTOCOL_VERSION).await.unwrap();
    assert_eq!(frames.recv().await.unwrap().as_deref(), Some(PROTOCOL_MATCH));

    server.shutdown().await;
}

#[tokio::test]
async fn test_get_task_without_work_returns_none() {
    let scheduler = TestScheduler::new(1);
    let server = TestServer::start(scheduler.manager.clone()).await;

    let mut client = server.client().await;
    let task = client.get_task(&worker("m1", "10.0.0.1")).await.unwrap();
    assert!(task.is_none());

    let sessions = server.registry.find_by_machine("m1");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].requests, 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_task_heartbeat_and_result_round_trip() {
    let scheduler = TestScheduler::new(1);
    linear_history(&scheduler.source, &["a"], DEFINITIONS).await;
    scheduler.refresh().await;
    let server = TestServer::start(scheduler.manager.clone()).await;

    let mut client = server.client().await;
    let task = client
        .get_task(&worker("m1", "10.0.0.1"))
        .await
        .unwrap()
        .expect("build should be offered");
    assert_eq!(task.commit_id, commit_id("a"));
    assert_eq!(task.test_name, "build");

    let answer = client
        .heartbeat(&task.commit_id, &task.test_id, "m1")
        .await
        .unwrap();
    assert_eq!(answer, HeartbeatResponse::Ack);

    client
        .publish_test_result(machine_result("m1", &task.commit_id, &task.test_id, true))
        .await
        .unwrap();
    // Publication has no answer, so the next response belongs to this request.
    client.waiting_heartbeat("m1").await.unwrap();

    let manager = scheduler.manager.lock().await;
    let commit = manager.commit(&commit_id("a")).unwrap();
    assert!(!commit.needs_build());
    assert!(!commit.build_in_progress());
    drop(manager);

    let next = client
        .get_task(&worker("m1", "10.0.0.1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.test_name, "unit");

    server.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_for_unknown_commit_is_done() {
    let scheduler = TestScheduler::new(1);
    let server = TestServer::start(scheduler.manager.clone()).await;

    let mut client = server.client().await;
    let answer = client
        .heartbeat(&commit_id("missing"), "no-such-test", "m1")
        .await
        .unwrap();
    assert_eq!(answer, HeartbeatResponse::Done);

    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_request_keeps_connection_open() {
    let scheduler = TestScheduler::new(1);
    let server = TestServer::start(scheduler.manager.clone()).await;

    let mut client = server.client().await;
    client
        .send_raw(r#"{"request": "launchRockets", "args": {}}"#)
        .await
        .unwrap();
    assert_eq!(client.recv_raw().await.unwrap().as_deref(), Some(UNKNOWN_REQUEST));

    client.waiting_heartbeat("m1").await.unwrap();

    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_request_closes_connection() {
    let scheduler = TestScheduler::new(1);
    let server = TestServer::start(scheduler.manager.clone()).await;

    let mut client = server.client().await;
    client.send_raw("this is not json").await.unwrap();
    assert_eq!(client.recv_raw().await.unwrap().as_deref(), Some(MALFORMED_REQUEST));
    assert!(client.recv_raw().await.unwrap_or(None).is_none());

    let registry = server.registry.clone();
    assert!(wait_for(Duration::from_secs(2), || registry.is_empty()).await);

    server.shutdown().await;
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let scheduler = TestScheduler::new(1);
    let server =
        TestServer::start_with_idle_timeout(scheduler.manager.clone(), Duration::from_millis(200))
            .await;

    let mut client = server.client().await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(client.recv_raw().await.unwrap_or(None).is_none());
    let registry = server.registry.clone();
    assert!(wait_for(Duration::from_secs(2), || registry.is_empty()).await);

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_open_sessions() {
    let scheduler = TestScheduler::new(1);
    let server = TestServer::start(scheduler.manager.clone()).await;

    let mut client = server.client().await;
    let registry = server.registry.clone();
    assert!(wait_for(Duration::from_secs(2), || registry.len() == 1).await);

    server.shutdown().await;
    assert!(client.recv_raw().await.unwrap_or(None).is_none());
    assert!(wait_for(Duration::from_secs(2), || registry.is_empty()).await);
}

#[tokio::test]
async fn test_heartbeat_sender_stops_when_run_is_gone() {
    let scheduler = TestScheduler::new(1);
    let server = TestServer::start(scheduler.manager.clone()).await;

    let mut client = server.client().await;
    let sender = HeartbeatSender::new(20);
    let answer = tokio::time::timeout(
        Duration::from_secs(2),
        sender.run(&mut client, &commit_id("gone"), "old-test", "m1"),
    )
    .await
    .expect("heartbeat loop should end")
    .unwrap();
    assert_eq!(answer, HeartbeatResponse::Done);

    server.shutdown().await;
}
