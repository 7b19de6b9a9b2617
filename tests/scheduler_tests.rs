//! End-to-end scheduling scenarios driven through refresh and the test manager.


use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use ci_looper::model::{BranchId, HeartbeatResponse, RunStatus, TestRunRecord};
use ci_looper::store::{InMemoryJsonStore, JsonStore, TestDatabase};
use test_harness::{
    commit_id, linear_history, machine_result, master, worker, TestScheduler, CLUSTER_DEFINITIONS,
    DEFINITIONS,
};

#[tokio::test]
async fn test_builds_run_before_any_test() {
    let scheduler = TestScheduler::new(3);
    linear_history(&scheduler.source, &["a", "b", "c"], DEFINITIONS).await;
    scheduler.refresh().await;

    let mut manager = scheduler.manager.lock().await;
    assert_eq!(manager.commits().count(), 3);
    assert!(manager.commits_needing_definitions().is_empty());

    // Every commit is built before any test runs, newest first.
    let mut built = Vec::new();
    for (i, machine) in ["m1", "m2", "m3"].iter().enumerate() {
        let task = manager
            .get_task(&worker(machine, &format!("10.0.0.{i}")))
            .expect("expected a build");
        assert_eq!(task.record.test_name, "build");
        built.push(task.commit_id.clone());
        assert!(manager.record_machine_result(machine_result(
            machine,
            &task.commit_id,
            &task.record.test_id,
            true
        )));
    }
    assert_eq!(built[0], commit_id("c"));
    built.sort();
    assert_eq!(built, vec![commit_id("a"), commit_id("b"), commit_id("c")]);

    let task = manager.get_task(&worker("m4", "10.0.0.9")).unwrap();
    assert_eq!(task.record.test_name, "unit");
    assert_eq!(task.commit_id, commit_id("c"));
}

#[tokio::test]
async fn test_failed_build_blocks_only_its_commit() {
    let scheduler = TestScheduler::new(2);
    linear_history(&scheduler.source, &["a", "b"], DEFINITIONS).await;
    scheduler.refresh().await;

    let mut manager = scheduler.manager.lock().await;
    let first = manager.get_task(&worker("m1", "10.0.0.1")).unwrap();
    assert_eq!(first.commit_id, commit_id("b"));
    manager.record_machine_result(machine_result("m1", &first.commit_id, &first.record.test_id, false));
    assert!(manager.commit(&commit_id("b")).unwrap().is_broken_build());

    let second = manager.get_task(&worker("m1", "10.0.0.1")).unwrap();
    assert_eq!(second.commit_id, commit_id("a"));
    assert_eq!(second.record.test_name, "build");
    manager.record_machine_result(machine_result("m1", &second.commit_id, &second.record.test_id, true));

    // Only commit a can run tests now.
    let third = manager.get_task(&worker("m1", "10.0.0.1")).unwrap();
    assert_eq!(third.commit_id, commit_id("a"));
    assert_eq!(third.record.test_name, "unit");
}

#[tokio::test]
async fn test_multi_machine_test_shares_one_record_with_lowest_ip_leader() {
    let scheduler = TestScheduler::new(1);
    linear_history(&scheduler.source, &["a"], CLUSTER_DEFINITIONS).await;
    scheduler.refresh().await;

    let mut manager = scheduler.manager.lock().await;
    let build = manager.get_task(&worker("m1", "10.0.0.5")).unwrap();
    manager.record_machine_result(machine_result("m1", &build.commit_id, &build.record.test_id, true));

    let m1 = worker("m1", "10.0.0.5");
    let m2 = worker("m2", "10.0.0.2");
    let m3 = worker("m3", "10.0.0.7");

    assert!(manager.get_task(&m1).is_none());
    assert!(manager.get_task(&m2).is_none());
    assert_eq!(manager.blocking_machines().idle_machines().len(), 2);

    let third = manager.get_task(&m3).expect("third machine completes the group");
    let first = manager.get_task(&m1).expect("pending assignment for m1");
    let second = manager.get_task(&m2).expect("pending assignment for m2");

    assert_eq!(first.record.test_id, third.record.test_id);
    assert_eq!(second.record.test_id, third.record.test_id);
    assert_eq!(third.record.machine, "m2");
    assert_eq!(third.record.ip_list()[0], "10.0.0.2");

    let commit = manager.commit(&commit_id("a")).unwrap();
    assert_eq!(commit.running_count("cluster"), 1);

    // Followers learn the outcome from the leader through their heartbeats.
    let test_id = third.record.test_id.clone();
    assert_eq!(
        manager.heartbeat(&test_id, &commit_id("a"), "m1"),
        HeartbeatResponse::Ack
    );
    manager.record_machine_result(machine_result("m2", &commit_id("a"), &test_id, true));
    assert_eq!(
        manager.heartbeat(&test_id, &commit_id("a"), "m1"),
        HeartbeatResponse::Done
    );
    assert_eq!(
        manager.heartbeat(&test_id, &commit_id("a"), "m2"),
        HeartbeatResponse::Ack
    );
}

#[tokio::test]
async fn test_stale_run_times_out_and_drops_late_results() {
    let store = Arc::new(InMemoryJsonStore::new());
    let database = TestDatabase::new(store.clone() as Arc<dyn JsonStore>);

    let stale = TestRunRecord::new(
        "unit",
        commit_id("a"),
        "m1",
        BTreeMap::from([("m1".to_string(), "10.0.0.1".to_string())]),
        Utc::now() - Duration::hours(1),
    );
    database.update_test_result(&stale).unwrap();
    database
        .set_test_ids_for_commit(&commit_id("a"), &[stale.test_id.clone()])
        .unwrap();

    let scheduler = TestScheduler::with_store(1, store);
    linear_history(&scheduler.source, &["a"], DEFINITIONS).await;
    scheduler.refresh().await;

    let mut manager = scheduler.manager.lock().await;
    let commit = manager.commit(&commit_id("a")).unwrap();
    assert_eq!(commit.timeout_count("unit"), 1);
    assert_eq!(commit.running_count("unit"), 0);
    assert_eq!(
        manager.test_by_id(&stale.test_id).unwrap().status(),
        RunStatus::Timeout
    );

    assert_eq!(
        manager.heartbeat(&stale.test_id, &commit_id("a"), "m1"),
        HeartbeatResponse::Fail
    );
    assert!(!manager.record_machine_result(machine_result("m1", &commit_id("a"), &stale.test_id, true)));
    assert_eq!(
        manager.test_by_id(&stale.test_id).unwrap().status(),
        RunStatus::Timeout
    );
}

#[tokio::test]
async fn test_results_survive_a_restart() {
    let store = Arc::new(InMemoryJsonStore::new());

    let first = TestScheduler::with_store(1, store.clone());
    linear_history(&first.source, &["a"], DEFINITIONS).await;
    first.refresh().await;
    {
        let mut manager = first.manager.lock().await;
        let build = manager.get_task(&worker("m1", "10.0.0.1")).unwrap();
        manager.record_machine_result(machine_result("m1", &build.commit_id, &build.record.test_id, true));
    }

    let second = TestScheduler::with_store(1, store);
    linear_history(&second.source, &["a"], DEFINITIONS).await;
    second.refresh().await;

    let mut manager = second.manager.lock().await;
    let commit = manager.commit(&commit_id("a")).unwrap();
    assert!(!commit.needs_build());
    let task = manager.get_task(&worker("m1", "10.0.0.1")).unwrap();
    assert_eq!(task.record.test_name, "unit");
}

#[tokio::test]
async fn test_feature_branch_commits_are_dropped_with_the_branch() {
    let scheduler = TestScheduler::new(2);
    linear_history(&scheduler.source, &["a", "b"], DEFINITIONS).await;
    let feature = BranchId::new("repo", "feature");
    let f1 = scheduler
        .source
        .add_commit("repo", "f1", vec!["b".to_string()], "feature work")
        .await;
    scheduler
        .source
        .set_test_definitions(&f1, DEFINITIONS.as_bytes().to_vec())
        .await;
    scheduler.source.set_branch_head(feature.clone(), f1.clone()).await;

    scheduler.refresh().await;
    {
        let manager = scheduler.manager.lock().await;
        assert!(manager.commit(&f1).is_some());
        assert!(manager.branch(&feature).is_some());
        assert!(!manager.branch(&feature).unwrap().is_deep_test());
        assert!(manager.branch(&master()).unwrap().is_deep_test());
    }

    scheduler.source.remove_branch(&feature).await;
    scheduler.refresh().await;

    let manager = scheduler.manager.lock().await;
    assert!(manager.branch(&feature).is_none());
    assert!(manager.commit(&f1).is_none());
    assert_eq!(manager.commits().count(), 2);
}

#[tokio::test]
async fn test_targeted_tests_outrank_untargeted_reruns() {
    let scheduler = TestScheduler::new(1);
    linear_history(&scheduler.source, &["a"], DEFINITIONS).await;
    scheduler.refresh().await;

    let mut manager = scheduler.manager.lock().await;
    let build = manager.get_task(&worker("m1", "10.0.0.1")).unwrap();
    manager.record_machine_result(machine_result("m1", &build.commit_id, &build.record.test_id, true));

    // Exhaust the default run cap.
    for _ in 0..3 {
        let task = manager.get_task(&worker("m1", "10.0.0.1")).unwrap();
        assert_eq!(task.record.test_name, "unit");
        manager.record_machine_result(machine_result("m1", &task.commit_id, &task.record.test_id, true));
    }
    assert!(manager.get_task(&worker("m1", "10.0.0.1")).is_none());

    manager
        .set_targeted_tests(&master(), vec!["unit".to_string()])
        .unwrap();
    let task = manager.get_task(&worker("m1", "10.0.0.1")).unwrap();
    assert_eq!(task.record.test_name, "unit");
    assert!(manager.is_targeted_commit_and_test(manager.commit(&commit_id("a")).unwrap(), "unit"));
}
