//! Pulls branch and commit state from source control into the [`TestManager`].
//!
//! Every source-control call happens with the manager unlocked. The lock is
//! taken briefly to plan the work and again to apply each result, so a slow
//! repository never stalls workers asking for tasks.

use std::collections::HashSet;

use tokio::sync::Mutex;

use super::manager::{BranchWindowRequest, TestManager};
use crate::model::CommitId;
use crate::source_control::{CommitInfo, SourceControl, SourceControlError};

/// What one refresh pass achieved.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshReport {
    pub branches: usize,
    pub branches_failed: usize,
    pub definitions_loaded: usize,
    pub definitions_failed: usize,
}

/// Fetch the commits a branch should have under test, newest first.
///
/// The baseline looks back `depth` commits from its head. A feature branch
/// takes the commits it has on top of the baseline, or looks back like the
/// baseline when it has none. Short windows are extended along first parents
/// until `depth` commits are known or history runs out.
pub async fn fetch_commits_under_test(
    source: &dyn SourceControl,
    request: &BranchWindowRequest,
) -> Result<Vec<CommitInfo>, SourceControlError> {
    let mut window = match &request.baseline {
        None => {
            source
                .commits_looking_back(&request.branch, request.depth)
                .await?
        }
        Some(baseline) => {
            let between = source
                .commits_between_branches(&request.branch, baseline)
                .await?;
            if between.is_empty() {
                source
                    .commits_looking_back(&request.branch, request.depth)
                    .await?
            } else {
                between
            }
        }
    };

    let mut seen: HashSet<String> = window.iter().map(|c| c.hash.clone()).collect();
    while window.len() < request.depth {
        let Some(parent) = window.last().and_then(|c| c.parent_hashes.first()).cloned() else {
            break;
        };
        if !seen.insert(parent.clone()) {
            break;
        }
        let parent_id = CommitId::new(request.branch.repo(), parent);
        match source.commit_info(&parent_id).await? {
            Some(info) => window.push(info),
            None => break,
        }
    }

    Ok(window)
}

/// Fetch and apply one branch. On failure the branch keeps its previous commits.
pub async fn update_commits_under_test(
    manager: &Mutex<TestManager>,
    source: &dyn SourceControl,
    request: &BranchWindowRequest,
) -> Result<Vec<CommitId>, SourceControlError> {
    let window = fetch_commits_under_test(source, request).await?;
    Ok(manager
        .lock()
        .await
        .apply_branch_window(&request.branch, window))
}

/// One full refresh: branch list, each branch's window, then any missing
/// test definitions.
///
/// Only a failure to list branches aborts the pass. Per-branch and
/// per-commit failures are logged and retried on the next pass.
pub async fn refresh(
    manager: &Mutex<TestManager>,
    source: &dyn SourceControl,
) -> Result<RefreshReport, SourceControlError> {
    let listed = source.list_branches().await?;
    let requests = manager.lock().await.update_branch_list(listed);

    let mut report = RefreshReport {
        branches: requests.len(),
        ..Default::default()
    };

    for request in &requests {
        if let Err(e) = update_commits_under_test(manager, source, request).await {
            tracing::warn!(branch = %request.branch, error = %e, "Failed to refresh branch");
            report.branches_failed += 1;
        }
    }

    let pending = manager.lock().await.commits_needing_definitions();
    for commit_id in pending {
        match source.test_definitions_for_commit(&commit_id).await {
            Ok(raw) => {
                let applied = manager
                    .lock()
                    .await
                    .set_commit_definitions(&commit_id, raw);
                match applied {
                    Ok(()) => report.definitions_loaded += 1,
                    // Pruned while we were fetching.
                    Err(e) => tracing::debug!(commit_id = %commit_id, error = %e, "Dropped definitions"),
                }
            }
            Err(e) => {
                tracing::warn!(commit_id = %commit_id, error = %e, "Failed to fetch test definitions");
                report.definitions_failed += 1;
            }
        }
    }

    tracing::debug!(
        branches = report.branches,
        branches_failed = report.branches_failed,
        definitions_loaded = report.definitions_loaded,
        definitions_failed = report.definitions_failed,
        "Refresh complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::SchedulerSettings;
    use crate::model::BranchId;
    use crate::source_control::InMemorySourceControl;
    use crate::store::InMemoryJsonStore;

    fn master() -> BranchId {
        BranchId::new("repo", "master")
    }

    async fn linear_history(source: &InMemorySourceControl, hashes: &[&str]) {
        let mut parent: Option<&str> = None;
        for hash in hashes {
            let parents = parent.map(|p| vec![p.to_string()]).unwrap_or_default();
            source.add_commit("repo", hash, parents, hash).await;
            parent = Some(*hash);
        }
    }

    fn manager(depth: usize) -> Mutex<TestManager> {
        Mutex::new(TestManager::new(
            SchedulerSettings::new(master()).with_baseline_depth(depth),
            Arc::new(InMemoryJsonStore::new()),
        ))
    }

    #[tokio::test]
    async fn refresh_loads_branches_and_definitions() {
        let source = InMemorySourceControl::new();
        linear_history(&source, &["a", "b", "c"]).await;
        source
            .set_branch_head(master(), CommitId::new("repo", "c"))
            .await;
        source
            .set_test_definitions(
                &CommitId::new("repo", "c"),
                br#"{"tests": [{"name": "unit"}]}"#.to_vec(),
            )
            .await;

        let manager = manager(2);
        let report = refresh(&manager, &source).await.unwrap();
        assert_eq!(report.branches, 1);
        assert_eq!(report.definitions_loaded, 2);

        let guard = manager.lock().await;
        let ids: Vec<&str> = guard
            .branch(&master())
            .unwrap()
            .commits_in_order()
            .iter()
            .map(|id| id.hash())
            .collect();
        assert_eq!(ids, vec!["c", "b"]);
        assert_eq!(
            guard.commit(&CommitId::new("repo", "c")).unwrap().test_definitions().len(),
            1
        );
        // No definitions file is a sticky error, not a retry.
        assert!(guard
            .commit(&CommitId::new("repo", "b"))
            .unwrap()
            .definitions_error()
            .is_some());
    }

    #[tokio::test]
    async fn feature_branches_are_extended_back_to_depth() {
        let source = InMemorySourceControl::new();
        linear_history(&source, &["a", "b", "c"]).await;
        source.add_commit("repo", "f1", vec!["c".to_string()], "feature").await;
        source
            .set_branch_head(master(), CommitId::new("repo", "c"))
            .await;

        let request = BranchWindowRequest {
            branch: BranchId::new("repo", "feature"),
            baseline: Some(master()),
            depth: 3,
        };
        source
            .set_branch_head(request.branch.clone(), CommitId::new("repo", "f1"))
            .await;

        let window = fetch_commits_under_test(&source, &request).await.unwrap();
        let hashes: Vec<&str> = window.iter().map(|c| c.hash.as_str()).collect();
        assert_eq!(hashes, vec!["f1", "c", "b"]);
    }

    #[tokio::test]
    async fn unavailable_source_keeps_previous_state() {
        let source = InMemorySourceControl::new();
        linear_history(&source, &["a", "b"]).await;
        source
            .set_branch_head(master(), CommitId::new("repo", "b"))
            .await;

        let manager = manager(5);
        refresh(&manager, &source).await.unwrap();
        assert_eq!(manager.lock().await.commits().count(), 2);

        source.set_unavailable(true);
        assert!(refresh(&manager, &source).await.is_err());
        let guard = manager.lock().await;
        assert_eq!(guard.commits().count(), 2);
        assert_eq!(guard.branch(&master()).unwrap().len(), 2);
    }
}
