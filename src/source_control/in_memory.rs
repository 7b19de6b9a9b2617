use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;

use super::{CommitInfo, SourceControl, SourceControlError};
use crate::model::{BranchId, CommitId};

#[derive(Debug, Default)]
struct Repositories {
    commits: HashMap<CommitId, CommitInfo>,
    heads: BTreeMap<BranchId, CommitId>,
    definitions: HashMap<CommitId, Vec<u8>>,
}

/// A source control backend held entirely in memory.
///
/// Used by the binary when serving a fixture file and by tests. Can be switched
/// to an unavailable state to exercise refresh failure handling.
#[derive(Debug, Clone, Default)]
pub struct InMemorySourceControl {
    repos: Arc<RwLock<Repositories>>,
    unavailable: Arc<AtomicBool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FixtureCommit {
    repo: String,
    #[serde(flatten)]
    info: CommitInfo,
    #[serde(default)]
    test_definitions: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Fixture {
    #[serde(default)]
    commits: Vec<FixtureCommit>,
    #[serde(default)]
    branches: BTreeMap<String, String>,
}

impl InMemorySourceControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON fixture of the form
    /// `{"commits": [{"repo", "hash", "parentHashes", "title", "testDefinitions"}],
    ///   "branches": {"repo/branch": "headHash"}}`.
    pub async fn from_fixture(path: &Path) -> Result<Self, SourceControlError> {
        let raw = tokio::fs::read(path).await?;
        let fixture: Fixture = serde_json::from_slice(&raw)?;
        let source = Self::new();

        for commit in fixture.commits {
            let commit_id = CommitId::new(commit.repo, commit.info.hash.clone());
            if let Some(definitions) = commit.test_definitions {
                source
                    .set_test_definitions(&commit_id, serde_json::to_vec(&definitions)?)
                    .await;
            }
            source
                .add_commit(commit_id.repo(), &commit.info.hash, commit.info.parent_hashes, &commit.info.title)
                .await;
        }

        for (branch, head) in fixture.branches {
            let branch: BranchId = branch
                .parse()
                .map_err(|e| SourceControlError::Fixture(format!("{e}")))?;
            let head_id = CommitId::new(branch.repo(), head);
            source.set_branch_head(branch, head_id).await;
        }

        Ok(source)
    }

    pub async fn add_commit(
        &self,
        repo: &str,
        hash: &str,
        parent_hashes: Vec<String>,
        title: &str,
    ) -> CommitId {
        let id = CommitId::new(repo, hash);
        let info = CommitInfo {
            hash: hash.to_string(),
            parent_hashes,
            title: title.to_string(),
        };
        self.repos.write().await.commits.insert(id.clone(), info);
        id
    }

    pub async fn set_branch_head(&self, branch: BranchId, head: CommitId) {
        self.repos.write().await.heads.insert(branch, head);
    }

    pub async fn remove_branch(&self, branch: &BranchId) {
        self.repos.write().await.heads.remove(branch);
    }

    pub async fn set_test_definitions(&self, commit_id: &CommitId, contents: Vec<u8>) {
        self.repos
            .write()
            .await
            .definitions
            .insert(commit_id.clone(), contents);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), SourceControlError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SourceControlError::Unavailable(
                "in-memory source control switched off".to_string(),
            ));
        }
        Ok(())
    }

    fn head(repos: &Repositories, branch: &BranchId) -> Result<CommitId, SourceControlError> {
        repos
            .heads
            .get(branch)
            .cloned()
            .ok_or_else(|| SourceControlError::UnknownBranch(branch.clone()))
    }

    /// Every commit reachable from `start` through any parent, in breadth-first order.
    fn reachable(repos: &Repositories, start: &CommitId) -> Vec<CommitId> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([start.clone()]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let Some(info) = repos.commits.get(&id) else {
                continue;
            };
            queue.extend(info.parent_hashes.iter().map(|p| id.sibling(p.clone())));
            order.push(id);
        }
        order
    }
}

#[async_trait]
impl SourceControl for InMemorySourceControl {
    async fn list_branches(&self) -> Result<Vec<BranchId>, SourceControlError> {
        self.check_available()?;
        Ok(self.repos.read().await.heads.keys().cloned().collect())
    }

    async fn commits_looking_back(
        &self,
        branch: &BranchId,
        depth: usize,
    ) -> Result<Vec<CommitInfo>, SourceControlError> {
        self.check_available()?;
        let repos = self.repos.read().await;
        let mut cursor = Some(Self::head(&repos, branch)?);
        let mut window = Vec::new();

        while let Some(id) = cursor.take() {
            if window.len() >= depth {
                break;
            }
            let Some(info) = repos.commits.get(&id) else {
                break;
            };
            cursor = info.parent_hashes.first().map(|p| id.sibling(p.clone()));
            window.push(info.clone());
        }
        Ok(window)
    }

    async fn commits_between_branches(
        &self,
        branch: &BranchId,
        baseline: &BranchId,
    ) -> Result<Vec<CommitInfo>, SourceControlError> {
        self.check_available()?;
        let repos = self.repos.read().await;
        let head = Self::head(&repos, branch)?;
        let excluded: HashSet<CommitId> = Self::reachable(&repos, &Self::head(&repos, baseline)?)
            .into_iter()
            .collect();

        Ok(Self::reachable(&repos, &head)
            .into_iter()
            .filter(|id| !excluded.contains(id))
            .filter_map(|id| repos.commits.get(&id).cloned())
            .collect())
    }

    async fn commit_info(
        &self,
        commit_id: &CommitId,
    ) -> Result<Option<CommitInfo>, SourceControlError> {
        self.check_available()?;
        Ok(self.repos.read().await.commits.get(commit_id).cloned())
    }

    async fn test_definitions_for_commit(
        &self,
        commit_id: &CommitId,
    ) -> Result<Option<Vec<u8>>, SourceControlError> {
        self.check_available()?;
        Ok(self.repos.read().await.definitions.get(commit_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn linear(source: &InMemorySourceControl, hashes: &[&str]) {
        let mut parent: Option<&str> = None;
        for hash in hashes {
            let parents = parent.map(|p| vec![p.to_string()]).unwrap_or_default();
            source.add_commit("repo", hash, parents, hash).await;
            parent = Some(*hash);
        }
    }

    #[tokio::test]
    async fn looking_back_follows_first_parents() {
        let source = InMemorySourceControl::new();
        linear(&source, &["a", "b", "c", "d"]).await;
        let master = BranchId::new("repo", "master");
        source
            .set_branch_head(master.clone(), CommitId::new("repo", "d"))
            .await;

        let window = source.commits_looking_back(&master, 2).await.unwrap();
        let hashes: Vec<_> = window.iter().map(|c| c.hash.as_str()).collect();
        assert_eq!(hashes, vec!["d", "c"]);

        let window = source.commits_looking_back(&master, 10).await.unwrap();
        assert_eq!(window.len(), 4);
    }

    #[tokio::test]
    async fn between_branches_excludes_baseline_history() {
        let source = InMemorySourceControl::new();
        linear(&source, &["a", "b"]).await;
        source
            .add_commit("repo", "f1", vec!["b".to_string()], "feature 1")
            .await;
        source
            .add_commit("repo", "f2", vec!["f1".to_string()], "feature 2")
            .await;
        let master = BranchId::new("repo", "master");
        let feature = BranchId::new("repo", "feature");
        source.set_branch_head(master.clone(), CommitId::new("repo", "b")).await;
        source.set_branch_head(feature.clone(), CommitId::new("repo", "f2")).await;

        let window = source.commits_between_branches(&feature, &master).await.unwrap();
        let hashes: Vec<_> = window.iter().map(|c| c.hash.as_str()).collect();
        assert_eq!(hashes, vec!["f2", "f1"]);

        assert!(source
            .commits_between_branches(&master, &master)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn unavailable_source_errors() {
        let source = InMemorySourceControl::new();
        source.set_unavailable(true);
        assert!(matches!(
            source.list_branches().await,
            Err(SourceControlError::Unavailable(_))
        ));
        source.set_unavailable(false);
        assert!(source.list_branches().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fixture_loading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.json");
        let fixture = serde_json::json!({
            "commits": [
                {"repo": "repo", "hash": "a", "parentHashes": [], "title": "root",
                 "testDefinitions": {"build": {"command": "make"}, "tests": []}},
                {"repo": "repo", "hash": "b", "parentHashes": ["a"], "title": "second"}
            ],
            "branches": {"repo/master": "b"}
        });
        std::fs::write(&path, serde_json::to_vec(&fixture).unwrap()).unwrap();

        let source = InMemorySourceControl::from_fixture(&path).await.unwrap();
        let branches = source.list_branches().await.unwrap();
        assert_eq!(branches, vec![BranchId::new("repo", "master")]);
        let defs = source
            .test_definitions_for_commit(&CommitId::new("repo", "a"))
            .await
            .unwrap();
        assert!(defs.is_some());
        assert!(source
            .test_definitions_for_commit(&CommitId::new("repo", "b"))
            .await
            .unwrap()
            .is_none());
    }
}
