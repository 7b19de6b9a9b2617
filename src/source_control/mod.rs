//! Read-only view of the repositories under test.
//!
//! The scheduler never talks to git directly. Everything it needs (branch
//! listings, commit windows, single-commit lookups and the raw definitions file)
//! comes through [`SourceControl`], which the refresh loop calls without holding
//! the scheduler lock.

pub mod in_memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{BranchId, CommitId};

pub use in_memory::InMemorySourceControl;

#[derive(Error, Debug)]
pub enum SourceControlError {
    #[error("unknown branch: {0}")]
    UnknownBranch(BranchId),

    #[error("source control unavailable: {0}")]
    Unavailable(String),

    #[error("invalid fixture: {0}")]
    Fixture(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    pub hash: String,
    #[serde(default)]
    pub parent_hashes: Vec<String>,
    #[serde(default)]
    pub title: String,
}

#[async_trait]
pub trait SourceControl: Send + Sync {
    async fn list_branches(&self) -> Result<Vec<BranchId>, SourceControlError>;

    /// Up to `depth` commits reachable from the branch head by first parents,
    /// newest first.
    async fn commits_looking_back(
        &self,
        branch: &BranchId,
        depth: usize,
    ) -> Result<Vec<CommitInfo>, SourceControlError>;

    /// Commits reachable from `branch` but not from `baseline`, newest first.
    async fn commits_between_branches(
        &self,
        branch: &BranchId,
        baseline: &BranchId,
    ) -> Result<Vec<CommitInfo>, SourceControlError>;

    async fn commit_info(
        &self,
        commit_id: &CommitId,
    ) -> Result<Option<CommitInfo>, SourceControlError>;

    /// Raw contents of the commit's test definitions file, if it has one.
    async fn test_definitions_for_commit(
        &self,
        commit_id: &CommitId,
    ) -> Result<Option<Vec<u8>>, SourceControlError>;
}
