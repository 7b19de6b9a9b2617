use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseIdError {
    #[error("expected '<repo>/<name>', got '{0}'")]
    MissingSeparator(String),

    #[error("empty repo or name in '{0}'")]
    Empty(String),
}

fn split_id(s: &str) -> Result<(String, String), ParseIdError> {
    let (repo, name) = s
        .split_once('/')
        .ok_or_else(|| ParseIdError::MissingSeparator(s.to_string()))?;
    if repo.is_empty() || name.is_empty() {
        return Err(ParseIdError::Empty(s.to_string()));
    }
    Ok((repo.to_string(), name.to_string()))
}

/// A revision in a repository, rendered as `repo/hash`.
///
/// Ordering is by repo, then hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommitId {
    repo: String,
    hash: String,
}

impl CommitId {
    pub fn new(repo: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            hash: hash.into(),
        }
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Id of another commit in the same repository.
    pub fn sibling(&self, hash: impl Into<String>) -> Self {
        Self::new(self.repo.clone(), hash)
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.repo, self.hash)
    }
}

impl FromStr for CommitId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (repo, hash) = split_id(s)?;
        if hash.contains('/') {
            return Err(ParseIdError::MissingSeparator(s.to_string()));
        }
        Ok(Self { repo, hash })
    }
}

impl TryFrom<String> for CommitId {
    type Error = ParseIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CommitId> for String {
    fn from(id: CommitId) -> Self {
        id.to_string()
    }
}

/// A named line of history in a repository, rendered as `repo/branch`.
///
/// Branch names may themselves contain `/`; only the first separator splits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchId {
    repo: String,
    name: String,
}

impl BranchId {
    pub fn new(repo: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            name: name.into(),
        }
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.repo, self.name)
    }
}

impl FromStr for BranchId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (repo, name) = split_id(s)?;
        Ok(Self { repo, name })
    }
}

impl TryFrom<String> for BranchId {
    type Error = ParseIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BranchId> for String {
    fn from(id: BranchId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_id_round_trips_through_display() {
        let id: CommitId = "repo/abc123".parse().unwrap();
        assert_eq!(id.repo(), "repo");
        assert_eq!(id.hash(), "abc123");
        assert_eq!(id.to_string(), "repo/abc123");
    }

    #[test]
    fn commit_id_rejects_nested_hash() {
        assert!("repo/a/b".parse::<CommitId>().is_err());
        assert!("nohash".parse::<CommitId>().is_err());
        assert!("/abc".parse::<CommitId>().is_err());
    }

    #[test]
    fn branch_id_keeps_slashes_in_name() {
        let id: BranchId = "repo/feature/login".parse().unwrap();
        assert_eq!(id.repo(), "repo");
        assert_eq!(id.name(), "feature/login");
    }

    #[test]
    fn ids_serialize_as_strings() {
        let id = CommitId::new("repo", "abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"repo/abc\"");
        let back: CommitId = serde_json::from_str("\"repo/abc\"").unwrap();
        assert_eq!(back, id);
    }
}
