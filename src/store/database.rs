use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{JsonStore, StoreError};
use crate::model::{BranchId, CommitId, TestDefinition, TestRunRecord};

/// Parsed definitions of a commit, or the reason they could not be parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StoredDefinitions {
    Definitions(Vec<TestDefinition>),
    Error(String),
}

/// Typed access to everything the scheduler persists.
#[derive(Clone)]
pub struct TestDatabase {
    store: Arc<dyn JsonStore>,
}

impl TestDatabase {
    pub fn new(store: Arc<dyn JsonStore>) -> Self {
        Self { store }
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.store.get(key)? {
            None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.store.set(key, serde_json::to_value(value)?)
    }

    // run records

    pub fn test_ids_for_commit(&self, commit_id: &CommitId) -> Result<Vec<String>, StoreError> {
        Ok(self
            .get(&format!("commit_tests_{commit_id}"))?
            .unwrap_or_default())
    }

    pub fn set_test_ids_for_commit(
        &self,
        commit_id: &CommitId,
        test_ids: &[String],
    ) -> Result<(), StoreError> {
        self.set(&format!("commit_tests_{commit_id}"), &test_ids)
    }

    pub fn load_test_result(&self, test_id: &str) -> Result<Option<TestRunRecord>, StoreError> {
        self.get(&format!("test_{test_id}"))
    }

    pub fn update_test_result(&self, record: &TestRunRecord) -> Result<(), StoreError> {
        self.set(&format!("test_{}", record.test_id), record)
    }

    /// Forget one run: drop it from the commit's list and delete the record.
    pub fn clear_result_for_test_id(
        &self,
        commit_id: &CommitId,
        test_id: &str,
    ) -> Result<(), StoreError> {
        let remaining: Vec<String> = self
            .test_ids_for_commit(commit_id)?
            .into_iter()
            .filter(|id| id != test_id)
            .collect();
        self.store.delete(&format!("test_{test_id}"))?;
        self.set_test_ids_for_commit(commit_id, &remaining)?;
        Ok(())
    }

    pub fn clear_all_tests_for_commit(&self, commit_id: &CommitId) -> Result<(), StoreError> {
        for test_id in self.test_ids_for_commit(commit_id)? {
            self.store.delete(&format!("test_{test_id}"))?;
        }
        self.store.delete(&format!("commit_tests_{commit_id}"))?;
        Ok(())
    }

    // definitions

    pub fn test_definitions_for_commit(
        &self,
        commit_id: &CommitId,
    ) -> Result<Option<StoredDefinitions>, StoreError> {
        self.get(&format!("commit_test_definitions_{commit_id}"))
    }

    pub fn set_test_definitions_for_commit(
        &self,
        commit_id: &CommitId,
        definitions: &StoredDefinitions,
    ) -> Result<(), StoreError> {
        self.set(&format!("commit_test_definitions_{commit_id}"), definitions)
    }

    // branch flags

    pub fn targeted_tests(&self, branch: &BranchId) -> Result<Vec<String>, StoreError> {
        Ok(self
            .get(&format!("branch_targeted_tests_{branch}"))?
            .unwrap_or_default())
    }

    pub fn set_targeted_tests(&self, branch: &BranchId, tests: &[String]) -> Result<(), StoreError> {
        self.set(&format!("branch_targeted_tests_{branch}"), &tests)
    }

    pub fn targeted_commit_ids(&self, branch: &BranchId) -> Result<Vec<CommitId>, StoreError> {
        Ok(self
            .get(&format!("branch_targeted_commit_ids_{branch}"))?
            .unwrap_or_default())
    }

    pub fn set_targeted_commit_ids(
        &self,
        branch: &BranchId,
        ids: &[CommitId],
    ) -> Result<(), StoreError> {
        self.set(&format!("branch_targeted_commit_ids_{branch}"), &ids)
    }

    pub fn branch_is_deep_test(&self, branch: &BranchId) -> Result<Option<bool>, StoreError> {
        self.get(&format!("branch_is_deep_test_{branch}"))
    }

    pub fn set_branch_is_deep_test(&self, branch: &BranchId, deep: bool) -> Result<(), StoreError> {
        self.set(&format!("branch_is_deep_test_{branch}"), &deep)
    }
}

impl std::fmt::Debug for TestDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestDatabase").finish_non_exhaustive()
    }
}
