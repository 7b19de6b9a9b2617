use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::model::{
    BranchId, CommitId, HeartbeatResponse, MachineResult, TestDefinition, TestRunRecord,
    BUILD_TEST_NAME,
};
use crate::stats::{StatsSummary, TestStats};

/// Commits whose subject contains this marker are never scheduled.
pub const EXCLUDE_MARKER: &str = "[nft]";

/// Failed builds beyond this count mark the build as broken.
pub const MAX_BUILD_ATTEMPTS: usize = 1;

#[derive(Debug, Clone, PartialEq)]
pub enum DefinitionsState {
    Pending,
    Loaded(Vec<TestDefinition>),
    Error(String),
}

#[derive(Debug)]
pub struct Commit {
    commit_id: CommitId,
    parent_hashes: Vec<String>,
    subject: String,
    definitions: DefinitionsState,
    test_names_by_id: HashMap<String, String>,
    stats_by_type: BTreeMap<String, TestStats>,
    branches: BTreeSet<BranchId>,
    targeted_cache: RefCell<HashMap<String, bool>>,
}

impl Commit {
    pub fn new(commit_id: CommitId, parent_hashes: Vec<String>, subject: impl Into<String>) -> Self {
        Self {
            commit_id,
            parent_hashes,
            subject: subject.into(),
            definitions: DefinitionsState::Pending,
            test_names_by_id: HashMap::new(),
            stats_by_type: BTreeMap::new(),
            branches: BTreeSet::new(),
            targeted_cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn commit_id(&self) -> &CommitId {
        &self.commit_id
    }

    pub fn parent_hashes(&self) -> &[String] {
        &self.parent_hashes
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn is_root(&self) -> bool {
        self.parent_hashes.is_empty()
    }

    /// The parent followed when ordering a branch: the last listed one.
    pub fn ordering_parent_id(&self) -> Option<CommitId> {
        self.parent_hashes
            .last()
            .map(|hash| self.commit_id.sibling(hash.clone()))
    }

    pub fn exclude_from_testing_because_of_subject(&self) -> bool {
        self.subject.contains(EXCLUDE_MARKER)
    }

    // definitions

    pub fn definitions(&self) -> &DefinitionsState {
        &self.definitions
    }

    pub fn set_definitions(&mut self, state: DefinitionsState) {
        if let DefinitionsState::Loaded(definitions) = &state {
            for definition in definitions {
                self.stats_by_type
                    .entry(definition.name.clone())
                    .or_default();
            }
        }
        self.definitions = state;
        self.dirty_test_priority_cache();
    }

    pub fn has_pending_definitions(&self) -> bool {
        matches!(self.definitions, DefinitionsState::Pending)
    }

    pub fn definitions_error(&self) -> Option<&str> {
        match &self.definitions {
            DefinitionsState::Error(message) => Some(message),
            _ => None,
        }
    }

    pub fn test_definitions(&self) -> &[TestDefinition] {
        match &self.definitions {
            DefinitionsState::Loaded(definitions) => definitions,
            _ => &[],
        }
    }

    pub fn test_definition_for(&self, test_name: &str) -> Option<&TestDefinition> {
        self.test_definitions().iter().find(|d| d.name == test_name)
    }

    pub fn is_periodic_test(&self, test_name: &str) -> bool {
        self.test_definition_for(test_name)
            .is_some_and(|d| d.periodic)
    }

    // branch membership

    pub fn branches(&self) -> &BTreeSet<BranchId> {
        &self.branches
    }

    pub fn add_branch(&mut self, branch: BranchId) {
        if self.branches.insert(branch) {
            self.dirty_test_priority_cache();
        }
    }

    pub fn remove_branch(&mut self, branch: &BranchId) {
        if self.branches.remove(branch) {
            self.dirty_test_priority_cache();
        }
    }

    pub fn dirty_test_priority_cache(&self) {
        self.targeted_cache.borrow_mut().clear();
    }

    pub fn cached_targeted(&self, test_name: &str) -> Option<bool> {
        self.targeted_cache.borrow().get(test_name).copied()
    }

    pub fn cache_targeted(&self, test_name: &str, targeted: bool) {
        self.targeted_cache
            .borrow_mut()
            .insert(test_name.to_string(), targeted);
    }

    // run records

    /// Register a run. Returns `false` if a run with the same id was already known.
    pub fn add_test_result(&mut self, record: TestRunRecord) -> bool {
        if self.test_names_by_id.contains_key(&record.test_id) {
            return false;
        }
        self.test_names_by_id
            .insert(record.test_id.clone(), record.test_name.clone());
        self.stats_by_type
            .entry(record.test_name.clone())
            .or_default()
            .add_test(record);
        true
    }

    pub fn record(&self, test_id: &str) -> Option<&TestRunRecord> {
        let name = self.test_names_by_id.get(test_id)?;
        self.stats_by_type.get(name)?.get(test_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &TestRunRecord> {
        self.stats_by_type.values().flat_map(|stats| stats.records())
    }

    pub fn test_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.test_names_by_id.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn heartbeat_test(
        &mut self,
        test_id: &str,
        machine: &str,
        now: DateTime<Utc>,
    ) -> HeartbeatResponse {
        let Some(name) = self.test_names_by_id.get(test_id) else {
            return HeartbeatResponse::Done;
        };
        self.stats_by_type
            .get_mut(name)
            .and_then(|stats| stats.heartbeat(test_id, machine, now))
            .unwrap_or(HeartbeatResponse::Done)
    }

    pub fn record_machine_result(
        &mut self,
        result: MachineResult,
        now: DateTime<Utc>,
    ) -> Option<&TestRunRecord> {
        let name = self.test_names_by_id.get(&result.test_id)?;
        self.stats_by_type
            .get_mut(name)?
            .record_machine_result(result, now)
    }

    pub fn clear_test_result(&mut self, test_id: &str) -> Option<TestRunRecord> {
        let name = self.test_names_by_id.remove(test_id)?;
        self.stats_by_type.get_mut(&name)?.remove_test(test_id)
    }

    pub fn clear_test_results(&mut self) {
        self.test_names_by_id.clear();
        for stats in self.stats_by_type.values_mut() {
            *stats = TestStats::new();
        }
        let declared: Vec<&str> = match &self.definitions {
            DefinitionsState::Loaded(defs) => defs.iter().map(|d| d.name.as_str()).collect(),
            _ => Vec::new(),
        };
        self.stats_by_type
            .retain(|name, _| declared.contains(&name.as_str()));
    }

    // statistics

    pub fn stats_for(&self, test_name: &str) -> Option<&TestStats> {
        self.stats_by_type.get(test_name)
    }

    pub fn stats_by_type(&self) -> &BTreeMap<String, TestStats> {
        &self.stats_by_type
    }

    pub fn has_test_stats(&self) -> bool {
        self.stats_by_type.values().any(|stats| !stats.is_empty())
    }

    /// Combined statistics of every test whose name starts with `prefix`.
    pub fn stats_for_group(&self, prefix: &str) -> StatsSummary {
        self.stats_by_type
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .fold(None, |acc: Option<StatsSummary>, (_, stats)| {
                let summary = stats.summary();
                Some(match acc {
                    Some(acc) => acc.combined_with(&summary),
                    None => summary,
                })
            })
            .unwrap_or_default()
    }

    pub fn running_count(&self, test_name: &str) -> usize {
        self.stats_for(test_name).map_or(0, TestStats::running_count)
    }

    pub fn timeout_count(&self, test_name: &str) -> usize {
        self.stats_for(test_name).map_or(0, TestStats::timeout_count)
    }

    pub fn total_non_timed_out_runs(&self, test_name: &str) -> usize {
        self.stats_for(test_name)
            .map_or(0, |s| s.running_count() + s.completed_count())
    }

    pub fn total_running_count(&self) -> usize {
        self.stats_by_type.values().map(TestStats::running_count).sum()
    }

    pub fn last_test_run_started(&self, test_name: &str) -> Option<DateTime<Utc>> {
        self.stats_for(test_name)
            .and_then(TestStats::last_test_run_started)
    }

    /// Whether a build still has to run. A commit declaring no build never needs one.
    pub fn needs_build(&self) -> bool {
        match self.stats_for(BUILD_TEST_NAME) {
            None => false,
            Some(build) => {
                build.running_count() == 0 && build.pass_count() == 0 && build.fail_count() == 0
            }
        }
    }

    pub fn build_in_progress(&self) -> bool {
        self.running_count(BUILD_TEST_NAME) > 0
    }

    pub fn is_broken_build(&self) -> bool {
        self.stats_for(BUILD_TEST_NAME).is_some_and(|build| {
            build.pass_count() == 0 && build.fail_count() >= MAX_BUILD_ATTEMPTS
        })
    }

    /// Lowest completed count over the declared non-build tests.
    pub fn full_passes_completed(&self) -> usize {
        self.test_definitions()
            .iter()
            .filter(|d| !d.is_build())
            .map(|d| self.stats_for(&d.name).map_or(0, TestStats::completed_count))
            .min()
            .unwrap_or(0)
    }

    pub fn total_completed_test_runs(&self) -> usize {
        self.stats_by_type
            .iter()
            .filter(|(name, _)| name.as_str() != BUILD_TEST_NAME)
            .map(|(_, stats)| stats.completed_count())
            .sum()
    }

    /// Fraction of completed non-build runs that passed.
    pub fn pass_rate(&self) -> Option<f64> {
        let (passes, completed) = self
            .stats_by_type
            .iter()
            .filter(|(name, _)| name.as_str() != BUILD_TEST_NAME)
            .fold((0, 0), |(p, c), (_, stats)| {
                (p + stats.pass_count(), c + stats.completed_count())
            });
        (completed > 0).then(|| passes as f64 / completed as f64)
    }
}
