use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;

use super::matcher::{BlockingMachines, WorkerInfo};
use super::priority::{
    compute_commit_levels, score, Candidate, CandidateTest, PrioritizedCandidate, ScoreKind,
    PREFER_TARGETED_PROBABILITY,
};
use crate::config::SchedulerSettings;
use crate::error::{LooperError, Result};
use crate::graph::{order_commits, Branch, Commit, DefinitionsState};
use crate::model::{
    parse_test_definitions, BranchId, CommitId, DefinitionError, HeartbeatResponse,
    MachineResult, TestDefinition, TestRunRecord, BUILD_TEST_NAME,
};
use crate::source_control::CommitInfo;
use crate::store::{JsonStore, StoreError, StoredDefinitions, TestDatabase};

/// A run handed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskAssignment {
    pub commit_id: CommitId,
    pub definition: TestDefinition,
    pub record: TestRunRecord,
}

/// What the refresh loop has to fetch for one branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchWindowRequest {
    pub branch: BranchId,
    /// `None` for the baseline branch itself.
    pub baseline: Option<BranchId>,
    pub depth: usize,
}

fn log_store_error(context: &'static str, result: std::result::Result<(), StoreError>) {
    if let Err(e) = result {
        tracing::error!(error = %e, context, "Failed to persist scheduler state");
    }
}

/// The scheduler: owns every commit and branch under test, decides what runs next
/// and tracks runs through heartbeats and results.
///
/// All methods are synchronous. The manager lives behind one async mutex and
/// is never held across source-control calls.
#[derive(Debug)]
pub struct TestManager {
    settings: SchedulerSettings,
    database: TestDatabase,
    commits: HashMap<CommitId, Commit>,
    branches: BTreeMap<BranchId, Branch>,
    blocking_machines: BlockingMachines,
    machine_last_seen: HashMap<String, DateTime<Utc>>,
    prefer_targeted_probability: f64,
}

impl TestManager {
    pub fn new(settings: SchedulerSettings, store: Arc<dyn JsonStore>) -> Self {
        Self {
            settings,
            database: TestDatabase::new(store),
            commits: HashMap::new(),
            branches: BTreeMap::new(),
            blocking_machines: BlockingMachines::default(),
            machine_last_seen: HashMap::new(),
            prefer_targeted_probability: PREFER_TARGETED_PROBABILITY,
        }
    }

    pub fn with_blocking_machines(mut self, blocking_machines: BlockingMachines) -> Self {
        self.blocking_machines = blocking_machines;
        self
    }

    /// Probability that a scheduling pass restricts itself to targeted candidates.
    pub fn with_prefer_targeted_probability(mut self, probability: f64) -> Self {
        self.prefer_targeted_probability = probability.clamp(0.0, 1.0);
        self
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    // lookups

    pub fn commit(&self, commit_id: &CommitId) -> Option<&Commit> {
        self.commits.get(commit_id)
    }

    pub fn commits(&self) -> impl Iterator<Item = &Commit> {
        self.commits.values()
    }

    pub fn branch(&self, branch_id: &BranchId) -> Option<&Branch> {
        self.branches.get(branch_id)
    }

    pub fn branches(&self) -> impl Iterator<Item = &Branch> {
        self.branches.values()
    }

    pub fn distinct_branches(&self) -> Vec<BranchId> {
        self.branches.keys().cloned().collect()
    }

    pub fn commits_in_branch(&self, branch_id: &BranchId) -> Vec<&Commit> {
        self.branches
            .get(branch_id)
            .map(|branch| {
                branch
                    .commits_in_order()
                    .iter()
                    .filter_map(|id| self.commits.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn test_by_id(&self, test_id: &str) -> Option<&TestRunRecord> {
        self.commits.values().find_map(|commit| commit.record(test_id))
    }

    pub fn blocking_machines(&self) -> &BlockingMachines {
        &self.blocking_machines
    }

    pub fn machine_last_seen(&self, machine_id: &str) -> Option<DateTime<Utc>> {
        self.machine_last_seen.get(machine_id).copied()
    }

    pub fn machines_seen(&self) -> usize {
        self.machine_last_seen.len()
    }

    pub fn machine_requested_test(&mut self, machine_id: &str) {
        self.machine_last_seen
            .insert(machine_id.to_string(), Utc::now());
    }

    // branch and commit maintenance

    /// Sync the set of branches with the listing from source control and
    /// return what must be fetched for each remaining branch.
    pub fn update_branch_list(&mut self, listed: Vec<BranchId>) -> Vec<BranchWindowRequest> {
        let vanished: Vec<BranchId> = self
            .branches
            .keys()
            .filter(|id| !listed.contains(id))
            .cloned()
            .collect();
        for branch_id in vanished {
            if let Some(branch) = self.branches.remove(&branch_id) {
                for commit_id in branch.commits_in_order() {
                    if let Some(commit) = self.commits.get_mut(commit_id) {
                        commit.remove_branch(&branch_id);
                    }
                }
                tracing::info!(branch = %branch_id, "Branch removed");
            }
        }

        for branch_id in &listed {
            if !self.branches.contains_key(branch_id) {
                let branch = self.load_branch(branch_id.clone());
                tracing::info!(branch = %branch_id, deep = branch.is_deep_test(), "Branch added");
                self.branches.insert(branch_id.clone(), branch);
            }
        }

        self.prune_unused_commits();

        self.branches
            .keys()
            .map(|branch_id| BranchWindowRequest {
                branch: branch_id.clone(),
                baseline: (branch_id != &self.settings.baseline_branch)
                    .then(|| self.settings.baseline_branch.clone()),
                depth: self.settings.baseline_depth,
            })
            .collect()
    }

    fn load_branch(&self, branch_id: BranchId) -> Branch {
        let default_deep = branch_id == self.settings.baseline_branch;
        let deep = self
            .database
            .branch_is_deep_test(&branch_id)
            .unwrap_or_else(|e| {
                tracing::warn!(branch = %branch_id, error = %e, "Could not read deep-test flag");
                None
            })
            .unwrap_or(default_deep);

        let mut branch = Branch::new(branch_id, deep);
        match self.database.targeted_tests(branch.branch_id()) {
            Ok(tests) => branch.set_targeted_tests(tests),
            Err(e) => tracing::warn!(branch = %branch.branch_id(), error = %e, "Could not read targeted tests"),
        }
        match self.database.targeted_commit_ids(branch.branch_id()) {
            Ok(ids) => branch.set_targeted_commit_ids(ids),
            Err(e) => tracing::warn!(branch = %branch.branch_id(), error = %e, "Could not read targeted commits"),
        }
        branch
    }

    /// Replace a branch's commits with a freshly fetched window (newest first).
    ///
    /// Returns the commits of the window whose definitions still need fetching.
    pub fn apply_branch_window(
        &mut self,
        branch_id: &BranchId,
        window: Vec<CommitInfo>,
    ) -> Vec<CommitId> {
        if !self.branches.contains_key(branch_id) {
            tracing::debug!(branch = %branch_id, "Ignoring window for unknown branch");
            return Vec::new();
        }

        let pairs: Vec<(CommitId, Option<CommitId>)> = window
            .iter()
            .map(|info| {
                let id = CommitId::new(branch_id.repo(), info.hash.clone());
                let parent = info.parent_hashes.last().map(|p| id.sibling(p.clone()));
                (id, parent)
            })
            .collect();
        let ordered = order_commits(&pairs);

        let previous: Vec<CommitId> = self
            .branches
            .get(branch_id)
            .map(|b| b.commits_in_order().to_vec())
            .unwrap_or_default();
        for commit_id in previous.iter().filter(|id| !ordered.contains(id)) {
            if let Some(commit) = self.commits.get_mut(commit_id) {
                commit.remove_branch(branch_id);
            }
        }

        for (info, (commit_id, _)) in window.into_iter().zip(pairs) {
            if !self.commits.contains_key(&commit_id) {
                let commit = self.create_commit(commit_id.clone(), info);
                self.commits.insert(commit_id.clone(), commit);
            }
            if let Some(commit) = self.commits.get_mut(&commit_id) {
                commit.add_branch(branch_id.clone());
            }
        }

        let needs_definitions: Vec<CommitId> = ordered
            .iter()
            .filter(|id| {
                self.commits
                    .get(*id)
                    .is_some_and(Commit::has_pending_definitions)
            })
            .cloned()
            .collect();

        if let Some(branch) = self.branches.get_mut(branch_id) {
            if branch.commits_in_order() != ordered.as_slice() {
                tracing::info!(branch = %branch_id, commits = ordered.len(), "Branch commits updated");
            }
            branch.set_commits(ordered);
        }
        self.prune_unused_commits();
        needs_definitions
    }

    /// Build a commit, restoring its cached definitions and persisted runs.
    fn create_commit(&self, commit_id: CommitId, info: CommitInfo) -> Commit {
        let mut commit = Commit::new(commit_id.clone(), info.parent_hashes, info.title);

        match self.database.test_definitions_for_commit(&commit_id) {
            Ok(Some(StoredDefinitions::Definitions(defs))) => {
                commit.set_definitions(DefinitionsState::Loaded(defs))
            }
            Ok(Some(StoredDefinitions::Error(message))) => {
                commit.set_definitions(DefinitionsState::Error(message))
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(commit_id = %commit_id, error = %e, "Could not read cached definitions")
            }
        }

        let test_ids = self.database.test_ids_for_commit(&commit_id).unwrap_or_else(|e| {
            tracing::warn!(commit_id = %commit_id, error = %e, "Could not read test list");
            Vec::new()
        });
        for test_id in test_ids {
            match self.database.load_test_result(&test_id) {
                Ok(Some(record)) => {
                    commit.add_test_result(record);
                }
                Ok(None) => tracing::warn!(commit_id = %commit_id, test_id, "Listed test has no record"),
                Err(e) => tracing::warn!(commit_id = %commit_id, test_id, error = %e, "Could not load test record"),
            }
        }

        tracing::debug!(commit_id = %commit_id, runs = commit.test_ids().len(), "Commit created");
        commit
    }

    pub fn prune_unused_commits(&mut self) {
        let before = self.commits.len();
        self.commits.retain(|_, commit| !commit.branches().is_empty());
        let pruned = before - self.commits.len();
        if pruned > 0 {
            tracing::info!(pruned, remaining = self.commits.len(), "Pruned unused commits");
        }
    }

    pub fn commits_needing_definitions(&self) -> Vec<CommitId> {
        let mut ids: Vec<CommitId> = self
            .commits
            .values()
            .filter(|c| c.has_pending_definitions())
            .map(|c| c.commit_id().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Install the contents of a commit's definitions file. A missing or
    /// unparseable file is recorded as a sticky error.
    pub fn set_commit_definitions(
        &mut self,
        commit_id: &CommitId,
        raw: Option<Vec<u8>>,
    ) -> Result<()> {
        if !self.commits.contains_key(commit_id) {
            return Err(LooperError::CommitNotFound(commit_id.clone()));
        }

        let parsed = match raw {
            Some(bytes) => parse_test_definitions(&bytes),
            None => Err(DefinitionError::Missing),
        };
        let (state, stored) = match parsed {
            Ok(defs) => (
                DefinitionsState::Loaded(defs.clone()),
                StoredDefinitions::Definitions(defs),
            ),
            Err(e) => {
                tracing::warn!(commit_id = %commit_id, error = %e, "Test definitions unusable");
                (
                    DefinitionsState::Error(e.to_string()),
                    StoredDefinitions::Error(e.to_string()),
                )
            }
        };

        log_store_error(
            "definitions",
            self.database.set_test_definitions_for_commit(commit_id, &stored),
        );
        if let Some(commit) = self.commits.get_mut(commit_id) {
            commit.set_definitions(state);
        }
        self.dirty_failure_rates_for(commit_id);
        Ok(())
    }

    fn dirty_failure_rates_for(&mut self, commit_id: &CommitId) {
        let Some(commit) = self.commits.get(commit_id) else {
            return;
        };
        for branch_id in commit.branches() {
            if let Some(branch) = self.branches.get_mut(branch_id) {
                branch.dirty_failure_rates();
            }
        }
    }

    fn ensure_failure_rates(&mut self) {
        let commits = &self.commits;
        for branch in self.branches.values_mut() {
            branch.ensure_failure_rates(commits);
        }
    }

    // candidates and priorities

    fn commit_is_under_test(&self, commit: &Commit) -> bool {
        commit
            .branches()
            .iter()
            .any(|b| self.branches.get(b).is_some_and(Branch::is_deep_test))
    }

    fn worker_can_run(worker: Option<&WorkerInfo>, definition: &TestDefinition) -> bool {
        worker.map_or(true, |w| {
            BlockingMachines::machine_can_participate_in_test(w, definition)
        })
    }

    /// Periodic tests of the baseline head that are due at `now`.
    pub fn get_periodic_tests_to_run(
        &self,
        now: DateTime<Utc>,
        worker: Option<&WorkerInfo>,
    ) -> Vec<Candidate> {
        let Some(commit) = self
            .branches
            .get(&self.settings.baseline_branch)
            .and_then(Branch::most_recent_commit)
            .and_then(|id| self.commits.get(id))
        else {
            return Vec::new();
        };

        if commit.needs_build() || commit.build_in_progress() || commit.is_broken_build() {
            tracing::debug!(commit_id = %commit.commit_id(), "Periodic tests wait for build");
            return Vec::new();
        }

        commit
            .test_definitions()
            .iter()
            .filter(|def| def.periodic)
            .filter(|def| match commit.last_test_run_started(&def.name) {
                None => true,
                Some(started) => {
                    (now - started).num_milliseconds() as f64 / 1000.0 > def.period_seconds()
                }
            })
            .filter(|def| Self::worker_can_run(worker, def))
            .map(|def| Candidate::named(commit.commit_id().clone(), def.name.clone()))
            .collect()
    }

    pub fn has_pending_periodic_tests(&self) -> bool {
        !self.get_periodic_tests_to_run(Utc::now(), None).is_empty()
    }

    /// Every (commit, test) that could run now, optionally restricted to what
    /// `worker` can run.
    pub fn get_possible_commits_and_tests(&self, worker: Option<&WorkerInfo>) -> Vec<Candidate> {
        let mut candidates = self.get_periodic_tests_to_run(Utc::now(), worker);

        let mut ids: Vec<&CommitId> = self.commits.keys().collect();
        ids.sort();

        for commit_id in ids {
            let Some(commit) = self.commits.get(commit_id) else {
                continue;
            };
            if !self.commit_is_under_test(commit) || commit.exclude_from_testing_because_of_subject() {
                continue;
            }
            match commit.definitions() {
                DefinitionsState::Pending => {
                    if worker.is_none() {
                        candidates.push(Candidate::unknown(commit_id.clone()));
                    }
                    continue;
                }
                DefinitionsState::Error(_) => continue,
                DefinitionsState::Loaded(_) => {}
            }
            if commit.build_in_progress() || commit.is_broken_build() {
                continue;
            }

            if commit.needs_build() {
                if let Some(build) = commit.test_definition_for(BUILD_TEST_NAME) {
                    if Self::worker_can_run(worker, build) {
                        candidates.push(Candidate::named(commit_id.clone(), BUILD_TEST_NAME));
                    }
                }
                continue;
            }

            for def in commit.test_definitions() {
                if def.is_build() || def.periodic {
                    continue;
                }
                if !self.is_targeted_commit_and_test(commit, &def.name)
                    && commit.total_non_timed_out_runs(&def.name)
                        >= self.settings.max_test_runs_per_commit
                {
                    continue;
                }
                if Self::worker_can_run(worker, def) {
                    candidates.push(Candidate::named(commit_id.clone(), def.name.clone()));
                }
            }
        }

        candidates
    }

    pub fn is_targeted_commit_and_test(&self, commit: &Commit, test_name: &str) -> bool {
        if let Some(targeted) = commit.cached_targeted(test_name) {
            return targeted;
        }
        let targeted = commit.branches().iter().any(|branch_id| {
            self.branches
                .get(branch_id)
                .is_some_and(|b| b.targets(commit.commit_id(), test_name))
        });
        commit.cache_targeted(test_name, targeted);
        targeted
    }

    fn is_targeted_candidate(&self, candidate: &Candidate) -> bool {
        match (&candidate.test, self.commits.get(&candidate.commit_id)) {
            (CandidateTest::Named(name), Some(commit)) => {
                self.is_targeted_commit_and_test(commit, name)
            }
            _ => false,
        }
    }

    /// Strongest evidence over the commit's branches that the test's failure
    /// rate changes at this commit. Estimators must be current.
    pub fn suspiciousness_level_for_test(&self, commit: &Commit, test_name: &str) -> f64 {
        commit
            .branches()
            .iter()
            .filter_map(|b| self.branches.get(b))
            .map(|b| b.suspiciousness(commit.commit_id(), test_name))
            .fold(0.0, f64::max)
    }

    pub fn score_commit_and_test(&self, levels: &HashMap<CommitId, u32>, candidate: &Candidate) -> f64 {
        let level = levels.get(&candidate.commit_id).copied().unwrap_or(0);
        let commit = self.commits.get(&candidate.commit_id);

        let kind = match (&candidate.test, commit) {
            (CandidateTest::Unknown, _) => ScoreKind::Unknown,
            (CandidateTest::Named(name), _) if name == BUILD_TEST_NAME => ScoreKind::Build,
            (CandidateTest::Named(_), None) => ScoreKind::Ordinary { runs: 0 },
            (CandidateTest::Named(name), Some(commit)) => {
                let runs = commit.total_non_timed_out_runs(name);
                if commit.is_periodic_test(name) {
                    ScoreKind::Periodic
                } else if runs == 0 {
                    ScoreKind::Untested
                } else if self.is_targeted_commit_and_test(commit, name) {
                    ScoreKind::Targeted {
                        runs,
                        suspiciousness: self.suspiciousness_level_for_test(commit, name),
                    }
                } else {
                    ScoreKind::Ordinary { runs }
                }
            }
        };
        score(kind, level)
    }

    /// Score candidates and sort them, best first. Ties keep their input order.
    pub fn prioritize_commits_and_tests(
        &mut self,
        candidates: Vec<Candidate>,
    ) -> Vec<PrioritizedCandidate> {
        self.ensure_failure_rates();

        let mut candidates = candidates;
        if rand::thread_rng().gen::<f64>() < self.prefer_targeted_probability {
            let targeted: Vec<Candidate> = candidates
                .iter()
                .filter(|c| self.is_targeted_candidate(c))
                .cloned()
                .collect();
            if !targeted.is_empty() {
                candidates = targeted;
            }
        }

        let levels = compute_commit_levels(&self.commits);
        let mut prioritized: Vec<PrioritizedCandidate> = candidates
            .into_iter()
            .map(|candidate| {
                let priority = self.score_commit_and_test(&levels, &candidate);
                PrioritizedCandidate {
                    candidate,
                    priority,
                }
            })
            .collect();
        prioritized.sort_by(|a, b| b.priority.total_cmp(&a.priority));
        prioritized
    }

    // workers

    /// Find the best run for `worker`, or `None` if it should ask again later.
    pub fn get_task(&mut self, worker: &WorkerInfo) -> Option<TaskAssignment> {
        self.machine_requested_test(&worker.machine_id);

        let record = if self.blocking_machines.has_pending_assignment(&worker.machine_id) {
            self.blocking_machines.claim_pending_assignment(worker)?
        } else {
            let candidates = self.get_possible_commits_and_tests(Some(worker));
            let prioritized = self.prioritize_commits_and_tests(candidates);
            let Some(best) = prioritized.into_iter().next() else {
                tracing::debug!(machine_id = %worker.machine_id, "No candidates for worker");
                return None;
            };
            let CandidateTest::Named(test_name) = &best.candidate.test else {
                return None;
            };
            let definition = self
                .commits
                .get(&best.candidate.commit_id)?
                .test_definition_for(test_name)?
                .clone();
            tracing::debug!(
                machine_id = %worker.machine_id,
                commit_id = %best.candidate.commit_id,
                test_name = %test_name,
                priority = best.priority,
                "Best candidate for worker"
            );
            self.blocking_machines
                .get_test_assignment(&best.candidate.commit_id, &definition, worker)?
        };

        let commit_id = record.commit_id.clone();
        let Some(commit) = self.commits.get_mut(&commit_id) else {
            tracing::warn!(commit_id = %commit_id, test_id = %record.test_id, "Assigned commit is no longer under test");
            return None;
        };
        let definition = commit.test_definition_for(&record.test_name)?.clone();

        if commit.add_test_result(record.clone()) {
            let test_ids = commit.test_ids();
            log_store_error("test record", self.database.update_test_result(&record));
            log_store_error(
                "commit test list",
                self.database.set_test_ids_for_commit(&commit_id, &test_ids),
            );
            self.dirty_failure_rates_for(&commit_id);
        }

        tracing::info!(
            machine_id = %worker.machine_id,
            commit_id = %commit_id,
            test_name = %record.test_name,
            test_id = %record.test_id,
            "Task assigned"
        );
        Some(TaskAssignment {
            commit_id,
            definition,
            record,
        })
    }

    pub fn heartbeat(
        &mut self,
        test_id: &str,
        commit_id: &CommitId,
        machine_id: &str,
    ) -> HeartbeatResponse {
        self.machine_requested_test(machine_id);
        match self.commits.get_mut(commit_id) {
            Some(commit) => commit.heartbeat_test(test_id, machine_id, Utc::now()),
            None => {
                tracing::warn!(commit_id = %commit_id, test_id, "Heartbeat for unknown commit");
                HeartbeatResponse::Done
            }
        }
    }

    /// Store a machine's result. Returns `false` if it was dropped because the
    /// commit or test is unknown, or the run already timed out.
    pub fn record_machine_result(&mut self, result: MachineResult) -> bool {
        self.machine_requested_test(&result.machine);
        let commit_id = result.commit_id.clone();
        let test_id = result.test_id.clone();

        let Some(commit) = self.commits.get_mut(&commit_id) else {
            tracing::warn!(commit_id = %commit_id, test_id, "Result for unknown commit");
            return false;
        };
        let Some(record) = commit.record_machine_result(result, Utc::now()) else {
            tracing::warn!(commit_id = %commit_id, test_id, "Result discarded");
            return false;
        };

        tracing::info!(
            commit_id = %commit_id,
            test_id,
            status = %record.status(),
            "Machine result recorded"
        );
        log_store_error("test record", self.database.update_test_result(record));
        self.dirty_failure_rates_for(&commit_id);
        true
    }

    // administration

    pub fn clear_commit(&mut self, commit_id: &CommitId) -> Result<()> {
        let commit = self
            .commits
            .get_mut(commit_id)
            .ok_or_else(|| LooperError::CommitNotFound(commit_id.clone()))?;
        self.database.clear_all_tests_for_commit(commit_id)?;
        commit.clear_test_results();
        self.dirty_failure_rates_for(commit_id);
        tracing::info!(commit_id = %commit_id, "Cleared all runs of commit");
        Ok(())
    }

    pub fn clear_test_result(&mut self, commit_id: &CommitId, test_id: &str) -> Result<()> {
        let commit = self
            .commits
            .get_mut(commit_id)
            .ok_or_else(|| LooperError::CommitNotFound(commit_id.clone()))?;
        if commit.record(test_id).is_none() {
            return Err(LooperError::TestNotFound(test_id.to_string()));
        }
        self.database.clear_result_for_test_id(commit_id, test_id)?;
        commit.clear_test_result(test_id);
        self.dirty_failure_rates_for(commit_id);
        tracing::info!(commit_id = %commit_id, test_id, "Cleared run");
        Ok(())
    }

    fn dirty_targeted_caches(&self, branch_id: &BranchId) {
        for commit in self.commits_in_branch(branch_id) {
            commit.dirty_test_priority_cache();
        }
    }

    pub fn set_targeted_tests(&mut self, branch_id: &BranchId, tests: Vec<String>) -> Result<()> {
        let branch = self
            .branches
            .get_mut(branch_id)
            .ok_or_else(|| LooperError::BranchNotFound(branch_id.clone()))?;
        self.database.set_targeted_tests(branch_id, &tests)?;
        branch.set_targeted_tests(tests);
        self.dirty_targeted_caches(branch_id);
        Ok(())
    }

    pub fn set_targeted_commit_ids(
        &mut self,
        branch_id: &BranchId,
        ids: Vec<CommitId>,
    ) -> Result<()> {
        let branch = self
            .branches
            .get_mut(branch_id)
            .ok_or_else(|| LooperError::BranchNotFound(branch_id.clone()))?;
        self.database.set_targeted_commit_ids(branch_id, &ids)?;
        branch.set_targeted_commit_ids(ids);
        self.dirty_targeted_caches(branch_id);
        Ok(())
    }

    pub fn set_branch_is_deep_test(&mut self, branch_id: &BranchId, deep: bool) -> Result<()> {
        let branch = self
            .branches
            .get_mut(branch_id)
            .ok_or_else(|| LooperError::BranchNotFound(branch_id.clone()))?;
        self.database.set_branch_is_deep_test(branch_id, deep)?;
        branch.set_is_deep_test(deep);
        Ok(())
    }
}
