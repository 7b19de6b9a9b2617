use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::model::{BranchId, CommitId};
use crate::stats::SequentialFailureRates;

use super::commit::Commit;

/// Probabilities of change for the three failure-rate estimators, weakest first.
pub const FAILURE_RATE_LEVELS: [f64; 3] = [0.1, 0.01, 0.001];

/// One estimator per test name at a single probability of change.
type FailureRateTable = BTreeMap<String, SequentialFailureRates>;

#[derive(Debug)]
pub struct Branch {
    branch_id: BranchId,
    commits_in_order: Vec<CommitId>,
    commit_id_to_index: HashMap<CommitId, usize>,
    failure_rates: Option<[FailureRateTable; 3]>,
    targeted_tests: Vec<String>,
    targeted_commit_ids: Vec<CommitId>,
    is_deep_test: bool,
}

impl Branch {
    pub fn new(branch_id: BranchId, is_deep_test: bool) -> Self {
        Self {
            branch_id,
            commits_in_order: Vec::new(),
            commit_id_to_index: HashMap::new(),
            failure_rates: None,
            targeted_tests: Vec::new(),
            targeted_commit_ids: Vec::new(),
            is_deep_test,
        }
    }

    pub fn branch_id(&self) -> &BranchId {
        &self.branch_id
    }

    /// Commits newest first.
    pub fn commits_in_order(&self) -> &[CommitId] {
        &self.commits_in_order
    }

    pub fn len(&self) -> usize {
        self.commits_in_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits_in_order.is_empty()
    }

    pub fn contains(&self, commit_id: &CommitId) -> bool {
        self.commit_id_to_index.contains_key(commit_id)
    }

    pub fn index_of(&self, commit_id: &CommitId) -> Option<usize> {
        self.commit_id_to_index.get(commit_id).copied()
    }

    pub fn most_recent_commit(&self) -> Option<&CommitId> {
        self.commits_in_order.first()
    }

    /// Replace the branch's contents with an already ordered list.
    pub fn set_commits(&mut self, ordered: Vec<CommitId>) {
        self.commit_id_to_index = ordered
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();
        self.commits_in_order = ordered;
        self.dirty_failure_rates();
    }

    pub fn is_deep_test(&self) -> bool {
        self.is_deep_test
    }

    pub fn set_is_deep_test(&mut self, is_deep_test: bool) {
        self.is_deep_test = is_deep_test;
    }

    pub fn targeted_tests(&self) -> &[String] {
        &self.targeted_tests
    }

    pub fn set_targeted_tests(&mut self, tests: Vec<String>) {
        self.targeted_tests = tests;
    }

    /// Targeted commits that are actually on this branch.
    pub fn targeted_commit_ids(&self) -> Vec<&CommitId> {
        self.targeted_commit_ids
            .iter()
            .filter(|id| self.contains(id))
            .collect()
    }

    pub fn set_targeted_commit_ids(&mut self, ids: Vec<CommitId>) {
        self.targeted_commit_ids = ids;
    }

    /// Whether `(commit, test)` is singled out by this branch's targeting lists.
    pub fn targets(&self, commit_id: &CommitId, test_name: &str) -> bool {
        let targeted_commits = self.targeted_commit_ids();
        let lists_commit = targeted_commits.contains(&commit_id);
        let lists_test = self.targeted_tests.iter().any(|t| t == test_name);

        if lists_test {
            targeted_commits.is_empty() || lists_commit
        } else {
            lists_commit && self.targeted_tests.is_empty()
        }
    }

    // failure rates

    pub fn dirty_failure_rates(&mut self) {
        self.failure_rates = None;
    }

    pub fn failure_rates_dirty(&self) -> bool {
        self.failure_rates.is_none()
    }

    /// Rebuild the estimators if a commit on the branch recorded a result since
    /// the last build. Commits are fed oldest first.
    pub fn ensure_failure_rates(&mut self, commits: &HashMap<CommitId, Commit>) {
        if self.failure_rates.is_some() {
            return;
        }

        let on_branch: Vec<Option<&Commit>> = self
            .commits_in_order
            .iter()
            .rev()
            .map(|id| commits.get(id))
            .collect();

        let test_names: BTreeSet<&str> = on_branch
            .iter()
            .flatten()
            .flat_map(|commit| commit.stats_by_type().keys().map(String::as_str))
            .collect();

        let mut tables: [FailureRateTable; 3] = Default::default();
        for (table, level) in tables.iter_mut().zip(FAILURE_RATE_LEVELS) {
            for name in &test_names {
                let mut rates = SequentialFailureRates::new(level);
                for commit in &on_branch {
                    let (fails, completed) = commit
                        .and_then(|c| c.stats_for(name))
                        .map_or((0, 0), |s| (s.fail_count(), s.completed_count()));
                    rates.add(fails as u64, completed as u64);
                }
                table.insert(name.to_string(), rates);
            }
        }

        tracing::debug!(
            branch = %self.branch_id,
            tests = test_names.len(),
            commits = self.commits_in_order.len(),
            "Rebuilt failure-rate estimators"
        );
        self.failure_rates = Some(tables);
    }

    /// Position of a commit inside the estimators (oldest commit is 0).
    fn estimator_index(&self, commit_id: &CommitId) -> Option<usize> {
        self.index_of(commit_id)
            .map(|index| self.commits_in_order.len() - index - 1)
    }

    pub fn failure_rates_for(
        &self,
        level_index: usize,
        test_name: &str,
    ) -> Option<&SequentialFailureRates> {
        self.failure_rates.as_ref()?.get(level_index)?.get(test_name)
    }

    /// The most significant level at which the commit starts a new failure-rate
    /// segment for this test.
    pub fn statistically_noticeable_break(
        &self,
        commit_id: &CommitId,
        test_name: &str,
    ) -> Option<f64> {
        let index = self.estimator_index(commit_id)?;
        (0..FAILURE_RATE_LEVELS.len())
            .rev()
            .find(|&level| {
                self.failure_rates_for(level, test_name)
                    .is_some_and(|rates| rates.is_break(index))
            })
            .map(|level| FAILURE_RATE_LEVELS[level])
    }

    /// How suspicious a commit is for a test: `-ln(level)` for a committed break,
    /// otherwise the likelihood gain of a hypothetical break at the strictest level.
    pub fn suspiciousness(&self, commit_id: &CommitId, test_name: &str) -> f64 {
        if let Some(level) = self.statistically_noticeable_break(commit_id, test_name) {
            return -level.ln();
        }
        let Some(index) = self.estimator_index(commit_id) else {
            return 0.0;
        };
        self.failure_rates_for(FAILURE_RATE_LEVELS.len() - 1, test_name)
            .map_or(0.0, |rates| {
                rates.log_likelihood_improvement_from_adding_break(index)
            })
            .max(0.0)
    }
}
