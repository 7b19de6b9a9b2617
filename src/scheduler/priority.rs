//! Scoring of (commit, test) candidates.
//!
//! Scores fall into bands that never overlap for any realistic commit depth:
//! unknown definitions, then builds, then periodic tests, then never-run tests,
//! then targeted tests, then everything else.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::graph::Commit;
use crate::model::CommitId;

/// Chance that a scheduling pass only considers targeted candidates when any exist.
pub const PREFER_TARGETED_PROBABILITY: f64 = 0.5;

pub const UNKNOWN_BAND: f64 = 1e13;
pub const BUILD_BAND: f64 = 1e9;
pub const PERIODIC_BAND: f64 = 1e6;
pub const UNTESTED_BAND: f64 = 1e5;
pub const TARGETED_BAND: f64 = 1000.0;

/// Suspiciousness beyond this adds nothing to a targeted test's priority.
pub const MAX_SUSPICIOUSNESS: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CandidateTest {
    /// The commit's definitions have not been fetched yet.
    Unknown,
    Named(String),
}

impl CandidateTest {
    pub fn name(&self) -> Option<&str> {
        match self {
            CandidateTest::Unknown => None,
            CandidateTest::Named(name) => Some(name),
        }
    }
}

impl fmt::Display for CandidateTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateTest::Unknown => write!(f, "<unknown>"),
            CandidateTest::Named(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub commit_id: CommitId,
    pub test: CandidateTest,
}

impl Candidate {
    pub fn named(commit_id: CommitId, test_name: impl Into<String>) -> Self {
        Self {
            commit_id,
            test: CandidateTest::Named(test_name.into()),
        }
    }

    pub fn unknown(commit_id: CommitId) -> Self {
        Self {
            commit_id,
            test: CandidateTest::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrioritizedCandidate {
    pub candidate: Candidate,
    pub priority: f64,
}

/// Kind of candidate being scored, in band order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreKind {
    Unknown,
    Build,
    Periodic,
    Untested,
    Targeted { runs: usize, suspiciousness: f64 },
    Ordinary { runs: usize },
}

pub fn score(kind: ScoreKind, level: u32) -> f64 {
    let level = f64::from(level);
    match kind {
        ScoreKind::Unknown => UNKNOWN_BAND - level,
        ScoreKind::Build => BUILD_BAND - level,
        ScoreKind::Periodic => PERIODIC_BAND - level,
        ScoreKind::Untested => UNTESTED_BAND - level / 10000.0,
        ScoreKind::Targeted {
            runs,
            suspiciousness,
        } => {
            let s = suspiciousness.min(MAX_SUSPICIOUSNESS);
            let weight = 1.0 / (0.5 + 1.5f64.powf(s)) / 5.0;
            TARGETED_BAND - level / 10000.0 - runs as f64 * weight
        }
        ScoreKind::Ordinary { runs } => -level / 10000.0 - runs as f64 / 10.0,
    }
}

/// Distance of every commit from the nearest leaf, following ordering parents.
///
/// Leaves (commits nobody names as ordering parent) are at level 0; a commit's
/// level is the minimum over all paths. Commits unreachable from any leaf, which
/// only happens for cyclic input, are placed at level 0.
pub fn compute_commit_levels(commits: &HashMap<CommitId, Commit>) -> HashMap<CommitId, u32> {
    let parents: HashSet<CommitId> = commits
        .values()
        .filter_map(Commit::ordering_parent_id)
        .collect();

    let mut leaves: Vec<&CommitId> = commits.keys().filter(|id| !parents.contains(*id)).collect();
    leaves.sort();

    let mut levels: HashMap<CommitId, u32> = HashMap::with_capacity(commits.len());
    let mut stack: Vec<(&CommitId, u32)> = leaves.into_iter().map(|id| (id, 0)).collect();

    while let Some((id, level)) = stack.pop() {
        if levels.get(id).is_some_and(|&existing| existing <= level) {
            continue;
        }
        levels.insert(id.clone(), level);
        if let Some(parent) = commits.get(id).and_then(Commit::ordering_parent_id) {
            if let Some((parent_id, _)) = commits.get_key_value(&parent) {
                stack.push((parent_id, level + 1));
            }
        }
    }

    for id in commits.keys() {
        levels.entry(id.clone()).or_insert(0);
    }
    levels
}
