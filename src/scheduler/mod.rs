pub mod manager;
pub mod matcher;
pub mod priority;
pub mod refresh;

use std::sync::Arc;

use tokio::sync::Mutex;

pub use manager::{BranchWindowRequest, TaskAssignment, TestManager};
pub use matcher::{BlockingMachines, WorkerInfo};
pub use priority::{Candidate, CandidateTest, PrioritizedCandidate, PREFER_TARGETED_PROBABILITY};
pub use refresh::{fetch_commits_under_test, refresh, update_commits_under_test, RefreshReport};

/// The scheduler behind the single lock every connection and the refresh loop share.
pub type SharedManager = Arc<Mutex<TestManager>>;
