use std::cell::Cell;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use crate::model::record::seconds_between;
use crate::model::{HeartbeatResponse, MachineResult, RunStatus, TestRunRecord};

/// Seconds after which a snapshot with running work is recomputed, so timeouts show up.
pub const UPDATE_INTERVAL_SECS: f64 = 30.0;

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    computed_at: DateTime<Utc>,
    running: usize,
    passed: usize,
    failed: usize,
    timed_out: usize,
    total_elapsed_minutes: f64,
    running_elapsed_minutes: f64,
}

impl Snapshot {
    fn compute<'a>(records: impl Iterator<Item = &'a TestRunRecord>, now: DateTime<Utc>) -> Self {
        let mut snapshot = Snapshot {
            computed_at: now,
            running: 0,
            passed: 0,
            failed: 0,
            timed_out: 0,
            total_elapsed_minutes: 0.0,
            running_elapsed_minutes: 0.0,
        };
        for record in records {
            match record.status_at(now) {
                RunStatus::Running => {
                    snapshot.running += 1;
                    snapshot.running_elapsed_minutes += record.minutes_elapsed_at(now);
                }
                RunStatus::Passed => {
                    snapshot.passed += 1;
                    snapshot.total_elapsed_minutes += record.minutes_elapsed_at(now);
                }
                RunStatus::Failed => {
                    snapshot.failed += 1;
                    snapshot.total_elapsed_minutes += record.minutes_elapsed_at(now);
                }
                RunStatus::Timeout => snapshot.timed_out += 1,
            }
        }
        snapshot
    }

    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.running > 0 && seconds_between(self.computed_at, now) > UPDATE_INTERVAL_SECS
    }
}

/// Aggregate counts for one test name, or a combination of several.
///
/// Counts are fractional because [`StatsSummary::combined_with`] scales them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSummary {
    pub running_count: f64,
    pub pass_count: f64,
    pub fail_count: f64,
    pub timeout_count: f64,
    pub completed_count: f64,
    pub total_elapsed_minutes: f64,
    pub running_elapsed_minutes: f64,
}

impl StatsSummary {
    pub fn pass_rate(&self) -> Option<f64> {
        (self.completed_count > 0.0).then(|| self.pass_count / self.completed_count)
    }

    /// Statistics for running both tests: a run passes only if both would.
    pub fn combined_with(&self, other: &StatsSummary) -> StatsSummary {
        let mut combined = StatsSummary {
            running_count: self.running_count + other.running_count,
            timeout_count: self.timeout_count + other.timeout_count,
            total_elapsed_minutes: self.total_elapsed_minutes + other.total_elapsed_minutes,
            running_elapsed_minutes: self.running_elapsed_minutes + other.running_elapsed_minutes,
            ..StatsSummary::default()
        };

        if self.completed_count == 0.0 {
            combined.pass_count = other.pass_count;
            combined.fail_count = other.fail_count;
        } else if other.completed_count == 0.0 {
            combined.pass_count = self.pass_count;
            combined.fail_count = self.fail_count;
        } else {
            let completed = self.completed_count.min(other.completed_count);
            let pass_rate = (self.pass_count / self.completed_count)
                * (other.pass_count / other.completed_count);
            combined.pass_count = pass_rate * completed;
            combined.fail_count = completed - combined.pass_count;
        }
        combined.completed_count = combined.pass_count + combined.fail_count;
        combined
    }
}

/// All runs of one test name on one commit, with a lazily recomputed snapshot.
#[derive(Debug, Default)]
pub struct TestStats {
    records: IndexMap<String, TestRunRecord>,
    cache: Cell<Option<Snapshot>>,
}

impl TestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_test(&mut self, record: TestRunRecord) {
        self.records.insert(record.test_id.clone(), record);
        self.dirty_cache();
    }

    pub fn remove_test(&mut self, test_id: &str) -> Option<TestRunRecord> {
        let removed = self.records.shift_remove(test_id);
        if removed.is_some() {
            self.dirty_cache();
        }
        removed
    }

    pub fn dirty_cache(&mut self) {
        self.cache.set(None);
    }

    pub fn get(&self, test_id: &str) -> Option<&TestRunRecord> {
        self.records.get(test_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &TestRunRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Heartbeats only refresh liveness, so the snapshot is left alone.
    pub fn heartbeat(
        &mut self,
        test_id: &str,
        machine: &str,
        now: DateTime<Utc>,
    ) -> Option<HeartbeatResponse> {
        self.records
            .get_mut(test_id)
            .map(|record| record.heartbeat_from_machine(machine, now))
    }

    /// Apply a machine result; `None` if the test is unknown or the run already timed out.
    pub fn record_machine_result(
        &mut self,
        result: MachineResult,
        now: DateTime<Utc>,
    ) -> Option<&TestRunRecord> {
        let test_id = result.test_id.clone();
        let record = self.records.get_mut(&test_id)?;
        if !record.record_machine_result(result, now) {
            return None;
        }
        self.dirty_cache();
        self.records.get(&test_id)
    }

    fn snapshot_at(&self, now: DateTime<Utc>) -> Snapshot {
        match self.cache.get() {
            Some(snapshot) if !snapshot.is_stale(now) => snapshot,
            _ => {
                let snapshot = Snapshot::compute(self.records.values(), now);
                self.cache.set(Some(snapshot));
                snapshot
            }
        }
    }

    fn snapshot(&self) -> Snapshot {
        self.snapshot_at(Utc::now())
    }

    pub fn running_count(&self) -> usize {
        self.snapshot().running
    }

    pub fn pass_count(&self) -> usize {
        self.snapshot().passed
    }

    pub fn fail_count(&self) -> usize {
        self.snapshot().failed
    }

    pub fn timeout_count(&self) -> usize {
        self.snapshot().timed_out
    }

    pub fn completed_count(&self) -> usize {
        let snapshot = self.snapshot();
        snapshot.passed + snapshot.failed
    }

    pub fn total_elapsed_minutes(&self) -> f64 {
        self.snapshot().total_elapsed_minutes
    }

    pub fn running_elapsed_minutes(&self) -> f64 {
        self.snapshot().running_elapsed_minutes
    }

    pub fn summary_at(&self, now: DateTime<Utc>) -> StatsSummary {
        let s = self.snapshot_at(now);
        StatsSummary {
            running_count: s.running as f64,
            pass_count: s.passed as f64,
            fail_count: s.failed as f64,
            timeout_count: s.timed_out as f64,
            completed_count: (s.passed + s.failed) as f64,
            total_elapsed_minutes: s.total_elapsed_minutes,
            running_elapsed_minutes: s.running_elapsed_minutes,
        }
    }

    pub fn summary(&self) -> StatsSummary {
        self.summary_at(Utc::now())
    }

    /// Start time of the most recently added run.
    pub fn last_test_run_started(&self) -> Option<DateTime<Utc>> {
        self.records.last().map(|(_, record)| record.started)
    }
}
