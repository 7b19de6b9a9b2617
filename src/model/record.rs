use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::definition::BUILD_TEST_NAME;
use super::ids::CommitId;

/// Seconds without a heartbeat after which a run is considered dead.
pub const HEARTBEAT_TIMEOUT_SECS: f64 = 300.0;

pub(crate) fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Passed,
    Failed,
    Timeout,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Passed => write!(f, "passed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// What a worker should do after sending a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResponse {
    /// Keep going.
    Ack,
    /// Stop; the run is over and succeeded (or is unknown).
    Done,
    /// Stop; the run is over and failed or timed out.
    Fail,
}

impl HeartbeatResponse {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeartbeatResponse::Ack => "ack",
            HeartbeatResponse::Done => "done",
            HeartbeatResponse::Fail => "fail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ack" => Some(HeartbeatResponse::Ack),
            "done" => Some(HeartbeatResponse::Done),
            "fail" => Some(HeartbeatResponse::Fail),
            _ => None,
        }
    }

    fn from_success(success: bool) -> Self {
        if success {
            HeartbeatResponse::Done
        } else {
            HeartbeatResponse::Fail
        }
    }
}

impl fmt::Display for HeartbeatResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub name: String,
    #[serde(default)]
    pub time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Outcome reported by one machine participating in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineResult {
    pub machine: String,
    pub test_id: String,
    pub commit_id: CommitId,
    pub success: bool,
    #[serde(default)]
    pub log_messages: Vec<String>,
    #[serde(default)]
    pub performance_results: Vec<PerformanceSample>,
    pub finish_time: DateTime<Utc>,
}

/// One execution of one test on one commit, possibly spanning several machines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunRecord {
    pub test_id: String,
    pub test_name: String,
    pub commit_id: CommitId,
    /// The leader: the participant with the smallest internal IP.
    pub machine: String,
    pub machine_to_internal_ip_map: BTreeMap<String, String>,
    pub started: DateTime<Utc>,
    #[serde(default)]
    pub heartbeat: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub machine_results: BTreeMap<String, MachineResult>,
}

impl TestRunRecord {
    pub fn new(
        test_name: impl Into<String>,
        commit_id: CommitId,
        machine: impl Into<String>,
        machine_to_internal_ip_map: BTreeMap<String, String>,
        started: DateTime<Utc>,
    ) -> Self {
        Self {
            test_id: Uuid::new_v4().simple().to_string(),
            test_name: test_name.into(),
            commit_id,
            machine: machine.into(),
            machine_to_internal_ip_map,
            started,
            heartbeat: BTreeMap::new(),
            machine_results: BTreeMap::new(),
        }
    }

    pub fn is_build(&self) -> bool {
        self.test_name == BUILD_TEST_NAME
    }

    pub fn machines(&self) -> impl Iterator<Item = &str> {
        self.machine_to_internal_ip_map.keys().map(String::as_str)
    }

    /// The machine with the smallest internal IP; ties go to the smaller machine id.
    pub fn master_machine(&self) -> &str {
        self.machine_to_internal_ip_map
            .iter()
            .min_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
            .map(|(machine, _)| machine.as_str())
            .unwrap_or(&self.machine)
    }

    /// Internal IPs in the order handed to the test script: leader first.
    pub fn ip_list(&self) -> Vec<String> {
        let master = self.master_machine();
        let mut ips = Vec::with_capacity(self.machine_to_internal_ip_map.len());
        if let Some(ip) = self.machine_to_internal_ip_map.get(master) {
            ips.push(ip.clone());
        }
        ips.extend(
            self.machine_to_internal_ip_map
                .iter()
                .filter(|(machine, _)| machine.as_str() != master)
                .map(|(_, ip)| ip.clone()),
        );
        ips
    }

    pub fn has_result_for_machine(&self, machine: &str) -> bool {
        self.machine_results.contains_key(machine)
    }

    fn all_results_in(&self) -> bool {
        self.machine_to_internal_ip_map
            .keys()
            .all(|machine| self.machine_results.contains_key(machine))
    }

    pub fn master_machine_result(&self) -> Option<&MachineResult> {
        self.machine_results.get(self.master_machine())
    }

    /// Oldest heartbeat among participants that have sent one; `started` until
    /// any has.
    pub fn oldest_heartbeat(&self) -> DateTime<Utc> {
        self.heartbeat
            .iter()
            .filter(|(machine, _)| self.machine_to_internal_ip_map.contains_key(*machine))
            .map(|(_, at)| *at)
            .min()
            .unwrap_or(self.started)
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> RunStatus {
        if self.all_results_in() {
            return match self.master_machine_result() {
                Some(result) if result.success => RunStatus::Passed,
                _ => RunStatus::Failed,
            };
        }
        if seconds_between(self.oldest_heartbeat(), now) > HEARTBEAT_TIMEOUT_SECS {
            RunStatus::Timeout
        } else {
            RunStatus::Running
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status_at(Utc::now())
    }

    pub fn heartbeat_from_machine(
        &mut self,
        machine: &str,
        now: DateTime<Utc>,
    ) -> HeartbeatResponse {
        if self.status_at(now) == RunStatus::Timeout {
            return HeartbeatResponse::Fail;
        }
        self.heartbeat.insert(machine.to_string(), now);

        if !self.is_build() && machine != self.master_machine() {
            if let Some(result) = self.master_machine_result() {
                return HeartbeatResponse::from_success(result.success);
            }
        }
        HeartbeatResponse::Ack
    }

    /// Store a machine's result. Returns `false` when the run already timed out,
    /// in which case nothing is recorded.
    pub fn record_machine_result(&mut self, result: MachineResult, now: DateTime<Utc>) -> bool {
        if self.status_at(now) == RunStatus::Timeout {
            return false;
        }
        self.machine_results.insert(result.machine.clone(), result);
        true
    }

    pub fn finished_time(&self) -> Option<DateTime<Utc>> {
        if !self.all_results_in() {
            return None;
        }
        self.machine_results.values().map(|r| r.finish_time).max()
    }

    pub fn performance_results(&self) -> impl Iterator<Item = &PerformanceSample> {
        self.machine_results
            .values()
            .flat_map(|r| r.performance_results.iter())
    }

    pub fn seconds_elapsed_at(&self, now: DateTime<Utc>) -> f64 {
        let end = self.finished_time().unwrap_or(now);
        seconds_between(self.started, end).max(0.0)
    }

    /// Longest reported performance time if any, otherwise wall clock since start.
    pub fn minutes_elapsed_at(&self, now: DateTime<Utc>) -> f64 {
        let longest = self
            .performance_results()
            .filter_map(|p| p.time)
            .fold(None, |acc: Option<f64>, t| Some(acc.map_or(t, |a| a.max(t))));
        match longest {
            Some(seconds) => seconds / 60.0,
            None => self.seconds_elapsed_at(now) / 60.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn two_machine_record(test_name: &str, started: DateTime<Utc>) -> TestRunRecord {
        let mut ips = BTreeMap::new();
        ips.insert("m-a".to_string(), "10.0.0.9".to_string());
        ips.insert("m-b".to_string(), "10.0.0.2".to_string());
        TestRunRecord::new(test_name, CommitId::new("repo", "abc"), "m-b", ips, started)
    }

    fn result(record: &TestRunRecord, machine: &str, success: bool, at: DateTime<Utc>) -> MachineResult {
        MachineResult {
            machine: machine.to_string(),
            test_id: record.test_id.clone(),
            commit_id: record.commit_id.clone(),
            success,
            log_messages: Vec::new(),
            performance_results: Vec::new(),
            finish_time: at,
        }
    }

    #[test]
    fn master_is_smallest_ip() {
        let record = two_machine_record("unit", Utc::now());
        assert_eq!(record.master_machine(), "m-b");
        assert_eq!(record.ip_list(), vec!["10.0.0.2", "10.0.0.9"]);
    }

    #[test]
    fn running_with_fresh_heartbeat() {
        let start = Utc::now();
        let mut record = two_machine_record("unit", start);
        let later = start + Duration::seconds(250);
        record.heartbeat_from_machine("m-a", later);
        record.heartbeat_from_machine("m-b", later);
        assert_eq!(
            record.status_at(start + Duration::seconds(400)),
            RunStatus::Running
        );
    }

    #[test]
    fn times_out_after_heartbeat_timeout() {
        let start = Utc::now();
        let record = two_machine_record("unit", start);
        let later = start + Duration::seconds(HEARTBEAT_TIMEOUT_SECS as i64 + 1);
        assert_eq!(record.status_at(later), RunStatus::Timeout);
    }

    #[test]
    fn one_fresh_heartbeat_keeps_the_run_alive() {
        let start = Utc::now();
        let mut record = two_machine_record("unit", start);
        record.heartbeat_from_machine("m-a", start + Duration::seconds(250));
        // m-b has never sent one; only machines that did are considered.
        assert_eq!(
            record.status_at(start + Duration::seconds(301)),
            RunStatus::Running
        );
        assert_eq!(record.oldest_heartbeat(), start + Duration::seconds(250));
    }

    #[test]
    fn oldest_heartbeat_controls_timeout() {
        let start = Utc::now();
        let mut record = two_machine_record("unit", start);
        record.heartbeat_from_machine("m-a", start + Duration::seconds(100));
        record.heartbeat_from_machine("m-b", start + Duration::seconds(250));
        assert_eq!(
            record.status_at(start + Duration::seconds(350)),
            RunStatus::Running
        );
        assert_eq!(
            record.status_at(start + Duration::seconds(401)),
            RunStatus::Timeout
        );
    }

    #[test]
    fn timeout_is_terminal() {
        let start = Utc::now();
        let mut record = two_machine_record("unit", start);
        let late = start + Duration::seconds(400);
        assert_eq!(
            record.heartbeat_from_machine("m-a", late),
            HeartbeatResponse::Fail
        );
        assert!(record.heartbeat.is_empty());
        let r = result(&record, "m-a", true, late);
        assert!(!record.record_machine_result(r, late));
        assert_eq!(record.status_at(late), RunStatus::Timeout);
    }

    #[test]
    fn passes_iff_master_succeeds() {
        let start = Utc::now();
        let mut record = two_machine_record("unit", start);
        let t = start + Duration::seconds(10);
        let a = result(&record, "m-a", false, t);
        let b = result(&record, "m-b", true, t);
        assert!(record.record_machine_result(a, t));
        assert_eq!(record.status_at(t), RunStatus::Running);
        assert!(record.record_machine_result(b, t));
        assert_eq!(record.status_at(t), RunStatus::Passed);
        assert_eq!(record.finished_time(), Some(t));
    }

    #[test]
    fn follower_is_released_once_leader_reports() {
        let start = Utc::now();
        let mut record = two_machine_record("unit", start);
        let t = start + Duration::seconds(5);
        assert_eq!(record.heartbeat_from_machine("m-a", t), HeartbeatResponse::Ack);
        let leader = result(&record, "m-b", false, t);
        record.record_machine_result(leader, t);
        assert_eq!(record.heartbeat_from_machine("m-a", t), HeartbeatResponse::Fail);
        assert_eq!(record.heartbeat_from_machine("m-b", t), HeartbeatResponse::Ack);
    }

    #[test]
    fn build_followers_are_not_released_early() {
        let start = Utc::now();
        let mut record = two_machine_record(BUILD_TEST_NAME, start);
        let t = start + Duration::seconds(5);
        let leader = result(&record, "m-b", true, t);
        record.record_machine_result(leader, t);
        assert_eq!(record.heartbeat_from_machine("m-a", t), HeartbeatResponse::Ack);
    }

    #[test]
    fn minutes_elapsed_prefers_performance_results() {
        let start = Utc::now();
        let mut record = two_machine_record("unit", start);
        let t = start + Duration::seconds(600);
        let mut r = result(&record, "m-b", true, t);
        r.performance_results.push(PerformanceSample {
            name: "bench".to_string(),
            time: Some(120.0),
            metadata: None,
        });
        record.record_machine_result(r, start + Duration::seconds(1));
        assert_eq!(record.minutes_elapsed_at(t), 2.0);
    }

    #[test]
    fn record_serializes_with_camel_case_keys() {
        let record = two_machine_record("unit", Utc::now());
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("testId").is_some());
        assert!(value.get("machineToInternalIpMap").is_some());
        let back: TestRunRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn heartbeat_response_strings() {
        for r in [HeartbeatResponse::Ack, HeartbeatResponse::Done, HeartbeatResponse::Fail] {
            assert_eq!(HeartbeatResponse::parse(r.as_str()), Some(r));
        }
        assert_eq!(HeartbeatResponse::parse("OK"), None);
    }
}
