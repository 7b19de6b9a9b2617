use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::model::{CommitId, TestDefinition, TestRunRecord};

/// Idle machines that have not asked for work for this long are dropped from the pool.
pub const TIMEOUT: Duration = Duration::from_secs(30);

/// A worker machine as it describes itself when asking for work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub machine_id: String,
    pub core_count: u32,
    #[serde(default)]
    pub gpu: bool,
    pub internal_ip: String,
}

#[derive(Debug, Clone)]
struct BlockingMachine {
    info: WorkerInfo,
    last_ping: Instant,
}

impl BlockingMachine {
    fn is_alive(&self, timeout: Duration) -> bool {
        self.last_ping.elapsed() <= timeout
    }
}

/// Pool of idle machines waiting for a multi-machine test to fill up.
///
/// A test needing `n` machines is only handed out once `n` eligible idle
/// machines are present; they then share one run record.
#[derive(Debug)]
pub struct BlockingMachines {
    machines: BTreeMap<String, BlockingMachine>,
    assignments: HashMap<String, TestRunRecord>,
    timeout: Duration,
}

impl Default for BlockingMachines {
    fn default() -> Self {
        Self::new(TIMEOUT)
    }
}

impl BlockingMachines {
    pub fn new(timeout: Duration) -> Self {
        Self {
            machines: BTreeMap::new(),
            assignments: HashMap::new(),
            timeout,
        }
    }

    pub fn machine_can_participate_in_test(worker: &WorkerInfo, definition: &TestDefinition) -> bool {
        let shape = &definition.machines;
        if shape.gpu != worker.gpu {
            return false;
        }
        match shape.cores_exact {
            Some(exact) if exact == worker.core_count => true,
            _ => worker.core_count >= shape.cores_min.unwrap_or(0),
        }
    }

    /// Try to get `worker` a run of `definition` on `commit_id`.
    ///
    /// Returns the run the worker should execute, or `None` if it has to keep
    /// waiting for more machines.
    pub fn get_test_assignment(
        &mut self,
        commit_id: &CommitId,
        definition: &TestDefinition,
        worker: &WorkerInfo,
    ) -> Option<TestRunRecord> {
        self.touch(worker);
        self.cleanup();
        self.resolve_internal_assignments(commit_id, definition, &worker.machine_id);
        self.take_assignment(&worker.machine_id)
    }

    /// Hand over an assignment made while the worker was blocked on another test.
    pub fn claim_pending_assignment(&mut self, worker: &WorkerInfo) -> Option<TestRunRecord> {
        self.touch(worker);
        self.cleanup();
        self.take_assignment(&worker.machine_id)
    }

    fn touch(&mut self, worker: &WorkerInfo) {
        self.machines.insert(
            worker.machine_id.clone(),
            BlockingMachine {
                info: worker.clone(),
                last_ping: Instant::now(),
            },
        );
    }

    fn take_assignment(&mut self, machine_id: &str) -> Option<TestRunRecord> {
        let record = self.assignments.remove(machine_id)?;
        self.machines.remove(machine_id);
        tracing::info!(
            machine_id,
            test_id = %record.test_id,
            test_name = %record.test_name,
            commit_id = %record.commit_id,
            "Machine leaves idle pool with assignment"
        );
        Some(record)
    }

    /// Group idle machines into a run if enough eligible ones are waiting.
    /// The caller is considered first, then the rest by machine id.
    pub fn resolve_internal_assignments(
        &mut self,
        commit_id: &CommitId,
        definition: &TestDefinition,
        caller: &str,
    ) -> Option<String> {
        let wanted = definition.machines.count as usize;
        let eligible = |machine: &BlockingMachine| {
            !self.assignments.contains_key(&machine.info.machine_id)
                && Self::machine_can_participate_in_test(&machine.info, definition)
        };

        let mut chosen: Vec<&WorkerInfo> = Vec::with_capacity(wanted);
        if let Some(machine) = self.machines.get(caller).filter(|m| eligible(*m)) {
            chosen.push(&machine.info);
        }
        for (machine_id, machine) in &self.machines {
            if chosen.len() >= wanted {
                break;
            }
            if machine_id != caller && eligible(machine) {
                chosen.push(&machine.info);
            }
        }

        if chosen.len() < wanted {
            tracing::debug!(
                test_name = %definition.name,
                commit_id = %commit_id,
                have = chosen.len(),
                wanted,
                "Not enough idle machines for test"
            );
            return None;
        }

        let ips: BTreeMap<String, String> = chosen
            .iter()
            .map(|w| (w.machine_id.clone(), w.internal_ip.clone()))
            .collect();
        let leader = chosen
            .iter()
            .min_by(|a, b| {
                a.internal_ip
                    .cmp(&b.internal_ip)
                    .then_with(|| a.machine_id.cmp(&b.machine_id))
            })
            .map(|w| w.machine_id.clone())?;

        let record = TestRunRecord::new(
            definition.name.clone(),
            commit_id.clone(),
            leader,
            ips,
            Utc::now(),
        );
        tracing::info!(
            test_id = %record.test_id,
            test_name = %record.test_name,
            commit_id = %commit_id,
            leader = %record.machine,
            machines = record.machine_to_internal_ip_map.len(),
            "Assigned idle machines to test run"
        );

        let test_id = record.test_id.clone();
        for machine_id in record.machine_to_internal_ip_map.keys() {
            self.assignments.insert(machine_id.clone(), record.clone());
        }
        Some(test_id)
    }

    /// Drop machines that stopped polling. Their pending assignments are abandoned.
    pub fn cleanup(&mut self) {
        let timeout = self.timeout;
        let dead: Vec<String> = self
            .machines
            .iter()
            .filter(|(_, m)| !m.is_alive(timeout))
            .map(|(id, _)| id.clone())
            .collect();

        for machine_id in dead {
            self.machines.remove(&machine_id);
            if let Some(record) = self.assignments.remove(&machine_id) {
                tracing::warn!(
                    machine_id = %machine_id,
                    test_id = %record.test_id,
                    "Idle machine timed out with a pending assignment"
                );
            } else {
                tracing::debug!(machine_id = %machine_id, "Idle machine timed out");
            }
        }
    }

    pub fn remove_machine(&mut self, machine_id: &str) {
        self.machines.remove(machine_id);
        self.assignments.remove(machine_id);
    }

    pub fn has_pending_assignment(&self, machine_id: &str) -> bool {
        self.assignments.contains_key(machine_id)
    }

    pub fn idle_machines(&self) -> Vec<&WorkerInfo> {
        self.machines
            .values()
            .filter(|m| !self.assignments.contains_key(&m.info.machine_id))
            .map(|m| &m.info)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}
