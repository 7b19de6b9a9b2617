use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::ProtocolError;
use crate::model::{CommitId, MachineResult};
use crate::scheduler::WorkerInfo;

pub const PROTOCOL_VERSION: &str = "2.2.6";
pub const PROTOCOL_MATCH: &str = "protocol_match";
pub const VERSION_MISMATCH: &str = "error:protocol_version_mismatch";
pub const UNKNOWN_REQUEST: &str = "error:protocol_violation:unknown_request";
pub const MALFORMED_REQUEST: &str = "error:protocol_violation:malformed_request";
/// Answer to a heartbeat from a machine that is not running anything.
pub const WAITING_OK: &str = "OK";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Envelope {
    request: String,
    args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct TestHeartbeatArgs {
    commit_id: CommitId,
    test_id: String,
    machine_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct WaitingHeartbeatArgs {
    machine_id: String,
}

/// A request frame from a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    GetTask(WorkerInfo),
    Heartbeat {
        commit_id: CommitId,
        test_id: String,
        machine_id: String,
    },
    /// A heartbeat from a machine with no test, keeping it known to the scheduler.
    WaitingHeartbeat { machine_id: String },
    PublishTestResult(MachineResult),
}

fn malformed(e: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::Malformed(e.to_string())
}

impl Request {
    /// Parse a request frame. The envelope must be a JSON object with exactly
    /// the keys `request` and `args`.
    pub fn parse(frame: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(frame).map_err(malformed)?;
        match envelope.request.as_str() {
            "getTask" => serde_json::from_value(envelope.args)
                .map(Request::GetTask)
                .map_err(malformed),
            "heartbeat" => {
                if envelope.args.get("commitId").is_some() {
                    let args: TestHeartbeatArgs =
                        serde_json::from_value(envelope.args).map_err(malformed)?;
                    Ok(Request::Heartbeat {
                        commit_id: args.commit_id,
                        test_id: args.test_id,
                        machine_id: args.machine_id,
                    })
                } else {
                    let args: WaitingHeartbeatArgs =
                        serde_json::from_value(envelope.args).map_err(malformed)?;
                    Ok(Request::WaitingHeartbeat {
                        machine_id: args.machine_id,
                    })
                }
            }
            "publishTestResult" => serde_json::from_value(envelope.args)
                .map(Request::PublishTestResult)
                .map_err(malformed),
            other => Err(ProtocolError::UnknownRequest(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::GetTask(_) => "getTask",
            Request::Heartbeat { .. } | Request::WaitingHeartbeat { .. } => "heartbeat",
            Request::PublishTestResult(_) => "publishTestResult",
        }
    }

    pub fn machine_id(&self) -> &str {
        match self {
            Request::GetTask(worker) => &worker.machine_id,
            Request::Heartbeat { machine_id, .. } | Request::WaitingHeartbeat { machine_id } => {
                machine_id
            }
            Request::PublishTestResult(result) => &result.machine,
        }
    }

    /// Whether the server answers this request with a frame.
    pub fn expects_response(&self) -> bool {
        !matches!(self, Request::PublishTestResult(_))
    }

    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        let args = match self {
            Request::GetTask(worker) => serde_json::to_value(worker)?,
            Request::Heartbeat {
                commit_id,
                test_id,
                machine_id,
            } => json!({
                "commitId": commit_id,
                "testId": test_id,
                "machineId": machine_id,
            }),
            Request::WaitingHeartbeat { machine_id } => json!({ "machineId": machine_id }),
            Request::PublishTestResult(result) => serde_json::to_value(result)?,
        };
        Ok(json!({ "request": self.name(), "args": args }).to_string())
    }
}

/// The answer to `getTask` when the worker has something to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub commit_id: CommitId,
    pub test_id: String,
    pub test_name: String,
}
