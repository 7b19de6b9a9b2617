use std::time::Duration;

use super::client::WorkerClient;
use crate::model::{CommitId, HeartbeatResponse};
use crate::protocol::ProtocolError;

/// Heartbeats a running test until the scheduler answers something other than `ack`.
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns `Done` when the leader finished successfully (or the run is
    /// unknown) and `Fail` when the leader failed or the run timed out.
    pub async fn run(
        &self,
        client: &mut WorkerClient,
        commit_id: &CommitId,
        test_id: &str,
        machine_id: &str,
    ) -> Result<HeartbeatResponse, ProtocolError> {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            interval.tick().await;
            match client.heartbeat(commit_id, test_id, machine_id).await? {
                HeartbeatResponse::Ack => continue,
                answer => {
                    tracing::info!(test_id, machine_id, answer = %answer, "Heartbeat loop finished");
                    return Ok(answer);
                }
            }
        }
    }
}
