use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use super::codec::FrameStream;
use super::message::{
    Request, TaskResponse, MALFORMED_REQUEST, PROTOCOL_MATCH, PROTOCOL_VERSION, UNKNOWN_REQUEST,
    VERSION_MISMATCH, WAITING_OK,
};
use super::registry::SessionRegistry;
use super::ProtocolError;
use crate::scheduler::SharedManager;

/// One worker connection: handshake, then a request/response loop until the
/// peer leaves, goes idle, breaks the protocol, or the server shuts down.
pub struct Session<S> {
    id: u64,
    frames: FrameStream<S>,
    manager: SharedManager,
    registry: Arc<SessionRegistry>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        id: u64,
        io: S,
        manager: SharedManager,
        registry: Arc<SessionRegistry>,
        idle_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            frames: FrameStream::new(io),
            manager,
            registry,
            idle_timeout,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<(), ProtocolError> {
        self.handshake().await?;

        loop {
            let frame = tokio::select! {
                biased;

                () = self.shutdown.cancelled() => {
                    tracing::debug!(session_id = self.id, "Closing session for shutdown");
                    return Ok(());
                }

                frame = tokio::time::timeout(self.idle_timeout, self.frames.recv()) => frame,
            };

            let frame = match frame {
                Err(_) => {
                    tracing::info!(
                        session_id = self.id,
                        idle_secs = self.idle_timeout.as_secs(),
                        "Closing idle worker connection"
                    );
                    return Err(ProtocolError::Timeout(self.idle_timeout));
                }
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(ProtocolError::Malformed(reason))) => {
                    self.frames.send(MALFORMED_REQUEST).await?;
                    return Err(ProtocolError::Malformed(reason));
                }
                Ok(Err(e)) => return Err(e),
            };

            match Request::parse(&frame) {
                Ok(request) => {
                    self.registry.record_request(self.id, request.machine_id());
                    if let Some(response) = dispatch(&self.manager, request).await? {
                        self.frames.send(&response).await?;
                    }
                }
                Err(ProtocolError::UnknownRequest(name)) => {
                    tracing::warn!(session_id = self.id, request = %name, "Unknown request");
                    self.frames.send(UNKNOWN_REQUEST).await?;
                }
                Err(e) => {
                    tracing::warn!(session_id = self.id, error = %e, "Malformed request, closing");
                    self.frames.send(MALFORMED_REQUEST).await?;
                    return Err(e);
                }
            }
        }
    }

    async fn handshake(&mut self) -> Result<(), ProtocolError> {
        let version = tokio::time::timeout(self.idle_timeout, self.frames.expect())
            .await
            .map_err(|_| ProtocolError::Timeout(self.idle_timeout))??;

        if version != PROTOCOL_VERSION {
            tracing::warn!(
                session_id = self.id,
                expected = PROTOCOL_VERSION,
                received = %version,
                "Worker speaks another protocol version"
            );
            self.frames.send(VERSION_MISMATCH).await?;
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION.to_string(),
                received: version,
            });
        }
        self.frames.send(PROTOCOL_MATCH).await
    }
}

/// Run one request against the scheduler, returning the response frame if
/// the request has one.
async fn dispatch(manager: &SharedManager, request: Request) -> Result<Option<String>, ProtocolError> {
    match request {
        Request::GetTask(worker) => {
            let assignment = manager.lock().await.get_task(&worker);
            let response = assignment.map(|a| TaskResponse {
                commit_id: a.commit_id,
                test_id: a.record.test_id,
                test_name: a.record.test_name,
            });
            Ok(Some(serde_json::to_string(&response)?))
        }
        Request::Heartbeat {
            commit_id,
            test_id,
            machine_id,
        } => {
            let answer = manager
                .lock()
                .await
                .heartbeat(&test_id, &commit_id, &machine_id);
            Ok(Some(answer.as_str().to_string()))
        }
        Request::WaitingHeartbeat { machine_id } => {
            manager.lock().await.machine_requested_test(&machine_id);
            Ok(Some(WAITING_OK.to_string()))
        }
        Request::PublishTestResult(result) => {
            manager.lock().await.record_machine_result(result);
            Ok(None)
        }
    }
}
