use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use crate::model::{CommitId, HeartbeatResponse, MachineResult};
use crate::protocol::{
    FrameStream, ProtocolError, Request, TaskResponse, MALFORMED_REQUEST, PROTOCOL_MATCH,
    PROTOCOL_VERSION, UNKNOWN_REQUEST, VERSION_MISMATCH, WAITING_OK,
};
use crate::scheduler::WorkerInfo;

/// Any byte stream a worker can talk over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Worker side of the protocol. Each call sends one request and, except for
/// result publication, waits for its answer.
pub struct WorkerClient {
    frames: FrameStream<Box<dyn Transport>>,
}

impl WorkerClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::from_stream(stream).await
    }

    pub async fn connect_tls(
        addr: SocketAddr,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
    ) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let tls = connector.connect(server_name, stream).await?;
        Self::from_stream(tls).await
    }

    /// Run the version handshake over an already connected stream.
    pub async fn from_stream<S: Transport + 'static>(io: S) -> Result<Self, ProtocolError> {
        let mut frames = FrameStream::new(Box::new(io) as Box<dyn Transport>);
        frames.send(PROTOCOL_VERSION).await?;
        match frames.expect().await?.as_str() {
            PROTOCOL_MATCH => {
                tracing::debug!(version = PROTOCOL_VERSION, "Connected to scheduler");
                Ok(Self { frames })
            }
            VERSION_MISMATCH => Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION.to_string(),
                received: "rejected by server".to_string(),
            }),
            other => Err(ProtocolError::UnexpectedResponse(other.to_string())),
        }
    }

    async fn call(&mut self, request: &Request) -> Result<String, ProtocolError> {
        self.frames.send(&request.to_frame()?).await?;
        let response = self.frames.expect().await?;
        match response.as_str() {
            UNKNOWN_REQUEST => Err(ProtocolError::UnknownRequest(request.name().to_string())),
            MALFORMED_REQUEST => Err(ProtocolError::Malformed(
                "server rejected the request".to_string(),
            )),
            _ => Ok(response),
        }
    }

    /// Ask for work. `None` means nothing is runnable for this machine yet.
    pub async fn get_task(&mut self, worker: &WorkerInfo) -> Result<Option<TaskResponse>, ProtocolError> {
        let response = self.call(&Request::GetTask(worker.clone())).await?;
        Ok(serde_json::from_str(&response)?)
    }

    pub async fn heartbeat(
        &mut self,
        commit_id: &CommitId,
        test_id: &str,
        machine_id: &str,
    ) -> Result<HeartbeatResponse, ProtocolError> {
        let request = Request::Heartbeat {
            commit_id: commit_id.clone(),
            test_id: test_id.to_string(),
            machine_id: machine_id.to_string(),
        };
        let response = self.call(&request).await?;
        HeartbeatResponse::parse(&response).ok_or(ProtocolError::UnexpectedResponse(response))
    }

    /// Tell the scheduler the machine is alive but idle.
    pub async fn waiting_heartbeat(&mut self, machine_id: &str) -> Result<(), ProtocolError> {
        let request = Request::WaitingHeartbeat {
            machine_id: machine_id.to_string(),
        };
        match self.call(&request).await? {
            response if response == WAITING_OK => Ok(()),
            response => Err(ProtocolError::UnexpectedResponse(response)),
        }
    }

    /// Send a result. The server does not answer.
    pub async fn publish_test_result(&mut self, result: MachineResult) -> Result<(), ProtocolError> {
        self.frames
            .send(&Request::PublishTestResult(result).to_frame()?)
            .await
    }

    pub async fn send_raw(&mut self, frame: &str) -> Result<(), ProtocolError> {
        self.frames.send(frame).await
    }

    pub async fn recv_raw(&mut self) -> Result<Option<String>, ProtocolError> {
        self.frames.recv().await
    }

    pub async fn close(mut self) -> Result<(), ProtocolError> {
        self.frames.close().await
    }
}
