use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use super::registry::SessionRegistry;
use super::session::Session;
use super::ProtocolError;
use crate::config::SOCKET_IDLE_TIMEOUT;
use crate::scheduler::SharedManager;

/// Accepts worker connections and runs one [`Session`] task per connection.
pub struct WorkerServer {
    listener: TcpListener,
    manager: SharedManager,
    registry: Arc<SessionRegistry>,
    acceptor: Option<TlsAcceptor>,
    idle_timeout: Duration,
}

#[derive(Clone)]
struct ConnectionContext {
    manager: SharedManager,
    registry: Arc<SessionRegistry>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
}

impl WorkerServer {
    pub async fn bind(
        addr: SocketAddr,
        manager: SharedManager,
        registry: Arc<SessionRegistry>,
    ) -> Result<Self, ProtocolError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            manager,
            registry,
            acceptor: None,
            idle_timeout: SOCKET_IDLE_TIMEOUT,
        })
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProtocolError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Serve until `shutdown` fires, then wait for open sessions to close.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ProtocolError> {
        let addr = self.local_addr()?;
        tracing::info!(addr = %addr, tls = self.acceptor.is_some(), "Worker protocol server listening");

        let context = ConnectionContext {
            manager: self.manager,
            registry: self.registry,
            idle_timeout: self.idle_timeout,
            shutdown: shutdown.clone(),
        };
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    tracing::info!("Worker protocol server shutting down");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            tracing::debug!(peer = %peer, "Accepted worker connection");
                            let context = context.clone();
                            let acceptor = self.acceptor.clone();
                            connections.spawn(serve_connection(stream, peer, acceptor, context));
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept worker connection");
                        }
                    }
                }

                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        while connections.join_next().await.is_some() {}
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    context: ConnectionContext,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(peer = %peer, error = %e, "Could not set TCP_NODELAY");
    }

    match acceptor {
        None => run_session(stream, peer, context).await,
        Some(acceptor) => {
            match tokio::time::timeout(context.idle_timeout, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => run_session(tls, peer, context).await,
                Ok(Err(e)) => tracing::warn!(peer = %peer, error = %e, "TLS handshake failed"),
                Err(_) => tracing::warn!(peer = %peer, "TLS handshake timed out"),
            }
        }
    }
}

async fn run_session<S>(io: S, peer: SocketAddr, context: ConnectionContext)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let handle = context.registry.register(peer);
    let session = Session::new(
        handle.id(),
        io,
        context.manager,
        Arc::clone(&context.registry),
        context.idle_timeout,
        context.shutdown,
    );

    match session.run().await {
        Ok(()) => tracing::debug!(session_id = handle.id(), peer = %peer, "Worker disconnected"),
        Err(ProtocolError::Io(e)) => {
            tracing::debug!(session_id = handle.id(), peer = %peer, error = %e, "Worker connection lost")
        }
        Err(e) => tracing::info!(session_id = handle.id(), peer = %peer, error = %e, "Worker session ended"),
    }
}
