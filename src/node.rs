use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::Result;
use crate::protocol::{SessionRegistry, WorkerServer};
use crate::scheduler::{refresh, SharedManager, TestManager};
use crate::source_control::SourceControl;
use crate::store::JsonStore;
use crate::tls::TlsIdentity;

/// The scheduler process: one shared [`TestManager`], a refresh loop feeding
/// it from source control, the worker protocol server and the status API.
pub struct Node {
    pub config: ServerConfig,
    pub manager: SharedManager,
    pub registry: Arc<SessionRegistry>,
    source: Arc<dyn SourceControl>,
    tls_identity: Option<TlsIdentity>,
}

impl Node {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn JsonStore>,
        source: Arc<dyn SourceControl>,
        tls_identity: Option<TlsIdentity>,
    ) -> Self {
        let manager = TestManager::new(config.scheduler.clone(), store);
        Self {
            config,
            manager: Arc::new(Mutex::new(manager)),
            registry: Arc::new(SessionRegistry::new()),
            source,
            tls_identity,
        }
    }

    /// Run the node until `shutdown` fires.
    ///
    /// 1. Performs one refresh so the first workers find work
    /// 2. Spawns the periodic refresh loop
    /// 3. Optionally spawns the status API
    /// 4. Runs the worker protocol server (blocking)
    ///
    /// # Errors
    ///
    /// Returns an error if the worker server cannot bind or the TLS identity is
    /// unusable. Refresh failures are logged and retried.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        if let Err(e) = refresh(&self.manager, self.source.as_ref()).await {
            tracing::warn!(error = %e, "Initial refresh failed, will retry");
        }

        let refresh_manager = self.manager.clone();
        let refresh_source = self.source.clone();
        let refresh_interval = self.config.refresh_interval;
        let refresh_shutdown = shutdown.clone();
        tokio::spawn(async move {
            refresh_loop(
                refresh_manager,
                refresh_source,
                refresh_interval,
                refresh_shutdown,
            )
            .await;
        });

        if let Some(status_addr) = self.config.status_addr {
            let dashboard_state = DashboardState {
                manager: self.manager.clone(),
                registry: self.registry.clone(),
            };
            let dashboard_shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_dashboard(status_addr, dashboard_state, dashboard_shutdown).await;
            });
        }

        let mut server = WorkerServer::bind(
            self.config.listen_addr,
            self.manager.clone(),
            self.registry.clone(),
        )
        .await?
        .with_idle_timeout(self.config.idle_timeout);
        if let Some(identity) = &self.tls_identity {
            server = server.with_tls(identity.acceptor()?);
        }

        server.run(shutdown).await?;
        tracing::info!("Node stopped");
        Ok(())
    }
}

/// Refresh branches and commits every `interval` until `shutdown` fires.
pub async fn refresh_loop(
    manager: SharedManager,
    source: Arc<dyn SourceControl>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => {
                tracing::debug!("Refresh loop stopping");
                break;
            }

            _ = ticker.tick() => {
                if let Err(e) = refresh(&manager, source.as_ref()).await {
                    tracing::warn!(error = %e, "Refresh failed, keeping previous state");
                }
            }
        }
    }
}
