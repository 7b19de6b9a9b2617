use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::model::BranchId;

/// Seconds a worker connection may stay silent before it is closed.
pub const SOCKET_IDLE_TIMEOUT: Duration = Duration::from_secs(360);

/// Knobs the scheduler itself needs.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    /// The branch every feature branch is compared against. It is also the only
    /// branch whose periodic tests run.
    pub baseline_branch: BranchId,
    /// How many commits of history to keep under test per branch.
    pub baseline_depth: usize,
    /// Cap on non-timed-out runs of an untargeted test on one commit.
    pub max_test_runs_per_commit: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            baseline_branch: BranchId::new("repo", "master"),
            baseline_depth: 20,
            max_test_runs_per_commit: 3,
        }
    }
}

impl SchedulerSettings {
    pub fn new(baseline_branch: BranchId) -> Self {
        Self {
            baseline_branch,
            ..Default::default()
        }
    }

    pub fn with_baseline_depth(mut self, depth: usize) -> Self {
        self.baseline_depth = depth;
        self
    }

    pub fn with_max_test_runs_per_commit(mut self, runs: usize) -> Self {
        self.max_test_runs_per_commit = runs;
        self
    }
}

/// TLS configuration for the worker protocol listener.
///
/// When enabled the server presents its certificate to every worker. If a CA
/// is configured, workers must also present a certificate signed by it.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Enable TLS. If false, all other TLS settings are ignored.
    pub enabled: bool,

    /// CA used to verify worker certificates (PEM). Optional.
    pub ca_cert_path: Option<PathBuf>,

    /// Server certificate chain (PEM).
    pub cert_path: Option<PathBuf>,

    /// Server private key (PEM). Must match the certificate.
    pub key_path: Option<PathBuf>,

    /// Serve plaintext with a warning when TLS is enabled but files are missing.
    pub allow_insecure: bool,
}

impl TlsConfig {
    /// Whether the server identity is fully configured.
    pub fn is_complete(&self) -> bool {
        self.enabled && self.cert_path.is_some() && self.key_path.is_some()
    }

    pub fn requires_client_auth(&self) -> bool {
        self.ca_cert_path.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub status_addr: Option<SocketAddr>,
    pub refresh_interval: Duration,
    pub idle_timeout: Duration,
    pub scheduler: SchedulerSettings,
    pub tls: TlsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7531)),
            status_addr: None,
            refresh_interval: Duration::from_secs(10),
            idle_timeout: SOCKET_IDLE_TIMEOUT,
            scheduler: SchedulerSettings::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr, scheduler: SchedulerSettings) -> Self {
        Self {
            listen_addr,
            scheduler,
            ..Default::default()
        }
    }

    pub fn with_status_addr(mut self, addr: SocketAddr) -> Self {
        self.status_addr = Some(addr);
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }
}
