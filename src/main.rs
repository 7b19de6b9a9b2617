use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing_subscriber::EnvFilter;

use ci_looper::config::{SchedulerSettings, ServerConfig, TlsConfig};
use ci_looper::model::{BranchId, CommitId, HeartbeatResponse, MachineResult};
use ci_looper::node::Node;
use ci_looper::scheduler::WorkerInfo;
use ci_looper::shutdown::install_shutdown_handler;
use ci_looper::source_control::InMemorySourceControl;
use ci_looper::store::{FileJsonStore, InMemoryJsonStore, JsonStore};
use ci_looper::tls::{self, TlsIdentity};
use ci_looper::worker::{HeartbeatSender, WorkerClient};

#[derive(Parser, Debug)]
#[command(name = "ci-looper")]
#[command(version)]
#[command(about = "A CI scheduler that runs the most suspicious tests first")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the scheduler
    Server(ServerArgs),

    /// Talk to a scheduler as a worker machine
    Worker {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: WorkerCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address for the worker protocol
    #[arg(long, default_value = "127.0.0.1:7531")]
    listen: SocketAddr,

    /// Address for the JSON status API (optional)
    #[arg(long)]
    status_addr: Option<SocketAddr>,

    /// JSON fixture describing repositories, branches and test definitions
    #[arg(long)]
    fixture: PathBuf,

    /// Directory to persist runs and definitions in, one file per key. In-memory when omitted.
    #[arg(long)]
    store: Option<PathBuf>,

    /// Baseline branch, as "repo/branch"
    #[arg(long, default_value = "repo/master")]
    baseline_branch: BranchId,

    /// Commits of history kept under test per branch
    #[arg(long, default_value = "20")]
    depth: usize,

    /// Cap on runs of an untargeted test per commit
    #[arg(long, default_value = "3")]
    max_runs: usize,

    /// Seconds between source-control refreshes
    #[arg(long, default_value = "10")]
    refresh_secs: u64,

    /// Seconds a worker connection may stay silent
    #[arg(long, default_value = "360")]
    idle_timeout_secs: u64,

    // === TLS Options ===
    /// Enable TLS for the worker protocol
    #[arg(long)]
    tls: bool,

    /// CA used to verify worker certificates (PEM). Enables mTLS.
    #[arg(long, requires = "tls")]
    ca_cert: Option<PathBuf>,

    /// Server certificate chain (PEM)
    #[arg(long, requires = "tls")]
    cert: Option<PathBuf>,

    /// Server private key (PEM)
    #[arg(long, requires = "tls")]
    key: Option<PathBuf>,

    /// Allow running without TLS even when --tls is specified but certs are missing.
    /// Useful for development. NOT recommended for production.
    #[arg(long)]
    allow_insecure: bool,
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Scheduler address
    #[arg(long, short = 'a', default_value = "127.0.0.1:7531")]
    addr: SocketAddr,

    /// CA certificate (PEM). Enables TLS.
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Worker certificate (PEM) for mTLS
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Worker private key (PEM) for mTLS
    #[arg(long)]
    key: Option<PathBuf>,

    /// Name the server certificate is checked against
    #[arg(long, default_value = "ci-looper")]
    server_name: String,

    /// This machine's id
    #[arg(long)]
    machine_id: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum WorkerCommands {
    /// Ask for a test to run
    GetTask {
        #[arg(long, default_value = "1")]
        cores: u32,

        #[arg(long)]
        gpu: bool,

        /// Address other machines of a multi-machine test reach this one on
        #[arg(long, default_value = "127.0.0.1")]
        internal_ip: String,
    },
    /// Heartbeat a running test, or report as idle when no test is given
    Heartbeat {
        #[arg(long, requires = "test_id")]
        commit_id: Option<CommitId>,

        #[arg(long, requires = "commit_id")]
        test_id: Option<String>,

        /// Keep heartbeating every N milliseconds until the scheduler says stop
        #[arg(long)]
        follow_ms: Option<u64>,
    },
    /// Report this machine's result for a test
    PublishResult {
        #[arg(long)]
        commit_id: CommitId,

        #[arg(long)]
        test_id: String,

        /// Report a failure instead of a pass
        #[arg(long)]
        failed: bool,

        /// Log lines to attach
        #[arg(long)]
        log: Vec<String>,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct HeartbeatOutput {
    answer: String,
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let tls_config = TlsConfig {
        enabled: args.tls,
        ca_cert_path: args.ca_cert,
        cert_path: args.cert,
        key_path: args.key,
        allow_insecure: args.allow_insecure,
    };

    let tls_identity = if tls_config.is_complete() {
        match TlsIdentity::load(&tls_config).await {
            Ok(identity) => {
                if identity.requires_client_auth() {
                    tracing::info!("TLS enabled with client certificate verification");
                } else {
                    tracing::info!("TLS enabled without client certificate verification");
                }
                Some(identity)
            }
            Err(e) => {
                if tls_config.allow_insecure {
                    tracing::warn!(
                        error = %e,
                        "TLS certificate loading failed, running in insecure mode"
                    );
                    None
                } else {
                    return Err(format!("TLS certificate loading failed: {}", e).into());
                }
            }
        }
    } else if tls_config.enabled {
        if tls_config.allow_insecure {
            tracing::warn!("TLS enabled but certificate paths incomplete, running in insecure mode");
            None
        } else {
            return Err("TLS enabled but missing required paths (--cert, --key)".into());
        }
    } else {
        None
    };

    let store: Arc<dyn JsonStore> = match &args.store {
        Some(path) => Arc::new(FileJsonStore::open(path)?),
        None => {
            tracing::warn!("No --store given, runs will not survive a restart");
            Arc::new(InMemoryJsonStore::new())
        }
    };
    let source = Arc::new(InMemorySourceControl::from_fixture(&args.fixture).await?);

    let scheduler = SchedulerSettings::new(args.baseline_branch)
        .with_baseline_depth(args.depth)
        .with_max_test_runs_per_commit(args.max_runs);
    let mut config = ServerConfig::new(args.listen, scheduler)
        .with_refresh_interval(Duration::from_secs(args.refresh_secs))
        .with_idle_timeout(Duration::from_secs(args.idle_timeout_secs))
        .with_tls(tls_config);
    if let Some(status_addr) = args.status_addr {
        config = config.with_status_addr(status_addr);
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        status_addr = ?config.status_addr,
        baseline_branch = %config.scheduler.baseline_branch,
        depth = config.scheduler.baseline_depth,
        max_runs = config.scheduler.max_test_runs_per_commit,
        tls_enabled = tls_identity.is_some(),
        "Starting ci-looper"
    );

    let shutdown = install_shutdown_handler();
    let node = Node::new(config, store, source, tls_identity);
    node.run(shutdown).await?;

    Ok(())
}

// =============================================================================
// Worker Command Handlers
// =============================================================================

async fn connect(args: &ClientArgs) -> Result<WorkerClient, Box<dyn std::error::Error>> {
    let client = match &args.ca_cert {
        Some(ca_cert) => {
            let tls_config = TlsConfig {
                enabled: true,
                ca_cert_path: Some(ca_cert.clone()),
                cert_path: args.cert.clone(),
                key_path: args.key.clone(),
                allow_insecure: false,
            };
            let connector = tls::connector(&tls_config).await?;
            let server_name = tls::server_name(&args.server_name)?;
            WorkerClient::connect_tls(args.addr, &connector, server_name).await?
        }
        None => WorkerClient::connect(args.addr).await?,
    };
    Ok(client)
}

async fn handle_get_task(
    client: &mut WorkerClient,
    worker: WorkerInfo,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let task = client.get_task(&worker).await?;

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&task)?),
        OutputFormat::Table => match task {
            Some(task) => {
                println!("Commit:  {}", task.commit_id);
                println!("Test:    {}", task.test_name);
                println!("Test ID: {}", task.test_id);
            }
            None => println!("Nothing to run yet."),
        },
    }
    Ok(())
}

async fn handle_heartbeat(
    client: &mut WorkerClient,
    machine_id: &str,
    running: Option<(CommitId, String)>,
    follow_ms: Option<u64>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let answer = match (running, follow_ms) {
        (None, _) => {
            client.waiting_heartbeat(machine_id).await?;
            "OK".to_string()
        }
        (Some((commit_id, test_id)), None) => client
            .heartbeat(&commit_id, &test_id, machine_id)
            .await?
            .to_string(),
        (Some((commit_id, test_id)), Some(interval_ms)) => {
            let sender = HeartbeatSender::new(interval_ms);
            sender
                .run(client, &commit_id, &test_id, machine_id)
                .await?
                .to_string()
        }
    };

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&HeartbeatOutput { answer: answer.clone() })?)
        }
        OutputFormat::Table => println!("Scheduler answered: {}", answer),
    }
    if answer == HeartbeatResponse::Fail.as_str() {
        std::process::exit(1);
    }
    Ok(())
}

async fn handle_publish_result(
    client: &mut WorkerClient,
    result: MachineResult,
) -> Result<(), Box<dyn std::error::Error>> {
    let test_id = result.test_id.clone();
    client.publish_test_result(result).await?;
    println!("Result for {} published.", test_id);
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Worker { client, command } => {
            let mut worker_client = connect(&client).await?;

            match command {
                WorkerCommands::GetTask {
                    cores,
                    gpu,
                    internal_ip,
                } => {
                    let worker = WorkerInfo {
                        machine_id: client.machine_id.clone(),
                        core_count: cores,
                        gpu,
                        internal_ip,
                    };
                    handle_get_task(&mut worker_client, worker, &client.output).await?;
                }
                WorkerCommands::Heartbeat {
                    commit_id,
                    test_id,
                    follow_ms,
                } => {
                    let running = commit_id.zip(test_id);
                    handle_heartbeat(
                        &mut worker_client,
                        &client.machine_id,
                        running,
                        follow_ms,
                        &client.output,
                    )
                    .await?;
                }
                WorkerCommands::PublishResult {
                    commit_id,
                    test_id,
                    failed,
                    log,
                } => {
                    let result = MachineResult {
                        machine: client.machine_id.clone(),
                        test_id,
                        commit_id,
                        success: !failed,
                        log_messages: log,
                        performance_results: Vec::new(),
                        finish_time: Utc::now(),
                    };
                    handle_publish_result(&mut worker_client, result).await?;
                }
            }

            worker_client.close().await?;
        }
    }

    Ok(())
}
