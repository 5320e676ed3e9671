//! Tessera operator - database cluster remediation and bootstrap gating

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use tessera::cache::watch;
use tessera::client::KubeLiveClient;
use tessera::config::{
    ControllerConfig, DEFAULT_LIVE_CALL_TIMEOUT, DEFAULT_REQUEUE_DELAY, DEFAULT_WORKERS,
};
use tessera::controller::{Controller, OrphanedVolumeReconciler};
use tessera::crd::DatabaseCluster;
use tessera::queue::{BackoffPolicy, WorkQueue};
use tessera::telemetry::{init_telemetry, LogFormat, TelemetryConfig};

/// Exit status of `bootstrap-status --exit-code` when bootstrap is not complete
const EXIT_NOT_BOOTSTRAPPED: u8 = 3;

/// Tessera - Kubernetes operator core for stateful database clusters
#[derive(Parser, Debug)]
#[command(name = "tessera", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Log output format (json or text)
    #[arg(long, env = "TESSERA_LOG_FORMAT", default_value = "json", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the reconcile loop (default mode)
    ///
    /// Watches DatabaseClusters, Nodes, volumes and member Services, and marks
    /// members for replacement when their volume's node is gone.
    Controller(ControllerArgs),

    /// Report whether a database node finished bootstrapping
    ///
    /// Reads the node's scan report and prints `true` or `false`.
    BootstrapStatus(BootstrapStatusArgs),
}

/// Controller mode arguments
#[derive(Args, Debug)]
struct ControllerArgs {
    /// Number of concurrent reconcile workers
    #[arg(long, env = "TESSERA_WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Seconds to wait before re-examining a cluster with members still provisioning
    #[arg(long, env = "TESSERA_REQUEUE_DELAY_SECS", default_value_t = DEFAULT_REQUEUE_DELAY.as_secs())]
    requeue_delay_secs: u64,

    /// Seconds before a single live API call is abandoned
    #[arg(long, env = "TESSERA_LIVE_CALL_TIMEOUT_SECS", default_value_t = DEFAULT_LIVE_CALL_TIMEOUT.as_secs())]
    live_call_timeout_secs: u64,

    /// Only watch namespaced objects in this namespace
    #[arg(long, env = "TESSERA_WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Maximum per-cluster retry backoff in seconds
    #[arg(long, env = "TESSERA_MAX_BACKOFF_SECS", default_value_t = 1000)]
    max_backoff_secs: u64,
}

impl Default for ControllerArgs {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            requeue_delay_secs: DEFAULT_REQUEUE_DELAY.as_secs(),
            live_call_timeout_secs: DEFAULT_LIVE_CALL_TIMEOUT.as_secs(),
            watch_namespace: None,
            max_backoff_secs: 1000,
        }
    }
}

impl From<ControllerArgs> for ControllerConfig {
    fn from(args: ControllerArgs) -> Self {
        Self {
            workers: args.workers,
            requeue_delay: Duration::from_secs(args.requeue_delay_secs),
            live_call_timeout: Duration::from_secs(args.live_call_timeout_secs),
            watch_namespace: args.watch_namespace,
            backoff: BackoffPolicy {
                max_delay: Duration::from_secs(args.max_backoff_secs),
                ..Default::default()
            },
        }
    }
}

/// Bootstrap gate arguments
#[derive(Args, Debug)]
struct BootstrapStatusArgs {
    /// Path to the scan report JSON
    #[arg(long, env = "TESSERA_BOOTSTRAP_REPORT")]
    path: PathBuf,

    /// Exit with status 3 instead of 0 when bootstrap is not complete
    #[arg(long)]
    exit_code: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&DatabaseCluster::crd())
            .context("failed to serialize CRD")?;
        println!("{crd}");
        return Ok(ExitCode::SUCCESS);
    }

    init_telemetry(TelemetryConfig {
        format: cli.log_format,
    })?;

    match cli.command {
        Some(Commands::BootstrapStatus(args)) => run_bootstrap_status(args).await,
        Some(Commands::Controller(args)) => run_controller(args.into()).await,
        None => run_controller(ControllerArgs::default().into()).await,
    }
}

/// Print the gate result and map it to an exit status
async fn run_bootstrap_status(args: BootstrapStatusArgs) -> anyhow::Result<ExitCode> {
    let done = tessera::bootstrap::is_bootstrapped(&args.path).await?;
    println!("{done}");
    Ok(ExitCode::from(bootstrap_exit_status(done, args.exit_code)))
}

fn bootstrap_exit_status(bootstrapped: bool, exit_code: bool) -> u8 {
    if exit_code && !bootstrapped {
        EXIT_NOT_BOOTSTRAPPED
    } else {
        0
    }
}

async fn run_controller(config: ControllerConfig) -> anyhow::Result<ExitCode> {
    config.validate()?;
    tracing::info!(
        workers = config.workers,
        namespace = config.watch_namespace.as_deref().unwrap_or("*"),
        "Tessera controller starting..."
    );

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let queue = Arc::new(WorkQueue::new(config.backoff.clone()));
    let (cache, watches) = watch::start(&client, config.watch_namespace.as_deref(), queue.clone());
    for watch in watches {
        tokio::spawn(watch);
    }

    tracing::info!("waiting for caches to sync");
    cache.wait_until_ready().await?;
    tracing::info!("caches synced");

    let reconciler = Arc::new(OrphanedVolumeReconciler::new(
        Arc::new(cache),
        Arc::new(KubeLiveClient::new(client)),
        &config,
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("received shutdown signal"),
                Err(e) => tracing::error!(error = %e, "failed to listen for shutdown signal"),
            }
            shutdown.cancel();
        }
    });

    Controller::new(reconciler, queue)
        .run(config.workers, shutdown)
        .await;

    tracing::info!("Tessera controller stopped");
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::done(true, false, 0)]
    #[case::not_done_plain(false, false, 0)]
    #[case::done_with_exit_code(true, true, 0)]
    #[case::not_done_with_exit_code(false, true, EXIT_NOT_BOOTSTRAPPED)]
    fn bootstrap_exit_status_mapping(
        #[case] bootstrapped: bool,
        #[case] exit_code: bool,
        #[case] expected: u8,
    ) {
        assert_eq!(bootstrap_exit_status(bootstrapped, exit_code), expected);
    }

    #[test]
    fn cli_parses_bootstrap_status() {
        let cli = Cli::try_parse_from([
            "tessera",
            "bootstrap-status",
            "--path",
            "/var/lib/db/report.json",
            "--exit-code",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::BootstrapStatus(args)) => {
                assert_eq!(args.path, PathBuf::from("/var/lib/db/report.json"));
                assert!(args.exit_code);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn controller_args_map_to_config() {
        let cli = Cli::try_parse_from([
            "tessera",
            "controller",
            "--workers",
            "8",
            "--requeue-delay-secs",
            "5",
            "--watch-namespace",
            "db",
        ])
        .unwrap();
        let Some(Commands::Controller(args)) = cli.command else {
            panic!("expected controller command");
        };
        let config = ControllerConfig::from(args);
        assert_eq!(config.workers, 8);
        assert_eq!(config.requeue_delay, Duration::from_secs(5));
        assert_eq!(config.live_call_timeout, DEFAULT_LIVE_CALL_TIMEOUT);
        assert_eq!(config.watch_namespace.as_deref(), Some("db"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_args_match_default_config() {
        assert_eq!(
            ControllerConfig::from(ControllerArgs::default()),
            ControllerConfig::default()
        );
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        assert!(Cli::try_parse_from(["tessera", "--log-format", "yaml"]).is_err());
    }
}
