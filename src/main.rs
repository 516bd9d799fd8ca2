use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kube::ResourceExt;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vault_operator::config::{LogFormat, OperatorConfig};
use vault_operator::{controller, crd::VaultCluster, Error};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version information
    Version,
    /// Show the VaultClusters in a namespace
    Info(InfoArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace to watch; empty watches all namespaces
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Deadline for one instance probe, in seconds
    #[arg(long, env = "PROBE_TIMEOUT_SECS", default_value_t = 5)]
    probe_timeout_secs: u64,

    /// Maximum concurrent probes per cluster
    #[arg(long, env = "MAX_CONCURRENT_PROBES", default_value_t = 8)]
    max_concurrent_probes: usize,

    /// Seconds between passes when nothing changes
    #[arg(long, env = "RESYNC_INTERVAL_SECS", default_value_t = 15)]
    resync_interval_secs: u64,

    /// Outer deadline for one reconcile pass, in seconds
    #[arg(long, env = "PASS_DEADLINE_SECS", default_value_t = 60)]
    pass_deadline_secs: u64,

    /// Attempts for a conflicting status write
    #[arg(long, env = "STATUS_WRITE_ATTEMPTS", default_value_t = 5)]
    status_write_attempts: u32,

    /// Validity of instance and client certificates, in days
    #[arg(long, env = "CERT_VALIDITY_DAYS", default_value_t = 90)]
    cert_validity_days: u64,

    /// Port of the read-only REST API
    #[arg(long, env = "API_PORT", default_value_t = 8080)]
    api_port: u16,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl RunArgs {
    fn operator_config(&self) -> OperatorConfig {
        let namespace = self.namespace.trim();
        OperatorConfig {
            namespace: (!namespace.is_empty()).then(|| namespace.to_string()),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            max_concurrent_probes: self.max_concurrent_probes,
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            pass_deadline: Duration::from_secs(self.pass_deadline_secs),
            status_write_attempts: self.status_write_attempts,
            cert_validity: Duration::from_secs(self.cert_validity_days * 24 * 3600),
            api_port: self.api_port,
        }
    }
}

#[derive(Parser, Debug)]
struct InfoArgs {
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "default")]
    namespace: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("vault-operator v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default().await?;

    let api: kube::Api<VaultCluster> = kube::Api::namespaced(client, &args.namespace);
    let clusters = api.list(&Default::default()).await?;

    println!("Managed Vault clusters: {}", clusters.items.len());
    for cluster in &clusters.items {
        let status = cluster.status.clone().unwrap_or_default();
        println!(
            "  {} phase={} active={} available={}/{}",
            cluster.name_any(),
            status.phase,
            status.active_node.as_deref().unwrap_or("-"),
            status.available_count(),
            cluster.spec.replicas
        );
    }
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_format);

    let config = args.operator_config();
    config.validate()?;

    info!("Starting vault-operator v{}", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let state = Arc::new(controller::ControllerState { client, config });

    #[cfg(feature = "rest-api")]
    {
        let api_state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = vault_operator::rest_api::run_server(api_state).await {
                tracing::error!("REST API server error: {:?}", e);
            }
        });
    }

    controller::run_controller(state).await
}
