use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use driftlog_core::ClusterApi;
use driftlog_diff::DiffEngine;
use driftlog_kubehub::{discover, get_kube_client, node, ControllerFactory, ControllerSettings, KubeCluster};
use driftlog_persist::{default_root, FileAuditSink};
use driftlog_reconcile::ChangeAuditor;
use driftlog_schema::{SharedRegistry, TypeRegistry, DEFAULT_CRD_SELECTOR, DEFAULT_STATUS_PREFIX};
use driftlog_store::StateCache;

#[derive(Parser, Debug)]
#[command(name = "driftlogd", version, about = "Records a diff history for labelled custom resources")]
struct Cli {
    /// Output format (discover)
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Label selector for CRDs to watch
    #[arg(long, env = "DRIFTLOG_CRD_SELECTOR", global = true, default_value = DEFAULT_CRD_SELECTOR)]
    selector: String,

    /// Annotation prefix marking status-mapping entries on CRDs
    #[arg(long, env = "DRIFTLOG_STATUS_PREFIX", global = true, default_value = DEFAULT_STATUS_PREFIX)]
    status_prefix: String,

    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(clap::Args, Debug, Clone)]
struct RunArgs {
    /// Audit file directory (default: OS temp dir)
    #[arg(long, global = true, env = "DRIFTLOG_OUT_DIR")]
    out_dir: Option<PathBuf>,

    /// Requeue period after a successful reconcile
    #[arg(long, global = true, env = "DRIFTLOG_RESYNC_SECS", default_value_t = 20)]
    resync_secs: u64,

    /// Requeue delay after a failed reconcile
    #[arg(long, global = true, env = "DRIFTLOG_ERROR_BACKOFF_SECS", default_value_t = 5)]
    error_backoff_secs: u64,

    /// Upper bound on diff computation before falling back to a coarser script
    #[arg(long, global = true, env = "DRIFTLOG_DIFF_TIMEOUT_MS", default_value_t = 1000)]
    diff_timeout_ms: u64,

    /// Node cpu/memory multiplier; 0 or invalid means 4
    #[arg(long, global = true, env = "DRIFTLOG_CAPACITY_MULTIPLE")]
    capacity_multiple: Option<String>,

    /// Do not run the node capacity override
    #[arg(long = "no-node-capacity", global = true, action = ArgAction::SetTrue)]
    no_node_capacity: bool,
}

impl RunArgs {
    fn settings(&self) -> ControllerSettings {
        ControllerSettings {
            resync: Duration::from_secs(self.resync_secs),
            error_backoff: Duration::from_secs(self.error_backoff_secs),
        }
    }

    fn out_dir(&self) -> PathBuf { self.out_dir.clone().unwrap_or_else(default_root) }

    fn multiple(&self) -> u32 { node::multiple_from(self.capacity_multiple.as_deref()) }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover CRDs, start one controller per kind and run until interrupted (default)
    Run,
    /// Print the kinds a discovery pass finds
    Discover,
}

fn init_tracing() {
    let env = std::env::var("DRIFTLOG_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DRIFTLOG_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid DRIFTLOG_METRICS_ADDR; expected host:port");
        }
    }
}

fn print_registry(reg: &TypeRegistry, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            for d in reg.iter() {
                let scope = if d.namespaced { "namespaced" } else { "cluster" };
                println!("{} • {} • {} • {} • {} mapping(s)", d.api_version(), d.kind, d.plural, scope, d.status_mapping.len());
                for child in d.children.values() {
                    println!("  └ {} • {}", child.api_version(), child.kind);
                }
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(reg)?),
    }
    Ok(())
}

async fn run(cli: &Cli) -> Result<()> {
    let args = &cli.run;
    let client = get_kube_client().await?;
    let cluster: Arc<dyn ClusterApi> = Arc::new(KubeCluster::new(client.clone()));
    let registry = SharedRegistry::default();
    let found = discover(cluster.as_ref(), &cli.selector, &cli.status_prefix, &registry)
        .await
        .context("initial discovery")?;
    info!(kinds = found, selector = %cli.selector, "discovery complete");

    let out_dir = args.out_dir();
    let sink = Arc::new(FileAuditSink::new(out_dir.clone()));
    let diff = DiffEngine::new(Duration::from_millis(args.diff_timeout_ms));
    let auditor = Arc::new(ChangeAuditor::new(cluster, Arc::new(StateCache::new()), sink).with_diff_engine(diff));
    info!(out_dir = %out_dir.display(), "audit sink ready");

    let factory = ControllerFactory::new(client.clone(), auditor, args.settings());
    let mut controllers = factory.build(&registry.current());
    if !args.no_node_capacity {
        controllers.push(node::node_controller(client, args.multiple(), args.settings().resync));
    }
    if controllers.is_empty() {
        warn!("nothing to watch; exiting");
        return Ok(());
    }
    info!(count = controllers.len(), "controllers starting");
    futures::future::join_all(controllers).await;
    info!("all controllers stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        None | Some(Commands::Run) => run(&cli).await,
        Some(Commands::Discover) => {
            let cluster = KubeCluster::new(get_kube_client().await?);
            let registry = SharedRegistry::default();
            discover(&cluster, &cli.selector, &cli.status_prefix, &registry).await?;
            print_registry(&registry.current(), cli.output)
        }
    }
}
