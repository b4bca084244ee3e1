use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use imirror_core::{CredentialProvider, Credentials, MirrorRoot, WorkloadStore};
use imirror_kubehub::KubeWorkloadStore;
use imirror_reconcile::config::{DEFAULT_CONFLICT_RETRIES, DEFAULT_MIRROR_ROOT};
use imirror_reconcile::{dispatch, Config, InFlightTracker, Mirror, Reconciler};
use imirror_registry::{EnvCredentials, OciImageStore};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "imirror", version, about = "Rewrite Deployment and DaemonSet images to a mirror registry")]
struct Cli {
    /// Mirror root, e.g. "registry.example.com/mirror"
    #[arg(long = "registry", env = "IMIRROR_REGISTRY", default_value = DEFAULT_MIRROR_ROOT)]
    registry: String,

    /// Reconciliations running at once
    #[arg(long = "parallel", env = "IMIRROR_PARALLEL", default_value_t = 1)]
    parallel: usize,

    /// Namespace to leave alone in addition to kube-system (repeatable)
    #[arg(long = "exclude-ns", action = ArgAction::Append)]
    exclude_ns: Vec<String>,

    /// Seconds a rewritten workload may take to become ready before rollback
    #[arg(long = "rollback-timeout-secs", default_value_t = 300)]
    rollback_timeout_secs: u64,

    /// Re-fetch and retry rounds after a write conflict
    #[arg(long = "conflict-retries", default_value_t = DEFAULT_CONFLICT_RETRIES)]
    conflict_retries: usize,

    /// Registry host reached over plain HTTP (repeatable)
    #[arg(long = "insecure-registry", action = ArgAction::Append)]
    insecure_registries: Vec<String>,
}

impl Cli {
    fn config(&self) -> Result<Config> {
        let root = MirrorRoot::parse(&self.registry).with_context(|| format!("invalid --registry {:?}", self.registry))?;
        let mut cfg = Config::new(root);
        for ns in self.exclude_ns.iter().filter(|ns| !ns.is_empty()) {
            cfg = cfg.exclude_namespace(ns.as_str());
        }
        cfg.rollback_timeout = Duration::from_secs(self.rollback_timeout_secs);
        cfg.parallel = self.parallel.max(1);
        cfg.conflict_retries = self.conflict_retries;
        Ok(cfg)
    }
}

fn init_tracing() {
    let env = std::env::var("IMIRROR_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("IMIRROR_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid IMIRROR_METRICS_ADDR; expected host:port");
        }
    }
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("interrupt received"),
        Err(e) => {
            warn!(error = %e, "cannot listen for interrupt; running until killed");
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let config = Arc::new(cli.config()?);
    info!(
        registry = %config.mirror_root,
        parallel = config.parallel,
        excluded = ?config.excluded_namespaces,
        rollback_timeout = ?config.rollback_timeout,
        "starting imirror"
    );

    let credentials = EnvCredentials::from_env();
    if credentials.push_credentials() == Credentials::Anonymous {
        warn!("REGISTRY_USERNAME not set; pushing to the mirror anonymously");
    }

    let store: Arc<dyn WorkloadStore> = Arc::new(KubeWorkloadStore::try_default().await?);
    let images = Arc::new(OciImageStore::new(cli.insecure_registries.clone()));
    let mirror = Arc::new(Mirror::new(config.mirror_root.clone(), images, Arc::new(credentials)));
    let tracker = Arc::new(InFlightTracker::new());
    let reconciler = Arc::new(Reconciler::new(Arc::clone(&config), Arc::clone(&store), mirror, Arc::clone(&tracker)));

    dispatch::run(reconciler, store, config.parallel, shutdown_signal()).await?;
    if !tracker.is_empty() {
        warn!(in_flight = tracker.len(), "exiting with rewritten workloads not yet ready; their rollback timers are dropped");
    }
    info!("imirror stopped");
    Ok(())
}
