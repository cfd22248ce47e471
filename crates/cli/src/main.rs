use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use filestore_apply::{KubeObjectStore, ManagedObject, ObjectKey, ObjectKind, ObjectStore, StoreError};
use filestore_core::{EventSink, NoopEvents, OperatorConfig};
use filestore_hooks::ReplicaPolicy;
use filestore_kubehub::{kube_client, spawn_watchers, KubeEvents, KubeStatusPublisher, OPERATOR_CONFIG_NAME};
use filestore_reconcile::{ConditionPublisher, OrchestratorConfig, Reconciler};
use filestore_store::{spawn_ingest, FactStore};
use k8s_openapi::api::core::v1::ObjectReference;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod assets;
mod wiring;

use assets::{Assets, Images};
use wiring::{Reconcilers, OPERATOR_NAME};

#[derive(Parser, Debug)]
#[command(name = "filestore-operator", version, about = "GCP Filestore CSI driver operator")]
struct Cli {
    /// Namespace of the operator and its operand
    #[arg(long, env = "FILESTORE_NAMESPACE", global = true, default_value = "openshift-cluster-csi-drivers")]
    namespace: String,

    #[arg(long = "min-replicas", env = "FILESTORE_MIN_REPLICAS", global = true, default_value_t = 1)]
    min_replicas: i32,

    #[arg(long = "max-replicas", env = "FILESTORE_MAX_REPLICAS", global = true, default_value_t = 2)]
    max_replicas: i32,

    #[command(flatten)]
    images: Images,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator until SIGINT/SIGTERM
    Run {
        /// Seconds between unconditional resync passes
        #[arg(long = "resync-secs", env = "FILESTORE_RESYNC_SECS", default_value_t = 60)]
        resync_secs: u64,
        /// Upper bound on one reconcile pass
        #[arg(long = "pass-timeout-secs", env = "FILESTORE_PASS_TIMEOUT_SECS", default_value_t = 120)]
        pass_timeout_secs: u64,
        /// Upper bound on one API call
        #[arg(long = "call-timeout-secs", env = "FILESTORE_CALL_TIMEOUT_SECS", default_value_t = 15)]
        call_timeout_secs: u64,
        /// Capacity of the watcher → fact store queue
        #[arg(long = "queue-cap", env = "FILESTORE_QUEUE_CAP", default_value_t = 2048)]
        queue_cap: usize,
    },
    /// Print desired workloads and static objects as JSON; writes nothing
    Render,
}

fn init_tracing() {
    let env = std::env::var("FILESTORE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("FILESTORE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid FILESTORE_METRICS_ADDR; expected host:port");
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM; only SIGINT stops the operator");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn operator_reference() -> ObjectReference {
    ObjectReference {
        api_version: Some("operator.openshift.io/v1".into()),
        kind: Some("ClusterCSIDriver".into()),
        name: Some(OPERATOR_CONFIG_NAME.into()),
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let policy = ReplicaPolicy::new(cli.min_replicas, cli.max_replicas);
    let assets = Assets::new(&cli.namespace, &cli.images);

    match cli.command {
        Commands::Render => render(&cli.namespace, &assets, policy),
        Commands::Run { resync_secs, pass_timeout_secs, call_timeout_secs, queue_cap } => {
            let config = OrchestratorConfig {
                resync: Duration::from_secs(resync_secs.max(1)),
                pass_timeout: Duration::from_secs(pass_timeout_secs.max(1)),
            };
            run(&cli.namespace, &assets, policy, config, Duration::from_secs(call_timeout_secs.max(1)), queue_cap).await
        }
    }
}

async fn run(
    namespace: &str,
    assets: &Assets,
    policy: ReplicaPolicy,
    config: OrchestratorConfig,
    call_timeout: Duration,
    queue_cap: usize,
) -> Result<()> {
    let client = kube_client().await?;
    let facts = FactStore::new(OperatorConfig::new(namespace));
    let (fact_tx, ingest) = spawn_ingest(facts.clone(), queue_cap);
    let shutdown = CancellationToken::new();
    let watchers = spawn_watchers(client.clone(), namespace, fact_tx, shutdown.clone());

    let (events, events_task) = KubeEvents::spawn(client.clone(), OPERATOR_NAME, operator_reference(), 256);
    let events: Arc<dyn EventSink> = Arc::new(events);
    let store: Arc<dyn ObjectStore> = Arc::new(KubeObjectStore::new(client.clone(), call_timeout));
    let reconcilers = Reconcilers::build(assets, &facts, store, events, policy).context("assembling reconcilers")?;
    let publisher: Arc<dyn ConditionPublisher> = Arc::new(KubeStatusPublisher::new(client, call_timeout));
    let handle = reconcilers.orchestrator(facts.clone(), config).spawn(Some(publisher), shutdown.clone());
    drop(reconcilers);
    info!(namespace, resync_secs = config.resync.as_secs(), "operator started");

    shutdown_signal().await;
    info!("shutdown requested");
    shutdown.cancel();
    handle.join().await;
    for w in watchers {
        if let Err(e) = w.await {
            warn!(error = %e, "watcher task panicked");
        }
    }
    // Watchers held the last fact senders; the ingest loop drains and exits.
    if let Err(e) = ingest.await {
        warn!(error = %e, "ingest task panicked");
    }
    // Reconcilers held the last event senders.
    if tokio::time::timeout(Duration::from_secs(5), events_task).await.is_err() {
        warn!("event publisher did not drain in time");
    }
    info!("operator stopped");
    Ok(())
}

fn render(namespace: &str, assets: &Assets, policy: ReplicaPolicy) -> Result<()> {
    let facts = FactStore::new(OperatorConfig::new(namespace));
    let store: Arc<dyn ObjectStore> = Arc::new(NullStore);
    let reconcilers = Reconcilers::build(assets, &facts, store, Arc::new(NoopEvents), policy)?;

    let mut workloads = serde_json::Map::new();
    for r in [&reconcilers.controller, &reconcilers.node] {
        let rendered = match r.render() {
            Ok(w) => w.into_managed().to_json()?,
            // With no observed facts some hooks cannot run; show the template.
            Err(e) => json!({ "error": e.to_string(), "template": r.template().clone().into_managed().to_json()? }),
        };
        workloads.insert(r.name().to_string(), rendered);
    }
    let statics = wiring::static_set(assets)?;
    let mut objects = serde_json::Map::new();
    for entry in statics.iter() {
        objects.insert(entry.name.clone(), entry.object.to_json()?);
    }
    let out = json!({ "workloads": workloads, "static": objects });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

/// Store for `render`, which never reaches the cluster.
struct NullStore;

#[async_trait::async_trait]
impl ObjectStore for NullStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>, StoreError> {
        Err(StoreError::Unsupported(key.kind.to_string()))
    }
    async fn create(&self, obj: &ManagedObject) -> Result<ManagedObject, StoreError> {
        Err(StoreError::Unsupported(obj.kind().to_string()))
    }
    async fn update(&self, obj: &ManagedObject) -> Result<ManagedObject, StoreError> {
        Err(StoreError::Unsupported(obj.kind().to_string()))
    }
    async fn delete(&self, key: &ObjectKey) -> Result<bool, StoreError> {
        Err(StoreError::Unsupported(key.kind.to_string()))
    }
    async fn list(&self, kind: &ObjectKind, _namespace: Option<&str>) -> Result<Vec<ManagedObject>, StoreError> {
        Err(StoreError::Unsupported(kind.to_string()))
    }
}
