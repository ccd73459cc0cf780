use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use kube::CustomResourceExt;
use tandem_core::{ObjectKey, ReconcileRequest, Source, Target, SOURCE_CLUSTER, TARGET_CLUSTER};
use tandem_dispatch::{Controller, DispatchConfig};
use tandem_engine::{CallPolicy, Outcome, Reconcile, SourceSynchronizer, SyncOptions, TargetObserver};
use tandem_kubehub::{ClusterClient, ClusterResolver, ClusterSet, ObjectStore};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tandemctl", version, about = "Project Source objects from one cluster onto Target objects in another")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubeconfig for the cluster holding Sources
    #[arg(long = "source-kubeconfig", env = "TANDEM_SOURCE_KUBECONFIG", global = true, default_value = "source.kubeconfig")]
    source_kubeconfig: PathBuf,

    /// Kubeconfig for the cluster holding Targets
    #[arg(long = "target-kubeconfig", env = "TANDEM_TARGET_KUBECONFIG", global = true, default_value = "target.kubeconfig")]
    target_kubeconfig: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch both clusters and run the Source and Target controllers until Ctrl-C
    Run(RunArgs),
    /// Run a single synchronization pass for one Source
    Reconcile {
        namespace: String,
        name: String,
        #[command(flatten)]
        sync: SyncArgs,
    },
    /// Show a Source's condition trail and its Target's projected status
    Status {
        namespace: String,
        name: String,
    },
    /// Print the Source and Target CRD manifests
    Crds,
}

#[derive(Args, Debug)]
struct SyncArgs {
    /// Base delay reported for retryable failures
    #[arg(long = "retry-after-ms", env = "TANDEM_RETRY_AFTER_MS", default_value_t = 1000)]
    retry_after_ms: u64,
    /// Deadline for each call against a cluster
    #[arg(long = "call-timeout-secs", env = "TANDEM_CALL_TIMEOUT_SECS")]
    call_timeout_secs: Option<u64>,
    /// Append a SyncFailed condition when creating or updating a Target fails
    #[arg(long = "record-failures", env = "TANDEM_RECORD_FAILURES", action = ArgAction::SetTrue)]
    record_failures: bool,
}

impl SyncArgs {
    fn options(&self) -> SyncOptions {
        SyncOptions {
            target_cluster: TARGET_CLUSTER.to_string(),
            record_failures: self.record_failures,
            calls: CallPolicy {
                retry_after: Duration::from_millis(self.retry_after_ms),
                call_timeout: self.call_timeout_secs.map(Duration::from_secs),
            },
        }
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Only watch this namespace (default: all namespaces)
    #[arg(long = "ns", env = "TANDEM_NAMESPACE")]
    namespace: Option<String>,
    /// Reconciliations in flight per controller
    #[arg(long = "concurrency", env = "TANDEM_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,
    /// Cap on per-key retry backoff
    #[arg(long = "max-backoff-secs", env = "TANDEM_MAX_BACKOFF_SECS", default_value_t = 300)]
    max_backoff_secs: u64,
    /// Capacity of the watcher → queue channels
    #[arg(long = "queue-cap", env = "TANDEM_QUEUE_CAP", default_value_t = 2048)]
    queue_cap: usize,
    #[command(flatten)]
    sync: SyncArgs,
}

fn init_tracing() {
    let env = std::env::var("TANDEM_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

/// Parse `TANDEM_METRICS_ADDR`; unset or empty means no exporter.
fn metrics_addr(raw: Option<&str>) -> Result<Option<SocketAddr>> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(addr) => addr
            .parse::<SocketAddr>()
            .map(Some)
            .with_context(|| format!("invalid TANDEM_METRICS_ADDR {addr:?}; expected host:port")),
    }
}

fn init_metrics() -> Result<()> {
    let raw = std::env::var("TANDEM_METRICS_ADDR").ok();
    let Some(sock) = metrics_addr(raw.as_deref())? else { return Ok(()) };
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(sock)
        .install()
        .with_context(|| format!("installing Prometheus exporter on {sock}"))?;
    info!(addr = %sock, "Prometheus metrics exporter listening");
    Ok(())
}

/// Both clusters, each registered under its well-known name.
async fn connect(source_kubeconfig: &Path, target_kubeconfig: &Path) -> Result<(Arc<ClusterSet>, kube::Client, kube::Client)> {
    let source = tandem_kubehub::client_from_kubeconfig(source_kubeconfig)
        .await
        .context("error setting up source cluster")?;
    let target = tandem_kubehub::client_from_kubeconfig(target_kubeconfig)
        .await
        .context("error setting up target cluster")?;
    let clusters = Arc::new(ClusterSet::new());
    clusters.insert_pending(ClusterClient::kube_sources(SOURCE_CLUSTER, source.clone()));
    clusters.insert_pending(ClusterClient::kube_targets(TARGET_CLUSTER, target.clone()));
    Ok((clusters, source, target))
}

/// Mark `name` ready once its API server answers.
async fn probe_until_ready(clusters: Arc<ClusterSet>, name: &'static str, client: kube::Client) {
    loop {
        match client.apiserver_version().await {
            Ok(v) => {
                clusters.mark_ready(name);
                info!(cluster = name, version = %v.git_version, "cluster ready");
                return;
            }
            Err(e) => {
                warn!(cluster = name, error = %e, "cluster not reachable yet");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

async fn run(cli: &Cli, args: &RunArgs) -> Result<()> {
    let (clusters, source_client, target_client) = connect(&cli.source_kubeconfig, &cli.target_kubeconfig).await?;
    let probes = [
        tokio::spawn(probe_until_ready(clusters.clone(), SOURCE_CLUSTER, source_client.clone())),
        tokio::spawn(probe_until_ready(clusters.clone(), TARGET_CLUSTER, target_client.clone())),
    ];

    let opts = args.sync.options();
    let dispatch = DispatchConfig { concurrency: args.concurrency, max_backoff: Duration::from_secs(args.max_backoff_secs) };
    let resolver: Arc<dyn ClusterResolver> = clusters;
    let source_ctl = Controller::new(Arc::new(SourceSynchronizer::new(resolver.clone(), opts.clone())), dispatch.clone());
    let target_ctl = Controller::new(Arc::new(TargetObserver::new(resolver, opts.calls.clone())), dispatch);

    let (source_tx, source_rx) = mpsc::channel::<ReconcileRequest>(args.queue_cap);
    let (target_tx, target_rx) = mpsc::channel::<ReconcileRequest>(args.queue_cap);
    source_ctl.spawn_feed(source_rx);
    target_ctl.spawn_feed(target_rx);

    let watchers = [
        tokio::spawn({
            let ns = args.namespace.clone();
            async move {
                if let Err(e) = tandem_kubehub::watch_requests::<Source>(SOURCE_CLUSTER, source_client, ns.as_deref(), source_tx).await {
                    error!(error = ?e, "source watcher failed");
                }
            }
        }),
        tokio::spawn({
            let ns = args.namespace.clone();
            async move {
                if let Err(e) = tandem_kubehub::watch_requests::<Target>(TARGET_CLUSTER, target_client, ns.as_deref(), target_tx).await {
                    error!(error = ?e, "target watcher failed");
                }
            }
        }),
    ];

    let cancel = CancellationToken::new();
    let controllers = [
        tokio::spawn(source_ctl.run(cancel.clone())),
        tokio::spawn(target_ctl.run(cancel.clone())),
    ];
    info!(ns = ?args.namespace, "controllers running; Ctrl-C to stop");

    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Ctrl-C received; shutting down");
    cancel.cancel();
    for h in probes.iter().chain(watchers.iter()) {
        h.abort();
    }
    for h in controllers {
        if let Err(e) = h.await {
            warn!(error = %e, "controller task ended abnormally");
        }
    }
    Ok(())
}

async fn reconcile_once(cli: &Cli, namespace: &str, name: &str, sync: &SyncArgs) -> Result<Outcome> {
    let (clusters, _, _) = connect(&cli.source_kubeconfig, &cli.target_kubeconfig).await?;
    for cluster in clusters.names() {
        clusters.mark_ready(&cluster);
    }
    let synchronizer = SourceSynchronizer::new(clusters, sync.options());
    let req = ReconcileRequest::new(SOURCE_CLUSTER, ObjectKey::new(namespace, name));
    Ok(synchronizer.reconcile(&CancellationToken::new(), &req).await)
}

async fn status(cli: &Cli, namespace: &str, name: &str) -> Result<()> {
    let (clusters, _, _) = connect(&cli.source_kubeconfig, &cli.target_kubeconfig).await?;
    for cluster in clusters.names() {
        clusters.mark_ready(&cluster);
    }
    let key = ObjectKey::new(namespace, name);
    let source = clusters.resolve(SOURCE_CLUSTER)?.sources()?.get(&key).await?;
    let target = match clusters.resolve(TARGET_CLUSTER)?.targets()?.get(&key).await {
        Ok(t) => Some(t),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e.into()),
    };

    match cli.output {
        Output::Human => {
            println!("source {}  message={:?}  additionalInfo={:?}", key, source.spec.message, source.spec.additional_info);
            match target.as_ref().and_then(|t| t.status.as_ref()) {
                Some(st) => println!("target {}  message={:?}  additionalInfo={:?}", key, st.message, st.additional_info),
                None => println!("target {}  (absent)", key),
            }
            println!();
            println!("{:<25} {:<14} {:<8} {:<20} MESSAGE", "TIME", "TYPE", "STATUS", "REASON");
            for c in source.conditions() {
                println!(
                    "{:<25} {:<14} {:<8} {:<20} {}",
                    c.last_transition_time.0.to_rfc3339(),
                    c.type_,
                    c.status,
                    c.reason,
                    c.message
                );
            }
        }
        Output::Json => {
            #[derive(serde::Serialize)]
            struct Report<'a> { source: &'a Source, target: Option<&'a Target> }
            println!("{}", serde_json::to_string_pretty(&Report { source: &source, target: target.as_ref() })?);
        }
    }
    Ok(())
}

fn print_crds() -> Result<()> {
    print!("{}", serde_yaml::to_string(&Source::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&Target::crd())?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics()?;
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run(args) => run(&cli, args).await?,
        Commands::Reconcile { namespace, name, sync } => {
            let outcome = reconcile_once(&cli, namespace, name, sync).await?;
            match cli.output {
                Output::Human => match &outcome {
                    Outcome::Success => println!("ok"),
                    Outcome::RetryAfter(d) => println!("retry after {:?}", d),
                    Outcome::Fatal(e) => println!("fatal: {}", e),
                },
                Output::Json => {
                    let v = match &outcome {
                        Outcome::Success => serde_json::json!({ "outcome": "success" }),
                        Outcome::RetryAfter(d) => serde_json::json!({ "outcome": "retry", "retryAfterMs": d.as_millis() as u64 }),
                        Outcome::Fatal(e) => serde_json::json!({ "outcome": "fatal", "error": e.to_string() }),
                    };
                    println!("{}", serde_json::to_string_pretty(&v)?);
                }
            }
            if !outcome.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Status { namespace, name } => status(&cli, namespace, name).await?,
        Commands::Crds => print_crds()?,
    }

    Ok(())
}
