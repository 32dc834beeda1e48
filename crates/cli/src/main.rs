use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use lambda_build::{BuildConfig, BuildManager};
use lambda_controller::{ControllerConfig, Reconciler};
use lambda_core::LambdaFunction;
use lambda_kubehub::{KubeJobs, KubeLeases, KubeSecrets, KubeServing, KubeStore};
use lambda_receiver::{Receiver, ReceiverConfig};
use lambda_schema::SchemaRegistry;
use lambda_sources::{FetchConfig, Fetchers};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "lambdactl", version, about = "Knative Lambda operator")]
struct Cli {
    /// Namespace to watch (default: all namespaces)
    #[arg(long = "ns", global = true, env = "LAMBDA_WATCH_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller and the CloudEvents receiver in one process
    Run,
    /// Run only the reconciliation controller
    Controller,
    /// Run only the CloudEvents receiver
    Receiver,
    /// Print the LambdaFunction CustomResourceDefinition as YAML
    Crd,
    /// Validate a CloudEvent payload file against the built-in schemas
    Validate {
        /// CloudEvent type, e.g. "io.knative.lambda.command.function.deploy"
        event_type: String,
        /// JSON or YAML payload
        file: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("LAMBDA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("LAMBDA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid LAMBDA_METRICS_ADDR; expected host:port");
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
    }
    info!("shutdown requested");
}

fn reconciler(client: &Client) -> Arc<Reconciler> {
    let config = ControllerConfig::from_env();
    let build_config = BuildConfig::from_env();
    info!(
        registry = %build_config.push_registry,
        serving = config.serving_enabled,
        eventing = config.eventing_enabled,
        "controller configured"
    );
    let builds = BuildManager::new(
        build_config,
        Arc::new(Fetchers::new(FetchConfig::from_env())),
        Arc::new(KubeJobs::new(client.clone())),
        Arc::new(KubeSecrets::new(client.clone())),
    );
    Arc::new(Reconciler::new(
        Arc::new(KubeStore::new(client.clone())),
        Arc::new(builds),
        Arc::new(KubeServing::new(client.clone())),
        Arc::new(KubeLeases::new(client.clone())),
        config.lifecycle_sink(),
        config,
    ))
}

fn receiver(client: &Client) -> Result<Arc<Receiver>> {
    let rx = Receiver::new(ReceiverConfig::from_env(), Arc::new(KubeStore::new(client.clone())))?;
    Ok(Arc::new(rx))
}

fn read_payload(file: &PathBuf) -> Result<serde_json::Value> {
    let text = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    match serde_json::from_str(&text) {
        Ok(v) => Ok(v),
        Err(_) => serde_yaml::from_str(&text).with_context(|| format!("parsing {} as JSON or YAML", file.display())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Crd => {
            print!("{}", serde_yaml::to_string(&LambdaFunction::crd())?);
        }
        Commands::Validate { event_type, file } => {
            let payload = read_payload(&file)?;
            let registry = SchemaRegistry::with_builtin()?;
            if !registry.has_schema(&event_type) {
                println!("no schema registered for {event_type}; payload accepted as-is");
                return Ok(());
            }
            match registry.validate("cli", &event_type, &payload) {
                Ok(()) => println!("valid"),
                Err(e) => {
                    eprintln!("invalid: {e}");
                    std::process::exit(1);
                }
            }
        }
        Commands::Controller => {
            init_metrics();
            let client = Client::try_default().await.context("connecting to the cluster")?;
            lambda_controller::run(client.clone(), reconciler(&client), ns, shutdown_signal()).await?;
        }
        Commands::Receiver => {
            init_metrics();
            let client = Client::try_default().await.context("connecting to the cluster")?;
            lambda_receiver::serve(receiver(&client)?, shutdown_signal()).await?;
        }
        Commands::Run => {
            init_metrics();
            let client = Client::try_default().await.context("connecting to the cluster")?;
            let rx = receiver(&client)?;
            let server = tokio::spawn(lambda_receiver::serve(rx, shutdown_signal()));
            let controller = lambda_controller::run(client.clone(), reconciler(&client), ns, shutdown_signal());
            let controlled = controller.await;
            match server.await {
                Ok(Err(e)) => error!(error = %e, "receiver exited with error"),
                Err(e) => error!(error = %e, "receiver task failed"),
                Ok(Ok(())) => {}
            }
            controlled?;
        }
    }
    Ok(())
}
