use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use patchdiff_chart::{load_bundle, merge_values, TemplateRenderer, ValueOptions};
use patchdiff_kubehub::KubeCluster;
use patchdiff_preview::{PreviewConfig, PreviewContext, UpgradeRequest};
use patchdiff_release::{open_store, DriverKind};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "patchdiff", version, about = "Preview the patches a chart upgrade would send, without applying them")]
struct Cli {
    /// Namespace of the release (default: HELM_NAMESPACE, then the kubeconfig context)
    #[arg(short = 'n', long = "namespace", global = true, env = "HELM_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the patch each live resource would receive, as one JSON array
    Upgrade {
        /// Release name
        release: String,
        /// Path to an unpacked chart directory
        chart: PathBuf,
        /// Values file (repeatable, later files win)
        #[arg(short = 'f', long = "values", action = ArgAction::Append)]
        values: Vec<PathBuf>,
        /// Set values, e.g. `image.tag=1.26,replicaCount=3`
        #[arg(long = "set", action = ArgAction::Append)]
        set: Vec<String>,
        /// Set values, always as strings
        #[arg(long = "set-string", action = ArgAction::Append)]
        set_string: Vec<String>,
        /// Set values from files, e.g. `config=./app.conf`
        #[arg(long = "set-file", action = ArgAction::Append)]
        set_file: Vec<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("PATCHDIFF_LOG").unwrap_or_else(|_| "warn".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    // stdout carries the patch array only
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PATCHDIFF_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid PATCHDIFF_METRICS_ADDR; expected host:port");
        }
    }
}

async fn upgrade(
    namespace: Option<String>,
    release: String,
    chart: PathBuf,
    opts: ValueOptions,
) -> Result<String> {
    let cluster = KubeCluster::connect().await?;
    let namespace = namespace
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| cluster.client().default_namespace().to_string());
    info!(release = %release, namespace = %namespace, chart = %chart.display(), "upgrade preview invoked");

    let driver = DriverKind::from_env()?;
    let releases = open_store(&driver, cluster.client(), &namespace)?;
    let bundle = load_bundle(&chart)?;
    let values = merge_values(&opts)?;
    let config = PreviewConfig::from_env(&namespace);

    let ctx = PreviewContext::new(Arc::new(cluster), releases, Arc::new(TemplateRenderer), config);
    let set = ctx.run(&UpgradeRequest { release, bundle, values }).await?;
    set.assemble().context("assembling patch output")
}

#[tokio::main]
async fn main() {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Upgrade { release, chart, values, set, set_string, set_file } => {
            let opts = ValueOptions { value_files: values, values: set, string_values: set_string, file_values: set_file };
            upgrade(cli.namespace, release, chart, opts).await
        }
    };
    match outcome {
        Ok(out) => println!("{}", out),
        Err(e) => {
            error!(error = ?e, "preview failed");
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}
