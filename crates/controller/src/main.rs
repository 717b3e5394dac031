#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod run;

use config::Config;

#[derive(Parser, Debug)]
#[command(name = "capstan-controller", version, about = "Runs LRPs and tasks as Kubernetes workloads")]
struct Cli {
    /// YAML config file
    #[arg(long, env = "CAPSTAN_CONFIG")]
    config: Option<PathBuf>,
    /// Only manage workloads in this namespace (overrides the config file)
    #[arg(long)]
    namespace: Option<String>,
    /// Workers per controller (overrides the config file)
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();

    let cli = Cli::parse();
    let mut cfg = Config::load(cli.config.as_deref())?;
    if let Some(ns) = cli.namespace {
        cfg.workloads_namespace = Some(ns);
    }
    if let Some(n) = cli.workers {
        cfg.workers_per_controller = n;
    }
    info!(config = ?cli.config, namespace = ?cfg.workloads_namespace, workers = cfg.workers_per_controller, "config loaded");
    run::run(cfg).await
}

fn init_tracing() {
    let env = std::env::var("CAPSTAN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::from_str(&env).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    let Ok(addr) = std::env::var("CAPSTAN_METRICS_ADDR") else {
        return;
    };
    match addr.parse::<SocketAddr>() {
        Ok(sock) => {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock);
            match builder.install() {
                Ok(()) => info!(addr = %sock, "metrics exporter installed"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        }
        Err(e) => warn!(%addr, error = %e, "invalid CAPSTAN_METRICS_ADDR"),
    }
}
