//! Proxy binary: flag parsing, config loading, signal handling.

use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use porter::{spawn_cluster, spawn_stat_listener, ClusterConfigs, Config, ProxyMetrics};

#[derive(Debug, Parser)]
#[command(name = "porter", version, about = "Proxy for memcached and Redis server pools")]
struct Args {
    /// Global configuration file (TOML).
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Cluster configuration file (TOML); repeatable.
    #[arg(long = "cluster")]
    clusters: Vec<std::path::PathBuf>,

    /// Check the configuration and exit.
    #[arg(short = 't', long)]
    check: bool,

    /// Log filter; overrides the config file.
    #[arg(long)]
    log_level: Option<String>,

    /// Stats listener address; overrides the config file.
    #[arg(long)]
    stat_addr: Option<String>,
}

fn load(args: &Args) -> porter::Result<(Config, Vec<porter::ClusterConfig>)> {
    let mut config = match &args.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    if args.log_level.is_some() {
        config.log_level = args.log_level.clone();
    }
    if args.stat_addr.is_some() {
        config.stat_addr = args.stat_addr.clone();
    }

    let mut names = HashSet::new();
    let mut clusters = Vec::new();
    for path in &args.clusters {
        let ccs = ClusterConfigs::load_from_file(path)?;
        for cc in ccs.clusters {
            cc.validate()?;
            if !names.insert(cc.name.clone()) {
                return Err(porter::Error::Config(format!(
                    "duplicate cluster name '{}'",
                    cc.name
                )));
            }
            clusters.push(cc);
        }
    }
    if clusters.is_empty() {
        return Err(porter::Error::Config(
            "no clusters configured; pass at least one --cluster file".into(),
        ));
    }
    Ok((config, clusters))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let (config, clusters) = match load(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("porter: {e}");
            return ExitCode::FAILURE;
        }
    };
    if args.check {
        println!("configuration ok: {} cluster(s)", clusters.len());
        return ExitCode::SUCCESS;
    }

    let filter = config.log_level.as_deref().unwrap_or("info");
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let metrics = Arc::new(ProxyMetrics::new());
    let cancel = CancellationToken::new();

    if let Some(addr) = &config.stat_addr {
        if config.use_metrics {
            if let Err(e) = spawn_stat_listener(addr, metrics.clone(), cancel.clone()).await {
                error!(error = %e, "stats listener failed to start");
                return ExitCode::FAILURE;
            }
        }
    }

    for cc in clusters {
        let name = cc.name.clone();
        if let Err(e) = spawn_cluster(cc, metrics.clone(), cancel.clone()).await {
            error!(cluster = %name, error = %e, "cluster failed to start");
            cancel.cancel();
            return ExitCode::FAILURE;
        }
    }
    info!(version = env!("CARGO_PKG_VERSION"), "porter started");

    let code = run_signal_loop().await;
    cancel.cancel();
    info!("porter exited");
    code
}

/// Block until a terminating signal. SIGHUP is reserved for config reload.
async fn run_signal_loop() -> ExitCode {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "signal handler");
            return ExitCode::FAILURE;
        }
    };
    let mut int = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "signal handler");
            return ExitCode::FAILURE;
        }
    };
    let mut quit = match signal(SignalKind::quit()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "signal handler");
            return ExitCode::FAILURE;
        }
    };
    let mut hup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "signal handler");
            return ExitCode::FAILURE;
        }
    };

    loop {
        tokio::select! {
            _ = term.recv() => { info!("SIGTERM received, shutting down"); return ExitCode::SUCCESS; }
            _ = int.recv() => { info!("SIGINT received, shutting down"); return ExitCode::SUCCESS; }
            _ = quit.recv() => { info!("SIGQUIT received, shutting down"); return ExitCode::SUCCESS; }
            _ = hup.recv() => { warn!("SIGHUP received; config reload is not implemented, ignoring"); }
        }
    }
}
