use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

use tsrouter::{build_root, Config, LogSink, ProtocolRegistry, QueryRouter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "tsrouter.toml", env = "TSROUTER_CONFIG")]
    config: PathBuf,

    /// Directory for the log file
    #[arg(long, default_value = ".")]
    log_dir: String,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short, long)]
    threads: Option<usize>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tsrouter::logging::init(&args.log_dir);

    let num_cpus = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    let worker_threads = args.threads.unwrap_or(num_cpus);

    info!(worker_threads, "starting query router");
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;
    rt.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load(&args.config)?;
    info!(
        groups = config.groups.len(),
        config = %args.config.display(),
        "configuration loaded"
    );
    for group in &config.groups {
        info!(
            name = %group.name,
            protocol = %group.protocol,
            servers = group.servers.len(),
            "backend group"
        );
    }

    let registry = ProtocolRegistry::with_defaults();
    let root = build_root(&config, &registry)?;
    let router = QueryRouter::start(root, &config.router, Arc::new(LogSink));
    info!(backends = router.backends().len(), "router started");

    shutdown_signal().await;
    info!("shutdown signal received");
    router.stop();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(%err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(%err, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
