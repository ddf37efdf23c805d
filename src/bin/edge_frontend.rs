//! Process entrypoint (§10.4): loads configuration, installs logging, and
//! runs the accept loop. Mirrors the teacher's `main.rs` shape (jemalloc
//! as global allocator, `clap`-derived args overlaying file config,
//! `tracing_subscriber` for structured logs, `tokio::signal` for graceful
//! shutdown) generalized to this crate's connection type instead of
//! PgBouncer's pooler.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use edge_frontend::backend::stub::DefaultConnector;
use edge_frontend::config::{self, Config};
use edge_frontend::connection::Connection;
use edge_frontend::dbview::AllowAll;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser, Debug)]
#[command(name = "edge-frontend", about = "Binary protocol frontend")]
struct Args {
    /// Path to a TOML or YAML configuration file.
    #[arg(short, long, env = "EDGE_FRONTEND_CONFIG")]
    config: Option<String>,

    /// Overrides the configured listen address.
    #[arg(short, long, env = "EDGE_FRONTEND_BIND")]
    bind: Option<String>,

    /// Tracing filter, e.g. "info" or "edge_frontend=debug".
    #[arg(long, env = "EDGE_FRONTEND_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(args.log_level.clone()))
        .json()
        .init();

    let mut cfg = match &args.config {
        Some(path) => match Config::from_file(path).await {
            Ok(cfg) => cfg,
            Err(err) => {
                error!(%err, path, "failed to load configuration");
                std::process::exit(exitcode::CONFIG);
            }
        },
        None => Config::default(),
    };
    if let Some(bind) = args.bind {
        cfg.listen_address = bind;
    }
    config::set_config(cfg.clone());

    let listener = match TcpListener::bind(&cfg.listen_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, address = %cfg.listen_address, "failed to bind listen address");
            std::process::exit(exitcode::OSERR);
        }
    };
    info!(address = %cfg.listen_address, "listening");

    let auth_hook = Arc::new(AllowAll);
    let connector = Arc::new(DefaultConnector {
        default_module_alias: cfg.default_module_alias.clone(),
        query_cache_capacity: cfg.query_cache_capacity,
    });

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let serve = {
        let shutdown_tx = shutdown_tx.clone();
        async move {
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%err, "failed to accept connection");
                        continue;
                    }
                };
                info!(%peer, "accepted connection");

                let conn = Connection::new(
                    socket,
                    auth_hook.clone(),
                    connector.clone(),
                    cfg.query_cache_enabled,
                );
                let shutdown_rx = shutdown_tx.subscribe();
                tokio::spawn(async move {
                    conn.run(shutdown_rx).await;
                });
            }
        }
    };

    tokio::select! {
        _ = serve => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
            let _ = shutdown_tx.send(());
        }
    }
}
