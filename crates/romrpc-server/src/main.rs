//! romrpc server - JSON-RPC Remote Object Model server with demo types.
//!
//! Serves the demo registry over framed TCP and, optionally, the HTTP
//! long-poll binding. The bound ports are printed to stdout so a parent
//! process can read them.

mod demo;
mod server;

use anyhow::Result;
use clap::Parser;
use romrpc::ServerOptions;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "romrpc-server")]
#[command(about = "JSON-RPC Remote Object Model server")]
struct Args {
    /// Framed TCP port (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// HTTP long-poll port (0 = auto-assign); HTTP is off when omitted
    #[arg(long)]
    http_port: Option<u16>,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Close sessions idle for this many seconds
    #[arg(long, default_value = "180")]
    session_timeout_secs: u64,

    /// Maximum concurrent TCP connections
    #[arg(long, default_value = "256")]
    max_connections: usize,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --debug when set
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.debug { "debug" } else { "info" }));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);
    if args.json_logs {
        builder.json().init();
    } else {
        builder.compact().init();
    }

    info!("Starting romrpc server");

    let options = ServerOptions::default()
        .with_session_idle_timeout(Duration::from_secs(args.session_timeout_secs))
        .with_max_connections(args.max_connections);
    let mut running = server::start_server(&args.host, args.port, args.http_port, options).await?;

    // Intentional stdout for the parent process
    println!("RPC_PORT={}", running.tcp.addr().port());
    if let Some(addr) = running.http_addr {
        println!("HTTP_PORT={}", addr.port());
    }

    info!(
        "Serving {} remote types on tcp://{}",
        running.rom.registry().len(),
        running.tcp.addr()
    );

    tokio::signal::ctrl_c().await?;
    info!(
        "Shutdown signal received, closing {} open sessions",
        running.rpc.registry().len()
    );
    running.tcp.shutdown();
    Ok(())
}
