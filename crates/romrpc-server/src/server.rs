//! Wires the demo registry to both bindings.

use crate::demo;
use romrpc::rom::{RomRpcHandler, RomServer};
use romrpc::server::ServerHandle;
use romrpc::{router, JsonRpcServer, ServerOptions};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tracing::{error, info};

/// Cap on in-flight HTTP requests. Parked polls count against it.
const MAX_HTTP_IN_FLIGHT: usize = 512;

/// A running server: framed TCP always, HTTP long-poll when asked for.
pub struct RunningServer {
    pub rom: Arc<RomServer>,
    pub rpc: Arc<JsonRpcServer>,
    pub tcp: ServerHandle,
    pub http_addr: Option<SocketAddr>,
}

/// Start the ROM server.
///
/// `http_port` of `None` disables the HTTP binding; `Some(0)` auto-assigns.
pub async fn start_server(
    host: &str,
    tcp_port: u16,
    http_port: Option<u16>,
    options: ServerOptions,
) -> anyhow::Result<RunningServer> {
    let rom = RomServer::new(demo::registry());
    let rpc = RomRpcHandler::serve(rom.clone(), options);

    let tcp_addr: SocketAddr = format!("{}:{}", host, tcp_port).parse()?;
    let tcp = rpc.start_tcp(tcp_addr).await?;

    let http_addr = match http_port {
        Some(port) => {
            let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
            let listener = tokio::net::TcpListener::bind(addr).await?;
            let actual_addr = listener.local_addr()?;
            let app = router(rpc.clone()).layer(ConcurrencyLimitLayer::new(MAX_HTTP_IN_FLIGHT));

            info!("HTTP long-poll binding listening on {}", actual_addr);
            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app).await {
                    error!("HTTP server error: {}", e);
                }
            });
            Some(actual_addr)
        }
        None => None,
    };

    Ok(RunningServer {
        rom,
        rpc,
        tcp,
        http_addr,
    })
}
