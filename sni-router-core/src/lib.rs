//! Transparent TLS router: reads the SNI of each incoming ClientHello
//! without terminating TLS and relays the raw connection to the backend
//! chosen for that hostname.

pub mod connection;
pub mod listener;
pub mod metrics;
pub mod peek;
pub mod proxy_protocol;
pub mod relay;
pub mod routing;
pub mod sni;

#[cfg(test)]
mod test_util;

pub use connection::Connection;
pub use listener::{ConnectionHandler, Timeouts, serve_until};
pub use metrics::{MetricsSink, NoopMetrics, PrometheusMetrics};
pub use routing::{OffsetRouter, RouteTable, Router, RoutingDecision, RoutingError};
pub use sni::{ParsedHello, SniError, parse_client_hello};

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

/// Binds `addr` and serves connections until Ctrl-C.
///
/// Returns as soon as accepting stops; connections still being relayed end
/// when the runtime is shut down.
pub async fn run_router(
    addr: SocketAddr,
    handler: ConnectionHandler,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    info!("Router listening on {}", listener.local_addr()?);

    serve_until(&listener, handler, async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    })
    .await;

    info!("Shutting down router");
    Ok(())
}
