//! Basic Router Example
//!
//! Routes `svc.internal` to a local backend, everything else to a default
//! backend, and sends non-TLS clients to port 8661. No metrics are exported.
//!
//! Run with: cargo run --example basic_router

use sni_router_config::RoutingFile;
use sni_router_core::{ConnectionHandler, NoopMetrics, RouteTable, Timeouts, run_router};
use std::sync::Arc;
use std::time::Duration;

const ROUTES: &str = r#"
- domain: "svc.internal"
  port: 9000
  useProxy: true
- domain: "non-tls"
  port: 8661
- domain: "default"
  port: 10443
"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let table = RouteTable::new(&RoutingFile::parse(ROUTES)?)?;
    let handler = ConnectionHandler::new(Arc::new(table), Arc::new(NoopMetrics)).with_timeouts(
        Timeouts {
            idle: Duration::from_secs(300),
            ..Timeouts::default()
        },
    );

    println!("Routing on 127.0.0.1:8443, press Ctrl+C to stop");
    run_router("127.0.0.1:8443".parse()?, handler).await
}
