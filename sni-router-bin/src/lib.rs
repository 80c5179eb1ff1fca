use bytes::Bytes;
use clap::{ArgAction, Parser, ValueEnum};
use http_body_util::Full;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TEXT_FORMAT, TextEncoder};
use sni_router_config::{OffsetRouting, RoutingFile};
use sni_router_core::{
    ConnectionHandler, OffsetRouter, PrometheusMetrics, RouteTable, Router, Timeouts, run_router,
};
use std::convert::Infallible;
use std::error::Error;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

/// How hostnames are mapped to backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Strategy {
    /// Ordered rules from the routing file
    Table,
    /// `base_port` plus the numeric suffix of the hostname
    Offset,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to accept client connections on
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0")]
    pub listen_addr: IpAddr,

    #[arg(long, env = "LISTEN_PORT", default_value_t = 443)]
    pub listen_port: u16,

    /// Port of the Prometheus metrics endpoint
    #[arg(long, env = "METRICS_PORT", default_value_t = 9113)]
    pub metrics_port: u16,

    /// YAML routing file used by the table strategy
    #[arg(
        short = 'c',
        long,
        env = "ROUTING_CONFIG_PATH",
        default_value = "/etc/sni-router/routing.yaml"
    )]
    pub routing_config: PathBuf,

    /// Defaults to `offset` when base domains are given, `table` otherwise
    #[arg(long, env = "ROUTING_STRATEGY", value_enum)]
    pub strategy: Option<Strategy>,

    /// Comma separated base domains for the offset strategy
    #[arg(long, env = "ROUTING_BASE_DOMAINS", value_delimiter = ',')]
    pub base_domains: Vec<String>,

    #[arg(long, env = "ROUTING_BASE_PORT", default_value_t = 10000)]
    pub base_port: u16,

    #[arg(long, env = "ROUTING_DEFAULT_PORT", default_value_t = 8443)]
    pub default_port: u16,

    /// Backend port for non-TLS traffic under the offset strategy
    #[arg(long, env = "ROUTING_NON_TLS_PORT")]
    pub non_tls_port: Option<u16>,

    #[arg(long, env = "ROUTING_TARGET_HOST", default_value = "127.0.0.1")]
    pub target_host: String,

    /// Send a PROXY protocol v2 header to offset-strategy backends
    #[arg(
        long,
        env = "ROUTING_USE_PROXY",
        action = ArgAction::Set,
        default_value_t = false,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub use_proxy: bool,

    #[arg(long, env = "IDLE_TIMEOUT_SECS", default_value_t = 30)]
    pub idle_timeout_secs: u64,

    #[arg(long, env = "CLIENT_HELLO_TIMEOUT_SECS", default_value_t = 30)]
    pub client_hello_timeout_secs: u64,

    #[arg(long, env = "CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Drop TLS clients that send no server name instead of using the default route
    #[arg(
        long,
        env = "REJECT_MISSING_SNI",
        action = ArgAction::Set,
        default_value_t = false,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub reject_missing_sni: bool,
}

impl Args {
    pub fn strategy(&self) -> Strategy {
        self.strategy.unwrap_or(if self.base_domains.is_empty() {
            Strategy::Table
        } else {
            Strategy::Offset
        })
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            client_hello: Duration::from_secs(self.client_hello_timeout_secs),
            idle: Duration::from_secs(self.idle_timeout_secs),
            connect: Duration::from_secs(self.connect_timeout_secs),
        }
    }

    pub fn listen_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.listen_port)
    }

    fn offset_routing(&self) -> OffsetRouting {
        OffsetRouting {
            base_domains: self.base_domains.clone(),
            base_port: self.base_port,
            default_port: self.default_port,
            non_tls_port: self.non_tls_port,
            target_host: self.target_host.clone(),
            use_proxy: self.use_proxy,
        }
    }
}

/// Builds the routing strategy selected by `args`.
pub fn build_router(args: &Args) -> Result<Arc<dyn Router>, Box<dyn Error>> {
    match args.strategy() {
        Strategy::Table => {
            let file = RoutingFile::from_file(&args.routing_config)?;
            let table = RouteTable::new(&file)?;
            info!(
                path = %args.routing_config.display(),
                routes = table.len(),
                non_tls = file.non_tls_route().is_some(),
                default = file.default_route().is_some(),
                "Loaded route table"
            );
            Ok(Arc::new(table))
        }
        Strategy::Offset => {
            let router = OffsetRouter::new(args.offset_routing())?;
            info!(
                base_domains = ?args.base_domains,
                base_port = args.base_port,
                default_port = args.default_port,
                "Using offset routing"
            );
            Ok(Arc::new(router))
        }
    }
}

/// Serves the registry in the Prometheus text format on every request.
pub async fn serve_metrics(listener: TcpListener, registry: Registry) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Metrics accept error");
                continue;
            }
        };
        let registry = registry.clone();
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            let service = service_fn(move |_req: Request<hyper::body::Incoming>| {
                let registry = registry.clone();
                async move { Ok::<_, Infallible>(render_metrics(&registry)) }
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = %err, "Metrics server error");
            }
        });
    }
}

fn render_metrics(registry: &Registry) -> Response<Full<Bytes>> {
    let mut buffer = Vec::new();
    match TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        Ok(()) => {
            let mut response = Response::new(Full::new(Bytes::from(buffer)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT));
            response
        }
        Err(e) => {
            error!(error = %e, "Metrics encoding error");
            let mut response = Response::new(Full::new(Bytes::from_static(b"encoding error")));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

pub async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    // Initialize logging
    fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
                .add_directive("sni_router=debug".parse()?),
        )
        .with_target(false)
        .json()
        .init();

    let router = build_router(&args)?;

    let registry = Registry::new();
    let metrics = Arc::new(PrometheusMetrics::new(&registry)?);
    let metrics_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.metrics_port);
    let metrics_listener = TcpListener::bind(metrics_addr).await?;
    info!("Metrics endpoint listening on {}", metrics_addr);
    tokio::spawn(serve_metrics(metrics_listener, registry));

    let handler = ConnectionHandler::new(router, metrics)
        .with_timeouts(args.timeouts())
        .reject_missing_sni(args.reject_missing_sni);

    run_router(args.listen_socket_addr(), handler).await
}
