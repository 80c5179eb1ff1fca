//! Accept loop and per-connection dispatch.

use crate::connection::{Connection, IDLE_TIMEOUT};
use crate::metrics::MetricsSink;
use crate::proxy_protocol::{self, ProxyHeader};
use crate::relay::{self, RelayStats};
use crate::routing::{Router, RoutingError};
use crate::sni::{ParsedHello, SniError};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Per-connection time limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Bound on receiving enough bytes to classify the connection
    pub client_hello: Duration,
    /// Bound on every individual read and write once connected
    pub idle: Duration,
    /// Bound on dialing the backend
    pub connect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            client_hello: Duration::from_secs(30),
            idle: IDLE_TIMEOUT,
            connect: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum DispatchError {
    #[error("failed to parse ClientHello: {0}")]
    Parse(#[from] SniError),
    #[error(transparent)]
    Route(#[from] RoutingError),
    #[error("failed to connect to {dst}: {source}")]
    Dial {
        dst: String,
        #[source]
        source: io::Error,
    },
}

/// Shared, cheaply cloned state for handling accepted connections.
#[derive(Clone)]
pub struct ConnectionHandler {
    router: Arc<dyn Router>,
    metrics: Arc<dyn MetricsSink>,
    timeouts: Timeouts,
    reject_missing_sni: bool,
}

impl ConnectionHandler {
    pub fn new(router: Arc<dyn Router>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            router,
            metrics,
            timeouts: Timeouts::default(),
            reject_missing_sni: false,
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Treat a ClientHello without `server_name` as a parse failure instead
    /// of routing it to the default destination.
    pub fn reject_missing_sni(mut self, reject: bool) -> Self {
        self.reject_missing_sni = reject;
        self
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Handles one accepted TCP connection until both relay directions end.
    pub async fn handle_connection(&self, socket: TcpStream, peer: SocketAddr) {
        let local = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to read local address");
                return;
            }
        };
        self.handle_stream(socket, peer, local).await;
    }

    /// Same as [`handle_connection`](Self::handle_connection) for any byte
    /// stream; `peer` and `local` are the addresses announced in a PROXY
    /// header.
    pub async fn handle_stream<S>(&self, stream: S, peer: SocketAddr, local: SocketAddr)
    where
        S: AsyncRead + AsyncWrite,
    {
        let started = Instant::now();
        let inbound = Connection::inbound(
            stream,
            peer,
            local,
            self.metrics.clone(),
            self.timeouts.idle,
        );
        info!(peer = %peer, "New connection");

        match self.dispatch(&inbound).await {
            Ok((sni, dst, stats)) => info!(
                peer = %peer,
                sni = %sni,
                dst = %dst,
                bytes_up = stats.client_to_backend,
                bytes_down = stats.backend_to_client,
                duration_secs = started.elapsed().as_secs_f64(),
                "Connection completed"
            ),
            Err(DispatchError::Parse(e)) => {
                debug!(peer = %peer, phase = "parse", error = %e, "Dropping connection")
            }
            Err(e @ DispatchError::Route(_)) => {
                warn!(peer = %peer, phase = "route", error = %e, "Dropping connection")
            }
            Err(e @ DispatchError::Dial { .. }) => {
                warn!(peer = %peer, phase = "dial", error = %e, "Dropping connection")
            }
        }
        inbound.close();
    }

    async fn dispatch<S>(
        &self,
        inbound: &Connection<S>,
    ) -> Result<(String, String, RelayStats), DispatchError>
    where
        S: AsyncRead + AsyncWrite,
    {
        let hello = self.classify(inbound).await?;
        let decision = self.router.route(&hello)?;
        let dst = decision.destination;
        debug!(sni = hello.label(), dst = %dst, proxy = decision.use_proxy_protocol, "Routed");

        let socket = match self.dial(&dst).await {
            Ok(socket) => socket,
            Err(source) => return Err(DispatchError::Dial { dst, source }),
        };
        let outbound = Connection::outbound(
            socket,
            dst.as_str(),
            hello.label(),
            self.metrics.clone(),
            self.timeouts.idle,
        );

        let stats = self
            .forward(inbound, &outbound, decision.use_proxy_protocol)
            .await;
        Ok((hello.label().to_string(), dst, stats))
    }

    async fn dial(&self, dst: &str) -> io::Result<TcpStream> {
        match timeout(self.timeouts.connect, TcpStream::connect(dst)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
        }
    }

    /// Sends the PROXY header when asked to, then relays. A header that
    /// cannot be written is logged and the relay goes ahead without it.
    async fn forward<S, T>(
        &self,
        inbound: &Connection<S>,
        outbound: &Connection<T>,
        use_proxy_protocol: bool,
    ) -> RelayStats
    where
        S: AsyncRead + AsyncWrite,
        T: AsyncRead + AsyncWrite,
    {
        if use_proxy_protocol {
            if let (Some(peer), Some(local)) = (inbound.peer_addr(), inbound.local_addr()) {
                let header = ProxyHeader::new(peer, local);
                if let Err(e) = proxy_protocol::write_header(outbound, &header).await {
                    warn!(peer = %peer, error = %e, "Failed to send PROXY header");
                }
            }
        }

        relay::relay(inbound, outbound).await
    }

    /// Parses the ClientHello and reports the outcome to the metrics sink.
    async fn classify<S>(&self, inbound: &Connection<S>) -> Result<ParsedHello, SniError>
    where
        S: AsyncRead + AsyncWrite,
    {
        let started = Instant::now();
        let result = inbound
            .client_hello(self.timeouts.client_hello)
            .await
            .and_then(|hello| match hello {
                ParsedHello::NoSni if self.reject_missing_sni => Err(SniError::SniNotFound),
                hello => Ok(hello),
            });

        let label = match &result {
            Ok(hello) => hello.label(),
            Err(_) => "error",
        };
        self.metrics.sni_parsed(label, started.elapsed());
        result
    }
}

/// Accepts connections until `shutdown` resolves, handling each on its own
/// task. Accept errors are logged and accepting continues.
///
/// Connections already being relayed keep running on their own tasks
/// until they finish or the runtime shuts down.
pub async fn serve_until<F>(listener: &TcpListener, handler: ConnectionHandler, shutdown: F)
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received shutdown signal");
                break;
            }
            result = listener.accept() => match result {
                Ok((socket, peer)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler.handle_connection(socket, peer).await;
                    });
                }
                Err(e) => error!(error = %e, "Accept error"),
            }
        }
    }
}
