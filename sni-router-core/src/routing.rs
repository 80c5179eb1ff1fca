//! Route resolution.
//!
//! A [`Router`] maps a classified connection to a backend address. Two
//! strategies exist: [`RouteTable`], driven by the YAML route file, and
//! [`OffsetRouter`], which derives the port from a numeric hostname suffix.
//! Both are immutable after construction and shared across all connection
//! tasks.

use crate::sni::ParsedHello;
use regex::Regex;
use sni_router_config::{ConfigError, OffsetRouting, RouteEntry, RoutingFile, join_host_port};

/// Where to send a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    /// Backend address as `host:port`
    pub destination: String,
    /// Whether a PROXY protocol v2 header precedes the relayed bytes
    pub use_proxy_protocol: bool,
}

impl RoutingDecision {
    fn from_entry(entry: &RouteEntry) -> Self {
        Self {
            destination: entry.destination(),
            use_proxy_protocol: entry.use_proxy,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("non-TLS traffic received but no non-tls route is configured")]
    NoNonTlsRoute,
    #[error(
        "no route for {} and no default route is configured",
        .sni.as_deref().unwrap_or("TLS without SNI")
    )]
    NoDefaultRoute { sni: Option<String> },
    #[error("invalid route pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Routing strategy selected at startup.
pub trait Router: Send + Sync {
    fn route(&self, hello: &ParsedHello) -> Result<RoutingDecision, RoutingError>;
}

#[derive(Debug)]
enum Matcher {
    Exact(String),
    Pattern(Regex),
}

#[derive(Debug)]
struct Route {
    matcher: Matcher,
    decision: RoutingDecision,
}

impl Route {
    fn compile(entry: &RouteEntry) -> Result<Self, RoutingError> {
        let matcher = if entry.use_regex {
            let regex = Regex::new(&entry.domain).map_err(|source| RoutingError::InvalidPattern {
                pattern: entry.domain.clone(),
                source,
            })?;
            Matcher::Pattern(regex)
        } else {
            Matcher::Exact(entry.domain.clone())
        };
        Ok(Self {
            matcher,
            decision: RoutingDecision::from_entry(entry),
        })
    }

    fn matches(&self, sni: &str) -> bool {
        match &self.matcher {
            Matcher::Exact(domain) => domain == sni,
            // Unanchored: a pattern matches anywhere in the name
            Matcher::Pattern(regex) => regex.is_match(sni),
        }
    }
}

/// Ordered hostname rules plus the `non-tls` and `default` routes.
#[derive(Debug)]
pub struct RouteTable {
    routes: Vec<Route>,
    non_tls: Option<RoutingDecision>,
    default: Option<RoutingDecision>,
}

impl RouteTable {
    /// Compiles a validated route file. Every regex is compiled here, so a
    /// bad pattern fails at startup rather than per connection.
    pub fn new(file: &RoutingFile) -> Result<Self, RoutingError> {
        let routes = file
            .generic_routes()
            .map(Route::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            routes,
            non_tls: file.non_tls_route().map(RoutingDecision::from_entry),
            default: file.default_route().map(RoutingDecision::from_entry),
        })
    }

    /// Number of routes, the reserved `non-tls` and `default` included.
    pub fn len(&self) -> usize {
        self.routes.len() + usize::from(self.non_tls.is_some()) + usize::from(self.default.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fallback(&self, sni: Option<&str>) -> Result<RoutingDecision, RoutingError> {
        self.default.clone().ok_or_else(|| RoutingError::NoDefaultRoute {
            sni: sni.map(str::to_string),
        })
    }
}

impl Router for RouteTable {
    fn route(&self, hello: &ParsedHello) -> Result<RoutingDecision, RoutingError> {
        match hello {
            ParsedHello::NonTls => self.non_tls.clone().ok_or(RoutingError::NoNonTlsRoute),
            ParsedHello::NoSni => self.fallback(None),
            ParsedHello::Sni(sni) => match self.routes.iter().find(|r| r.matches(sni)) {
                Some(route) => Ok(route.decision.clone()),
                None => self.fallback(Some(sni)),
            },
        }
    }
}

/// Base-domain strategy: `node12.example.com` goes to `base_port + 12`.
#[derive(Debug, Clone)]
pub struct OffsetRouter {
    settings: OffsetRouting,
}

impl OffsetRouter {
    pub fn new(settings: OffsetRouting) -> Result<Self, ConfigError> {
        Ok(Self {
            settings: settings.normalized()?,
        })
    }

    /// Port for a TLS server name.
    ///
    /// The name must be a base domain or end in `.<base>`; the offset is the
    /// run of ASCII digits ending the part before the base domain. Anything
    /// else, including a port past 65535, yields the default port.
    pub fn port_for(&self, sni: &str) -> u16 {
        let host = sni.trim_end_matches('.').to_ascii_lowercase();
        self.settings
            .base_domains
            .iter()
            .find_map(|base| {
                host.strip_suffix(base.as_str())
                    .and_then(|prefix| prefix.strip_suffix('.'))
            })
            .and_then(|prefix| self.offset_port(prefix))
            .unwrap_or(self.settings.default_port)
    }

    fn offset_port(&self, prefix: &str) -> Option<u16> {
        let digits_start = prefix.len()
            - prefix
                .bytes()
                .rev()
                .take_while(u8::is_ascii_digit)
                .count();
        let offset: u32 = prefix[digits_start..].parse().ok()?;
        let port = u32::from(self.settings.base_port).checked_add(offset)?;
        u16::try_from(port).ok()
    }

    fn decision(&self, port: u16) -> RoutingDecision {
        RoutingDecision {
            destination: join_host_port(&self.settings.target_host, port),
            use_proxy_protocol: self.settings.use_proxy,
        }
    }
}

impl Router for OffsetRouter {
    fn route(&self, hello: &ParsedHello) -> Result<RoutingDecision, RoutingError> {
        match hello {
            ParsedHello::NonTls => self
                .settings
                .non_tls_port
                .map(|port| self.decision(port))
                .ok_or(RoutingError::NoNonTlsRoute),
            ParsedHello::NoSni => Ok(self.decision(self.settings.default_port)),
            ParsedHello::Sni(sni) => Ok(self.decision(self.port_for(sni))),
        }
    }
}
