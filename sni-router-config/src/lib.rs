use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Reserved `domain` value selecting the route for non-TLS traffic.
pub const NON_TLS_DOMAIN: &str = "non-tls";
/// Reserved `domain` value selecting the fallback route for unmatched SNI values.
pub const DEFAULT_DOMAIN: &str = "default";
/// Backend host used when a route does not name one.
pub const DEFAULT_TARGET_HOST: &str = "127.0.0.1";

/// Errors produced while loading or validating routing configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid routing YAML: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
    #[error("route #{index} has an empty domain")]
    EmptyDomain { index: usize },
    #[error("route #{index} ({domain}) has port 0, expected 1-65535")]
    InvalidPort { index: usize, domain: String },
    #[error("more than one `{0}` route configured")]
    DuplicateSpecialRoute(&'static str),
    #[error("offset routing requires at least one base domain")]
    NoBaseDomains,
    #[error("offset routing {0} must be between 1 and 65535")]
    ZeroPort(&'static str),
}

/// One entry of the routing file.
///
/// The `domain` field is either a hostname, a regular expression (when
/// `useRegex` is set), or one of the reserved keywords [`NON_TLS_DOMAIN`]
/// and [`DEFAULT_DOMAIN`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEntry {
    /// Hostname, pattern, or reserved keyword
    pub domain: String,
    /// Backend host (default: 127.0.0.1)
    #[serde(default = "default_host")]
    pub host: String,
    /// Backend port
    pub port: u16,
    /// Treat `domain` as a regular expression (default: false)
    #[serde(default)]
    pub use_regex: bool,
    /// Prefix the backend stream with a PROXY protocol v2 header (default: false)
    #[serde(default)]
    pub use_proxy: bool,
}

fn default_host() -> String {
    DEFAULT_TARGET_HOST.to_string()
}

impl RouteEntry {
    /// Returns true for the reserved non-TLS entry.
    pub fn is_non_tls(&self) -> bool {
        self.domain == NON_TLS_DOMAIN
    }

    /// Returns true for the reserved default entry.
    pub fn is_default(&self) -> bool {
        self.domain == DEFAULT_DOMAIN
    }

    /// Backend address as `host:port`, bracketing IPv6 literals.
    pub fn destination(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

/// Joins a host and port the way socket addresses are written, so IPv6
/// literals come out as `[::1]:443`.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// The ordered route list loaded from YAML.
///
/// Entry order is significant: generic routes are evaluated top to bottom
/// and the first match wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingFile {
    pub routes: Vec<RouteEntry>,
}

impl RoutingFile {
    /// Loads and validates a routing file.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use sni_router_config::RoutingFile;
    /// use std::path::Path;
    ///
    /// let routes = RoutingFile::from_file(Path::new("/etc/sni-router/routing.yaml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    /// Parses and validates routing YAML from a string.
    ///
    /// Empty `host` values are replaced with [`DEFAULT_TARGET_HOST`].
    ///
    /// # Examples
    ///
    /// ```
    /// use sni_router_config::RoutingFile;
    ///
    /// let yaml = r#"
    /// - domain: "api.example.com"
    ///   port: 8443
    /// - domain: "default"
    ///   host: "10.0.0.5"
    ///   port: 443
    ///   useProxy: true
    /// "#;
    ///
    /// let file = RoutingFile::parse(yaml).unwrap();
    /// assert_eq!(file.routes.len(), 2);
    /// assert_eq!(file.routes[0].destination(), "127.0.0.1:8443");
    /// assert!(file.default_route().unwrap().use_proxy);
    /// ```
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut file: RoutingFile = serde_yaml_ng::from_str(contents)?;
        for route in &mut file.routes {
            let host = route.host.trim();
            route.host = if host.is_empty() {
                default_host()
            } else {
                host.to_string()
            };
        }
        file.validate()?;
        Ok(file)
    }

    /// Checks ports, domains and the uniqueness of the reserved routes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut non_tls = 0;
        let mut default = 0;
        for (index, route) in self.routes.iter().enumerate() {
            if route.domain.is_empty() {
                return Err(ConfigError::EmptyDomain { index });
            }
            if route.port == 0 {
                return Err(ConfigError::InvalidPort {
                    index,
                    domain: route.domain.clone(),
                });
            }
            if route.is_non_tls() {
                non_tls += 1;
            } else if route.is_default() {
                default += 1;
            }
        }
        if non_tls > 1 {
            return Err(ConfigError::DuplicateSpecialRoute(NON_TLS_DOMAIN));
        }
        if default > 1 {
            return Err(ConfigError::DuplicateSpecialRoute(DEFAULT_DOMAIN));
        }
        Ok(())
    }

    /// The reserved non-TLS route, if configured.
    pub fn non_tls_route(&self) -> Option<&RouteEntry> {
        self.routes.iter().find(|r| r.is_non_tls())
    }

    /// The reserved default route, if configured.
    pub fn default_route(&self) -> Option<&RouteEntry> {
        self.routes.iter().find(|r| r.is_default())
    }

    /// Hostname routes in declaration order, without the reserved entries.
    pub fn generic_routes(&self) -> impl Iterator<Item = &RouteEntry> {
        self.routes
            .iter()
            .filter(|r| !r.is_non_tls() && !r.is_default())
    }
}

/// Settings for the base-domain/offset routing strategy.
///
/// A hostname such as `node12.example.com` below the base domain
/// `example.com` is sent to `base_port + 12` on `target_host`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetRouting {
    /// Recognized base domains (e.g. `example.com`)
    pub base_domains: Vec<String>,
    /// Port added to the numeric hostname suffix
    pub base_port: u16,
    /// Port used when no suffix can be derived
    pub default_port: u16,
    /// Port for non-TLS traffic; such traffic is rejected when unset
    pub non_tls_port: Option<u16>,
    /// Backend host for every destination
    pub target_host: String,
    /// Prefix backend streams with a PROXY protocol v2 header
    pub use_proxy: bool,
}

impl OffsetRouting {
    /// Trims and lowercases the base domains, drops empty entries and checks
    /// that the settings are usable.
    ///
    /// # Examples
    ///
    /// ```
    /// use sni_router_config::OffsetRouting;
    ///
    /// let settings = OffsetRouting {
    ///     base_domains: vec![" Example.COM ".into(), "".into()],
    ///     base_port: 10000,
    ///     default_port: 8443,
    ///     non_tls_port: None,
    ///     target_host: "127.0.0.1".into(),
    ///     use_proxy: false,
    /// }
    /// .normalized()
    /// .unwrap();
    ///
    /// assert_eq!(settings.base_domains, vec!["example.com".to_string()]);
    /// ```
    pub fn normalized(mut self) -> Result<Self, ConfigError> {
        self.base_domains = self
            .base_domains
            .iter()
            .map(|d| d.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        if self.base_domains.is_empty() {
            return Err(ConfigError::NoBaseDomains);
        }
        if self.base_port == 0 {
            return Err(ConfigError::ZeroPort("base port"));
        }
        if self.default_port == 0 {
            return Err(ConfigError::ZeroPort("default port"));
        }
        if self.non_tls_port == Some(0) {
            return Err(ConfigError::ZeroPort("non-tls port"));
        }
        if self.target_host.trim().is_empty() {
            self.target_host = default_host();
        }
        Ok(self)
    }
}
