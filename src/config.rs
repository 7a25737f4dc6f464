//! Client configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::breaker::{Breaker, BreakerConfig, CircuitBreaker};
use crate::connection::Dialer;
use crate::router::{Crc32Router, ServerSelector};

/// Factory for per-server circuit breakers. Returning `None` disables
/// breaker protection for that server (the server pool falls back to the
/// direct path).
pub type BreakerFactory = Arc<dyn Fn(&str) -> Option<Box<dyn Breaker>> + Send + Sync>;

/// Every tunable the client and its per-server pools expose. Constructed
/// with [`Config::new`] and customized via the `with_*` builder methods.
#[derive(Clone)]
pub struct Config {
    pub servers: Vec<String>,
    pub max_size: usize,
    pub dial_timeout: Duration,
    pub max_conn_lifetime: Option<Duration>,
    pub max_conn_idle_time: Option<Duration>,
    pub health_check_interval: Option<Duration>,
    pub dialer: Option<Arc<dyn Dialer>>,
    pub new_circuit_breaker: Option<BreakerFactory>,
    pub server_selector: Arc<dyn ServerSelector>,
}

impl Config {
    /// `servers` should be `host:port` pairs (or `tcp://host:port`); bare
    /// `host:port` defaults to memcached's standard port when none is
    /// given.
    pub fn new(servers: Vec<String>) -> Self {
        Config {
            servers,
            max_size: 10,
            dial_timeout: Duration::from_secs(1),
            max_conn_lifetime: None,
            max_conn_idle_time: None,
            health_check_interval: None,
            dialer: None,
            new_circuit_breaker: Some(Arc::new(|_address: &str| {
                Some(Box::new(CircuitBreaker::new(BreakerConfig::default())) as Box<dyn Breaker>)
            })),
            server_selector: Arc::new(Crc32Router),
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    pub fn with_max_conn_lifetime(mut self, max_conn_lifetime: Option<Duration>) -> Self {
        self.max_conn_lifetime = max_conn_lifetime;
        self
    }

    pub fn with_max_conn_idle_time(mut self, max_conn_idle_time: Option<Duration>) -> Self {
        self.max_conn_idle_time = max_conn_idle_time;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Option<Duration>) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Pass `None` to disable circuit breaker protection for every server.
    pub fn with_circuit_breaker_factory(mut self, factory: Option<BreakerFactory>) -> Self {
        self.new_circuit_breaker = factory;
        self
    }

    pub fn with_server_selector(mut self, selector: Arc<dyn ServerSelector>) -> Self {
        self.server_selector = selector;
        self
    }

    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.max_size < 1 {
            return Err(crate::error::Error::Invalid("max_size must be at least 1".to_string()));
        }
        if self.servers.is_empty() {
            return Err(crate::error::Error::Invalid("at least one server is required".to_string()));
        }
        Ok(())
    }
}

const DEFAULT_PORT: u16 = 11211;

/// Resolves a server address string into a dialable `host:port`.
///
/// Accepts bare `host:port` or a `tcp://host:port` DSN (no `unix://` branch,
/// since this crate's `Connection` has no Unix-socket path to route it to);
/// a bare host with no port defaults to memcached's standard port.
pub fn resolve_address(addr: &str) -> Result<String, crate::error::Error> {
    if let Ok(url) = url::Url::parse(addr) {
        if url.scheme() == "tcp" {
            let host = url
                .host_str()
                .ok_or_else(|| crate::error::Error::Invalid(format!("no host in address {addr:?}")))?;
            return Ok(format!("{host}:{}", url.port().unwrap_or(DEFAULT_PORT)));
        }
    }

    if addr.contains(':') {
        return Ok(addr.to_string());
    }

    Ok(format!("{addr}:{DEFAULT_PORT}"))
}
