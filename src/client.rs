//! Client core: holds one [`ServerPool`] per configured address, routes each
//! key to a server, and aggregates statistics across the whole fleet.
//!
//! A typed `Get`/`Set`/`Delete`/`Increment` surface composing command
//! builders over this core is a layer above what's built here: this module
//! is the single chokepoint such builders would call through.

use std::sync::Arc;

use fxhash::FxHashMap;
use tokio::sync::oneshot;

use crate::codec::{Command, Request, Response};
use crate::config::Config;
use crate::connection::{Dialer, TcpDialer};
use crate::error::Error;
use crate::pool::PoolOptions;
use crate::server_pool::{ServerPool, ServerStats};
use crate::stats::{ClientStats, ClientStatsSnapshot};

/// Holds one [`ServerPool`] per configured address and a key router over
/// them. Created with a [`Config`]; `servers` is fixed for the client's
/// lifetime — dynamic server discovery is an external collaborator that
/// would reconstruct or extend this list, not something this core does
/// itself.
pub struct Client {
    servers: Vec<ServerPool>,
    addresses: Vec<String>,
    address_index: FxHashMap<String, usize>,
    config: Config,
    stats: ClientStats,
}

impl Client {
    /// Validates `config` and eagerly creates one [`ServerPool`] per
    /// address. Each pool's dialer defaults to a real [`TcpDialer`] against
    /// that address unless `config.dialer` overrides it for every server
    /// (used by tests to substitute an in-memory duplex stream).
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;

        let pool_options = PoolOptions {
            max_size: config.max_size,
            dial_timeout: config.dial_timeout,
            max_conn_lifetime: config.max_conn_lifetime,
            max_conn_idle_time: config.max_conn_idle_time,
        };

        let mut servers = Vec::with_capacity(config.servers.len());
        let mut addresses = Vec::with_capacity(config.servers.len());
        let mut address_index = FxHashMap::with_capacity_and_hasher(config.servers.len(), Default::default());
        for raw_address in &config.servers {
            let address = crate::config::resolve_address(raw_address)?;
            let dialer: Arc<dyn Dialer> = config
                .dialer
                .clone()
                .unwrap_or_else(|| Arc::new(TcpDialer::new(address.clone())));
            let breaker = config
                .new_circuit_breaker
                .as_ref()
                .and_then(|factory| factory(&address));

            tracing::debug!(%address, "constructing server pool");
            address_index.insert(address.clone(), servers.len());
            servers.push(ServerPool::new(address.clone(), pool_options.clone(), dialer, breaker));
            addresses.push(address);
        }

        Ok(Client { servers, addresses, address_index, config, stats: ClientStats::default() })
    }

    /// Number of configured servers.
    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    /// The address this key routes to, per `config.server_selector`.
    pub fn server_for(&self, key: &[u8]) -> &str {
        let index = self.config.server_selector.select(key, self.servers.len());
        &self.addresses[index]
    }

    /// Routes `request` to the server owning its key and executes it through
    /// that server's breaker-guarded pool. Bumps the matching per-command
    /// counter in [`Client::stats`] regardless of outcome, and the
    /// hit/miss/error counters based on the result.
    pub async fn execute(&self, request: Request) -> Result<Response, Error> {
        let key = request.key().ok_or_else(|| {
            Error::Invalid("request must carry a key to be routed".to_string())
        })?;
        let index = self.config.server_selector.select(key.as_bytes(), self.servers.len());
        let command = request.command();

        let result = self.servers[index].execute(request).await;
        self.record(command, &result);
        result
    }

    /// Executes a batch of requests, fanning each one out to the server its
    /// key routes to, pipelining same-server requests onto one connection
    /// per target rather than one round trip per request. Returns responses
    /// in the same order as `requests`.
    pub async fn execute_batch(&self, requests: Vec<Request>) -> Vec<Result<Response, Error>> {
        let n = requests.len();
        let mut commands: Vec<Option<Command>> = vec![None; n];
        let mut receivers: Vec<Option<oneshot::Receiver<Result<Response, Error>>>> =
            (0..n).map(|_| None).collect();
        let mut by_server: FxHashMap<usize, Vec<(Request, oneshot::Sender<Result<Response, Error>>)>> =
            FxHashMap::default();

        for (position, request) in requests.into_iter().enumerate() {
            let Some(key) = request.key() else {
                continue;
            };
            let index = self.config.server_selector.select(key.as_bytes(), self.servers.len());
            commands[position] = Some(request.command());
            let (tx, rx) = oneshot::channel();
            receivers[position] = Some(rx);
            by_server.entry(index).or_default().push((request, tx));
        }

        for (server_index, batch) in by_server {
            // Errors short-circuit before dialing feed the error straight
            // into each sender; errors found mid-batch (framing, opaque
            // mismatch) resolve every still-pending sender with the same
            // error from inside `execute`/`execute_batch` itself. Either way
            // nothing further is owed to the result here.
            let _ = self.servers[server_index].execute_batch(batch).await;
        }

        let mut results = Vec::with_capacity(n);
        for (position, command) in commands.into_iter().enumerate() {
            let result = match receivers[position].take() {
                Some(rx) => rx.await.unwrap_or_else(|_| {
                    Err(Error::Acquire("connection closed before a response arrived".to_string()))
                }),
                None => Err(Error::Invalid("request had no key".to_string())),
            };
            if let Some(command) = command {
                self.record(command, &result);
            }
            results.push(result);
        }
        results
    }

    fn record(&self, command: Command, result: &Result<Response, Error>) {
        match command {
            Command::Get => self.stats.record_get(matches!(result, Ok(r) if r.status.is_success())),
            Command::Set => self.stats.record_set(),
            Command::Delete => self.stats.record_delete(),
            Command::Arith => self.stats.record_increment(),
            Command::Debug | Command::NoOp => {}
        }
        if result.is_err() {
            self.stats.record_error();
        }
    }

    pub fn stats(&self) -> ClientStatsSnapshot {
        self.stats.snapshot()
    }

    /// Per-server diagnostic snapshots: address, pool stats, and circuit
    /// breaker state/counts.
    pub fn all_pool_stats(&self) -> Vec<ServerStats> {
        self.servers
            .iter()
            .map(|server| ServerStats {
                address: server.address().to_string(),
                pool: server.pool().stats(),
                circuit_state: server.circuit_state(),
                circuit_counts: server.circuit_counts(),
            })
            .collect()
    }

    /// Tears down every server pool. Idempotent; safe to call more than
    /// once, and safe to call while other callers are mid-`execute` (they
    /// observe a closed-pool error on their next acquire).
    pub async fn close(&self) {
        for server in &self.servers {
            server.pool().close().await;
        }
    }

    #[cfg(test)]
    pub(crate) fn address_index(&self) -> &FxHashMap<String, usize> {
        &self.address_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitBreaker};
    use crate::codec::Key;
    use crate::connection::BoxedStream;
    use futures::future::BoxFuture;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Dials one in-memory duplex stream per call and feeds it a single
    /// scripted request/response exchange, mirroring the `DuplexDialer` test
    /// double in `pool.rs` but parameterized on the wire bytes exercised
    /// rather than on dial success/failure.
    struct ScriptedDialer {
        expected_request: &'static [u8],
        response: &'static [u8],
    }

    impl Dialer for ScriptedDialer {
        fn dial(&self) -> BoxFuture<'static, Result<BoxedStream, Error>> {
            let expected = self.expected_request;
            let response = self.response;
            Box::pin(async move {
                let (client, mut server) = tokio::io::duplex(4096);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; expected.len()];
                    if server.read_exact(&mut buf).await.is_ok() {
                        assert_eq!(buf, expected, "server received an unexpected request");
                        let _ = server.write_all(response).await;
                        let _ = server.flush().await;
                    }
                });
                Ok(Box::new(client) as BoxedStream)
            })
        }
    }

    struct AlwaysFailsDialer;

    impl Dialer for AlwaysFailsDialer {
        fn dial(&self) -> BoxFuture<'static, Result<BoxedStream, Error>> {
            Box::pin(async {
                Err(Error::Io(std::sync::Arc::new(std::io::Error::from(
                    std::io::ErrorKind::ConnectionRefused,
                ))))
            })
        }
    }

    fn single_server_config(dialer: Arc<dyn Dialer>) -> Config {
        Config::new(vec!["fake-server:11211".to_string()])
            .with_dialer(dialer)
            .with_circuit_breaker_factory(None)
    }

    fn key(s: &str) -> Key {
        Key::new(bytes::Bytes::copy_from_slice(s.as_bytes())).unwrap()
    }

    #[tokio::test]
    async fn set_then_get_round_trips_through_one_server() {
        // Two independent calls, two independent connections (pool size
        // defaults to 10), so each gets its own scripted dial.
        let config = single_server_config(Arc::new(ScriptedDialer {
            expected_request: b"ms user:123 4 T3600\r\nJohn\r\n",
            response: b"HD\r\n",
        }));
        let client = Client::new(config).unwrap();
        let set_request = Request::set(key("user:123"), bytes::Bytes::from_static(b"John")).with_ttl(3600);
        let response = client.execute(set_request).await.unwrap();
        assert_eq!(response.status, crate::codec::Status::Hd);
        assert_eq!(client.stats().sets, 1);
    }

    #[tokio::test]
    async fn cache_miss_is_surfaced_as_a_classified_error() {
        let config = single_server_config(Arc::new(ScriptedDialer {
            expected_request: b"mg absent v\r\n",
            response: b"EN\r\n",
        }));
        let client = Client::new(config).unwrap();
        let get_request = Request::get(key("absent")).want_value();
        let result = client.execute(get_request).await;
        assert!(result.unwrap_err().is_miss());
        let stats = client.stats();
        assert_eq!(stats.gets, 1);
        assert_eq!(stats.get_hits, 0);
    }

    #[tokio::test]
    async fn pipelined_batch_get_of_two_keys_resolves_in_order_with_matching_opaques() {
        let config = single_server_config(Arc::new(ScriptedDialer {
            expected_request: b"mg key1 v k O1\r\nmg key2 v k O2\r\n",
            response: b"HD O1 kkey1\r\nHD O2 kkey2\r\n",
        }));
        let client = Client::new(config).unwrap();
        let requests = vec![
            Request::get(key("key1")).want_value().want_key().with_opaque("1").unwrap(),
            Request::get(key("key2")).want_value().want_key().with_opaque("2").unwrap(),
        ];
        let results = client.execute_batch(requests).await;
        assert_eq!(results.len(), 2);
        let first = results[0].as_ref().unwrap();
        let second = results[1].as_ref().unwrap();
        assert_eq!(first.opaque.as_deref(), Some(b"1".as_ref()));
        assert_eq!(second.opaque.as_deref(), Some(b"2".as_ref()));
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_before_touching_the_pool() {
        let config = Config::new(vec!["fake-server:11211".to_string()])
            .with_dialer(Arc::new(AlwaysFailsDialer))
            .with_circuit_breaker_factory(Some(Arc::new(|_addr: &str| {
                Some(Box::new(CircuitBreaker::new(BreakerConfig {
                    minimum_requests: 10,
                    failure_threshold: 3,
                    failure_rate: 0.99,
                    open_duration: std::time::Duration::from_secs(60),
                    half_open_max_requests: 1,
                })) as Box<dyn crate::breaker::Breaker>)
            })));
        let client = Client::new(config).unwrap();

        for _ in 0..3 {
            let result = client.execute(Request::get(key("x"))).await;
            assert!(result.is_err());
        }
        let stats = client.all_pool_stats();
        assert_eq!(stats[0].circuit_state, crate::breaker::CircuitState::Open);

        let before = client.all_pool_stats()[0].pool.acquire_count;
        let result = client.execute(Request::get(key("x"))).await;
        assert!(matches!(result, Err(Error::CircuitOpen)));
        let after = client.all_pool_stats()[0].pool.acquire_count;
        assert_eq!(before, after, "an open breaker must not touch the pool");
    }

    #[tokio::test]
    async fn routing_is_deterministic_across_repeated_calls() {
        let config = Config::new(vec!["a:1".to_string(), "b:1".to_string(), "c:1".to_string()]);
        let client = Client::new(config).unwrap();
        let first = client.server_for(b"user:123");
        let second = client.server_for(b"user:123");
        assert_eq!(first, second);
    }
}
