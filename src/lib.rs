//! The request/response engine for a memcached *meta* text protocol client:
//! per-server connection pooling, pipelined per-connection framing with
//! opaque-token matching, a circuit-breaker-guarded server pool, and a
//! deterministic key router.
//!
//! The typed `Get`/`Set`/`Delete`/`Increment` surface over semantic `Item`s,
//! dynamic server discovery, configuration loading from a file/env, and
//! metrics export are external collaborators this crate does not implement —
//! see the module docs on [`client`] for the one chokepoint they'd call
//! through.

pub mod breaker;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod router;
pub mod server_pool;
pub mod stats;

pub use breaker::{Breaker, BreakerConfig, BreakerCounts, CircuitBreaker, CircuitState};
pub use client::Client;
pub use codec::{Command, Key, Request, Response, Status};
pub use config::Config;
pub use connection::{AsyncStream, BoxedStream, Dialer, TcpDialer};
pub use error::Error;
pub use pool::{Pool, PoolOptions, PooledConnection};
pub use router::{Crc32Router, RingRouter, ServerSelector};
pub use server_pool::{ServerPool, ServerStats};
pub use stats::{ClientStats, ClientStatsSnapshot, PoolStats, PoolStatsSnapshot};
