//! One server: a connection pool guarded by a circuit breaker.

use crate::breaker::{Breaker, BreakerCounts, CircuitState};
use crate::codec::{Request, Response};
use crate::connection::PendingRequest;
use crate::error::Error;
use crate::pool::{Pool, PoolOptions};
use crate::stats::PoolStatsSnapshot;
use tokio::sync::oneshot;

/// Diagnostic snapshot for one server, returned by
/// [`crate::client::Client::all_pool_stats`].
#[derive(Clone, Debug)]
pub struct ServerStats {
    pub address: String,
    pub pool: PoolStatsSnapshot,
    pub circuit_state: CircuitState,
    pub circuit_counts: BreakerCounts,
}

/// Composes one [`Pool`] with an optional circuit breaker under one server
/// address. Lifetime equals the client core's lifetime for this address.
pub struct ServerPool {
    address: String,
    pool: Pool,
    breaker: Option<Box<dyn Breaker>>,
}

impl ServerPool {
    pub fn new(address: String, pool_options: PoolOptions, dialer: std::sync::Arc<dyn crate::connection::Dialer>, breaker: Option<Box<dyn Breaker>>) -> Self {
        ServerPool { address, pool: Pool::new(dialer, pool_options), breaker }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// `closed` when no breaker is configured for this server.
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.as_ref().map(|b| b.state()).unwrap_or(CircuitState::Closed)
    }

    pub fn circuit_counts(&self) -> BreakerCounts {
        self.breaker.as_ref().map(|b| b.counts()).unwrap_or_default()
    }

    /// Guarded single-request execution. If a breaker is configured and
    /// open, returns `Error::CircuitOpen` without touching the pool.
    pub async fn execute(&self, request: Request) -> Result<Response, Error> {
        match &self.breaker {
            Some(breaker) => breaker.execute(Box::pin(self.direct(request))).await,
            None => self.direct(request).await,
        }
    }

    /// Guarded pipelined batch execution: acquires one connection and
    /// drives the whole batch over it, releasing or destroying the
    /// connection once per batch rather than once per request.
    ///
    /// The breaker's `execute` contract is built around one request at a
    /// time, so a batch can't be threaded through it directly; an open
    /// breaker still short-circuits the whole batch here, just without
    /// feeding the outcome back into the breaker's own windowed accounting
    /// the way a single `execute` call would.
    pub async fn execute_batch(&self, batch: Vec<(Request, oneshot::Sender<Result<Response, Error>>)>) -> Result<(), Error> {
        if self.circuit_state() == crate::breaker::CircuitState::Open {
            for (_, reply_to) in batch {
                let _ = reply_to.send(Err(Error::CircuitOpen));
            }
            return Err(Error::CircuitOpen);
        }

        let mut handle = self.pool.acquire(None).await?;
        let pending: Vec<(Request, PendingRequest)> = batch
            .into_iter()
            .map(|(request, reply_to)| {
                let opaque = request.opaque().map(|b| b.to_vec()).unwrap_or_default();
                (request, PendingRequest { opaque, reply_to })
            })
            .collect();
        let result = handle.execute(pending).await;
        if result.is_err() || handle.is_poisoned() {
            handle.destroy().await;
        } else {
            handle.release().await;
        }
        result
    }

    async fn direct(&self, request: Request) -> Result<Response, Error> {
        let mut handle = self.pool.acquire(None).await?;
        let response = handle.send(&request).await;
        match response {
            Ok(response) => {
                handle.release().await;
                Ok(response)
            }
            Err(e) => {
                if e.poisons_connection() {
                    handle.destroy().await;
                } else {
                    handle.release().await;
                }
                Err(e)
            }
        }
    }
}
