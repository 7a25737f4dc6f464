//! A single framed connection to one memcached server: pipelined request
//! submission over a shared stream, with a background-free read loop that
//! drives responses back to their callers by matching opaque tokens.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::BytesMut;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::codec::parser::{parse_response, Response};
use crate::codec::request::Request;
use crate::error::Error;

/// Anything a [`Connection`] can be built over: a live socket in production,
/// an in-memory duplex stream in tests.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens new transport streams to a server address. Exists so tests can
/// substitute an in-process duplex stream without touching a real socket.
pub trait Dialer: Send + Sync {
    fn dial(&self) -> BoxFuture<'static, Result<BoxedStream, Error>>;
}

/// Dials real TCP connections, with `TCP_NODELAY` set so small pipelined
/// frames aren't held back by Nagle's algorithm.
#[derive(Clone, Debug)]
pub struct TcpDialer {
    addr: String,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>) -> Self {
        TcpDialer { addr: addr.into() }
    }
}

impl Dialer for TcpDialer {
    fn dial(&self) -> BoxFuture<'static, Result<BoxedStream, Error>> {
        let addr = self.addr.clone();
        Box::pin(async move {
            let stream = TcpStream::connect(&addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

/// A pipelined request batch: one or more requests carrying distinct opaque
/// tokens, each paired with a one-shot sender for its response.
pub struct PendingRequest {
    pub opaque: Vec<u8>,
    pub reply_to: oneshot::Sender<Result<Response, Error>>,
}

/// A live connection to one memcached server.
///
/// Requests are written eagerly as they're submitted; [`Connection::execute`]
/// then drives the shared read buffer forward, matching each parsed response
/// against the batch's opaque tokens in order, since the meta protocol
/// guarantees in-order replies for a pipelined request stream.
pub struct Connection {
    stream: BoxedStream,
    buf: BytesMut,
    /// Set once a framing error, opaque mismatch, or I/O error has occurred.
    /// A poisoned connection is never handed back to a pool as idle.
    poisoned: bool,
    created_at: Instant,
    last_used_at: Instant,
}

impl Connection {
    pub async fn dial(dialer: &dyn Dialer) -> Result<Self, Error> {
        let stream = dialer.dial().await?;
        let now = Instant::now();
        Ok(Connection {
            stream,
            buf: BytesMut::with_capacity(4096),
            poisoned: false,
            created_at: now,
            last_used_at: now,
        })
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Refreshes the last-used timestamp without performing I/O; called by
    /// the pool on a full `release` (as opposed to `release_unused`).
    pub(crate) fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }

    /// Writes a single request and reads back exactly one response. This is
    /// the degenerate, unpipelined case of [`Connection::execute`]; most
    /// callers that issue several requests at once should prefer batching
    /// through `execute` so replies are matched against opaque tokens rather
    /// than assumed to arrive one-for-one with no interleaving risk.
    pub async fn send(&mut self, request: &Request) -> Result<Response, Error> {
        self.write_request(request).await?;
        self.last_used_at = Instant::now();
        match self.read_one().await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }

    /// Writes every request in `batch` back to back, then reads responses
    /// off the wire and delivers each to the waiter whose opaque token it
    /// matches, in the order both were submitted. A mismatched or unparsable
    /// opaque token poisons the connection: the stream is no longer
    /// trustworthy and every remaining waiter is failed with the same error.
    pub async fn execute(&mut self, batch: Vec<(Request, PendingRequest)>) -> Result<(), Error> {
        for (request, _) in &batch {
            self.write_request(request).await?;
        }
        self.last_used_at = Instant::now();

        let mut waiters: VecDeque<PendingRequest> = batch.into_iter().map(|(_, p)| p).collect();
        let result = self.drive_batch(&mut waiters).await;
        if let Err(e) = &result {
            self.poisoned = true;
            for waiter in waiters {
                let _ = waiter.reply_to.send(Err(e.clone()));
            }
        }
        result
    }

    async fn drive_batch(&mut self, waiters: &mut VecDeque<PendingRequest>) -> Result<(), Error> {
        while let Some(waiter) = waiters.pop_front() {
            let response = self.read_one().await?;
            if let Some(opaque) = response.opaque.as_deref() {
                if opaque != waiter.opaque.as_slice() {
                    return Err(Error::Protocol(format!(
                        "opaque mismatch: expected {:?}, got {:?}",
                        String::from_utf8_lossy(&waiter.opaque),
                        String::from_utf8_lossy(opaque)
                    )));
                }
            }
            let _ = waiter.reply_to.send(Ok(response));
        }
        Ok(())
    }

    async fn write_request(&mut self, request: &Request) -> Result<(), Error> {
        let result = request.write_to(&mut self.stream).await;
        if result.is_err() {
            self.poisoned = true;
        }
        result?;
        self.stream.flush().await.map_err(|e| {
            self.poisoned = true;
            Error::Io(std::sync::Arc::new(e))
        })
    }

    /// Advances past the previously consumed bytes, then loops reading into
    /// the buffer until a full response parses out of it.
    async fn read_one(&mut self) -> Result<Response, Error> {
        loop {
            match parse_response(&self.buf)? {
                Some((n, response)) => {
                    let _ = self.buf.split_to(n);
                    return Ok(response);
                }
                None => {
                    self.buf.reserve(4096);
                    let n = self.stream.read_buf(&mut self.buf).await?;
                    if n == 0 {
                        return Err(Error::Io(std::sync::Arc::new(std::io::Error::from(
                            std::io::ErrorKind::UnexpectedEof,
                        ))));
                    }
                }
            }
        }
    }
}
