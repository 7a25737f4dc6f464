//! A short value block is a framing error that poisons the connection; the
//! next acquire must dial a fresh one rather than reuse the broken stream.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use meta_memcache::{BoxedStream, Dialer, Error, Key, Pool, PoolOptions, Request};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const REQUEST_BYTES: &[u8] = b"mg k v\r\n";

/// Replies to the first connection's request with a value block whose
/// trailer is corrupt (triggers `Error::Protocol`), and to every later
/// connection with a well-formed one.
struct FlakyThenHealthyDialer {
    attempt: AtomicUsize,
}

impl Dialer for FlakyThenHealthyDialer {
    fn dial(&self) -> BoxFuture<'static, Result<BoxedStream, Error>> {
        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let (client, mut server) = tokio::io::duplex(4096);
            tokio::spawn(async move {
                let mut buf = vec![0u8; REQUEST_BYTES.len()];
                if server.read_exact(&mut buf).await.is_err() {
                    return;
                }
                let response: &[u8] =
                    if attempt == 0 { b"VA 5\r\nhell\r\n" } else { b"VA 5\r\nhello\r\n" };
                let _ = server.write_all(response).await;
                let _ = server.flush().await;
            });
            Ok(Box::new(client) as BoxedStream)
        })
    }
}

#[tokio::test]
async fn framing_desync_destroys_connection_and_next_acquire_dials_fresh() {
    common::init_tracing();
    let dialer: Arc<dyn Dialer> = Arc::new(FlakyThenHealthyDialer { attempt: AtomicUsize::new(0) });
    let pool = Pool::new(dialer, PoolOptions { max_size: 1, ..Default::default() });

    let request = Request::get(Key::new(Bytes::from_static(b"k")).unwrap()).want_value();

    let mut handle = pool.acquire(None).await.unwrap();
    let result = handle.send(&request).await;
    assert!(matches!(result, Err(Error::Protocol(_))));
    assert!(handle.is_poisoned());
    handle.destroy().await;
    assert_eq!(pool.stats().destroyed_conns, 1);

    let mut handle = pool.acquire(None).await.unwrap();
    assert_eq!(pool.stats().created_conns, 2, "a fresh connection must be dialed, not reused");
    let response = handle.send(&request).await.unwrap();
    assert_eq!(response.value.as_deref(), Some(b"hello".as_ref()));
    handle.release().await;
}
