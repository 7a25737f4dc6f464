//! Shared fixtures for the integration tests in this directory.

use std::sync::Arc;

use futures::future::BoxFuture;
use meta_memcache::{BoxedStream, Dialer, Error};
use once_cell::sync::Lazy;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
});

/// Installs a `tracing` subscriber the first time any test calls this,
/// so pool/connection/breaker log lines surface under `RUST_LOG` instead
/// of being silently dropped (no subscriber means `tracing` is a no-op).
pub fn init_tracing() {
    Lazy::force(&TRACING);
}

/// A dialer whose server end answers every request it reads with `HD\r\n`,
/// regardless of content. Used by load tests that exercise pool acquire
/// machinery and don't care about exact wire framing.
struct AlwaysOkDialer;

impl Dialer for AlwaysOkDialer {
    fn dial(&self) -> BoxFuture<'static, Result<BoxedStream, Error>> {
        Box::pin(async move {
            let (client, mut server) = tokio::io::duplex(4096);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match server.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            if server.write_all(b"HD\r\n").await.is_err() {
                                break;
                            }
                            if server.flush().await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
            Ok(Box::new(client) as BoxedStream)
        })
    }
}

pub fn always_ok_dialer() -> Arc<dyn Dialer> {
    Arc::new(AlwaysOkDialer)
}
