//! Upstream connection pool
//!
//! Each upstream gets a pool of reusable TLS connections. Connections are
//! dialed lazily, returned to the idle set after a clean exchange, and
//! closed on any failure. A semaphore bounds the number of live
//! connections; once the cap is reached, callers wait for a return.

use crate::config::Upstream;
use crate::error::{DnsError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Byte stream carrying one upstream session.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

/// Boxed connection as stored in the pool.
pub type BoxConn = Box<dyn Conn>;

/// Dialer for one upstream.
#[async_trait]
pub trait Connect: Send + Sync {
    async fn connect(&self) -> Result<BoxConn>;
}

/// TLS dialer for a DNS-over-TLS upstream.
///
/// The TCP connection targets `dial_addr`; SNI and certificate
/// verification use the configured server name. TLS 1.2 is the minimum
/// accepted version.
pub struct TlsConnect {
    dial_addr: String,
    server_name: ServerName<'static>,
    connector: TlsConnector,
}

impl TlsConnect {
    pub fn new(upstream: &Upstream) -> Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = rustls::ClientConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS12,
            &rustls::version::TLS13,
        ])
        .with_root_certificates(roots)
        .with_no_client_auth();

        let server_name = ServerName::try_from(upstream.server_name.clone())
            .map_err(|_| DnsError::InvalidUpstreamAddress(upstream.server_name.clone()))?;

        Ok(Self {
            dial_addr: upstream.dial_addr.clone(),
            server_name,
            connector: TlsConnector::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl Connect for TlsConnect {
    async fn connect(&self) -> Result<BoxConn> {
        let tcp = TcpStream::connect(&self.dial_addr).await.map_err(|e| {
            warn!("failed to dial {}: {}", self.dial_addr, e);
            DnsError::Dial(format!("{}: {}", self.dial_addr, e))
        })?;
        let tls = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| {
                warn!("TLS handshake with {} failed: {}", self.dial_addr, e);
                DnsError::Tls(format!("{}: {}", self.dial_addr, e))
            })?;
        Ok(Box::new(tls))
    }
}

/// A connection checked out of a pool.
///
/// Holds the permit that counts it against the pool cap; dropping the
/// value closes the connection and frees the slot.
pub struct PooledConn {
    stream: BoxConn,
    _permit: OwnedSemaphorePermit,
}

impl std::ops::Deref for PooledConn {
    type Target = BoxConn;
    fn deref(&self) -> &BoxConn {
        &self.stream
    }
}

impl std::ops::DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut BoxConn {
        &mut self.stream
    }
}

/// Pool of live connections to one upstream.
pub struct Pool {
    connector: Arc<dyn Connect>,
    idle: Mutex<Vec<BoxConn>>,
    permits: Arc<Semaphore>,
}

impl Pool {
    pub fn new(max: usize, connector: Arc<dyn Connect>) -> Self {
        Self {
            connector,
            idle: Mutex::new(Vec::with_capacity(max)),
            permits: Arc::new(Semaphore::new(max)),
        }
    }

    /// Check a connection out of the pool.
    ///
    /// Reuses an idle connection when one exists, dials otherwise, and
    /// waits when the pool is at capacity. A failed dial does not consume
    /// a slot. Fails with [`DnsError::PoolClosed`] after [`shutdown`].
    ///
    /// [`shutdown`]: Pool::shutdown
    pub async fn acquire(&self) -> Result<PooledConn> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DnsError::PoolClosed)?;

        if let Some(stream) = self.idle.lock().pop() {
            return Ok(PooledConn {
                stream,
                _permit: permit,
            });
        }

        // Dial while holding the permit so the live count stays bounded;
        // the permit is dropped with the error on failure.
        let stream = self.connector.connect().await?;
        Ok(PooledConn {
            stream,
            _permit: permit,
        })
    }

    /// Return a healthy connection to the idle set.
    pub fn release(&self, conn: PooledConn) {
        if self.permits.is_closed() {
            return;
        }
        self.idle.lock().push(conn.stream);
    }

    /// Close and drop a connection after a failure.
    pub fn discard(&self, conn: PooledConn) {
        drop(conn);
    }

    /// Close all idle connections and fail pending and future acquires.
    pub fn shutdown(&self) {
        self.permits.close();
        self.idle.lock().clear();
        debug!("pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use tokio::time::Duration;

    /// Connection that reports its death, so tests can track liveness.
    struct TrackedConn {
        inner: tokio::io::DuplexStream,
        live: Arc<AtomicUsize>,
    }

    impl Drop for TrackedConn {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl AsyncRead for TrackedConn {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for TrackedConn {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }
        fn poll_flush(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }
        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    #[derive(Default)]
    struct FakeConnect {
        dials: AtomicUsize,
        live: Arc<AtomicUsize>,
        peak: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Connect for FakeConnect {
        async fn connect(&self) -> Result<BoxConn> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(DnsError::Dial("refused".into()));
            }
            self.dials.fetch_add(1, Ordering::SeqCst);
            let now_live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now_live, Ordering::SeqCst);
            let (a, _b) = tokio::io::duplex(64);
            Ok(Box::new(TrackedConn {
                inner: a,
                live: self.live.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_release_enables_reuse() {
        let connector = Arc::new(FakeConnect::default());
        let pool = Pool::new(5, connector.clone());

        let conn = pool.acquire().await.unwrap();
        pool.release(conn);
        let conn = pool.acquire().await.unwrap();
        pool.release(conn);

        assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_acquire_blocks_at_capacity() {
        let connector = Arc::new(FakeConnect::default());
        let pool = Arc::new(Pool::new(2, connector));

        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();

        let waiter = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(waiter.is_err(), "third acquire should wait at capacity");

        pool.release(a);
        let c = tokio::time::timeout(Duration::from_millis(100), pool.acquire())
            .await
            .expect("acquire should proceed after release")
            .unwrap();
        pool.discard(c);
    }

    #[tokio::test]
    async fn test_failed_dial_frees_slot() {
        let connector = Arc::new(FakeConnect {
            fail: AtomicBool::new(true),
            ..Default::default()
        });
        let pool = Pool::new(1, connector.clone());

        assert!(matches!(pool.acquire().await, Err(DnsError::Dial(_))));

        connector.fail.store(false, Ordering::SeqCst);
        let conn = tokio::time::timeout(Duration::from_millis(100), pool.acquire())
            .await
            .expect("failed dial must not consume the slot")
            .unwrap();
        pool.release(conn);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_and_future_acquires() {
        let connector = Arc::new(FakeConnect::default());
        let pool = Arc::new(Pool::new(1, connector));

        let held = pool.acquire().await.unwrap();
        let pending = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::task::yield_now().await;

        pool.shutdown();
        assert!(matches!(pending.await.unwrap(), Err(DnsError::PoolClosed)));
        assert!(matches!(pool.acquire().await, Err(DnsError::PoolClosed)));
        pool.discard(held);
    }

    #[tokio::test]
    async fn test_live_count_bounded_under_stress() {
        let connector = Arc::new(FakeConnect::default());
        let pool = Arc::new(Pool::new(3, connector.clone()));

        let mut tasks = Vec::new();
        for i in 0..24u32 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let conn = pool.acquire().await.unwrap();
                tokio::task::yield_now().await;
                if i % 3 == 0 {
                    pool.discard(conn);
                } else {
                    pool.release(conn);
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        assert!(
            connector.peak.load(Ordering::SeqCst) <= 3,
            "live connections exceeded the cap"
        );
        pool.shutdown();
        assert_eq!(connector.live.load(Ordering::SeqCst), 0);
    }
}
