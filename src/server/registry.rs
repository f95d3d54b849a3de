//! Connection tracking for graceful shutdown.
//!
//! The registry wraps the listening socket so that every accepted
//! connection is counted while it is open. Shutdown then becomes: stop
//! accepting, let the HTTP stack finish in-flight requests and close idle
//! keep-alive connections, and wait until the count reaches zero.
//!
//! Clients that never finish a request would hold the drain open, so it is
//! bounded by a grace period. Once it expires every remaining connection
//! fails its next read or write and is torn down by the HTTP stack.

use std::io;
use std::net::SocketAddr;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::serve::Listener;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, error, info, trace, warn};

/// Pause after an accept error that is not tied to a single connection.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Default time open connections get to finish once closing starts.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(10);

/// How long to wait for force-closed connections to go away.
const FORCE_CLOSE_WAIT: Duration = Duration::from_secs(5);

type ServerHandle = JoinHandle<io::Result<()>>;

struct Inner {
    active: AtomicUsize,
    total: AtomicU64,
    idle: Notify,
    shutdown: CancellationToken,
    force_close: CancellationToken,
    grace: Duration,
    server: Mutex<Option<ServerHandle>>,
}

/// Tracks the listener and every open connection.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_grace(DEFAULT_DRAIN_GRACE)
    }

    /// A registry whose drain force-closes connections after `grace`.
    pub fn with_grace(grace: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                active: AtomicUsize::new(0),
                total: AtomicU64::new(0),
                idle: Notify::new(),
                shutdown: CancellationToken::new(),
                force_close: CancellationToken::new(),
                grace,
                server: Mutex::new(None),
            }),
        }
    }

    /// Wrap `listener` so its connections are tracked by this registry.
    pub fn listener(&self, listener: TcpListener) -> RegisteredListener {
        RegisteredListener {
            inner: listener,
            registry: self.clone(),
        }
    }

    /// Future that completes once [`close_and_wait`](Self::close_and_wait) starts.
    ///
    /// Pass this to `axum::serve(..).with_graceful_shutdown(..)`.
    pub fn shutdown_signal(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        self.inner.shutdown.clone().cancelled_owned()
    }

    /// Hand over the task running the server so shutdown can await it.
    pub fn register_server(&self, handle: ServerHandle) {
        *self.inner.server.lock() = Some(handle);
    }

    pub fn active_connections(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Connections accepted since startup.
    pub fn total_connections(&self) -> u64 {
        self.inner.total.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop accepting, ask open connections to finish, and wait until all
    /// of them are closed.
    ///
    /// Connections still open after the grace period are force-closed. The
    /// wait after that is bounded as well, so this always returns.
    ///
    /// Safe to call more than once; later calls only wait.
    pub async fn close_and_wait(&self) {
        info!(
            active = self.active_connections(),
            grace_ms = self.inner.grace.as_millis() as u64,
            "Closing listener and draining connections"
        );
        self.inner.shutdown.cancel();

        let mut server = self.inner.server.lock().take();
        if tokio::time::timeout(self.inner.grace, self.drain(&mut server))
            .await
            .is_err()
        {
            warn!(
                active = self.active_connections(),
                "Drain grace period expired, force-closing connections"
            );
            self.inner.force_close.cancel();

            if tokio::time::timeout(FORCE_CLOSE_WAIT, self.drain(&mut server))
                .await
                .is_err()
            {
                if let Some(handle) = server.take() {
                    handle.abort();
                }
                error!(
                    active = self.active_connections(),
                    "Connections still open after force close"
                );
                return;
            }
        }
        info!(total = self.total_connections(), "All connections closed");
    }

    /// Await the server task, then wait for the connection count to hit zero.
    async fn drain(&self, server: &mut Option<ServerHandle>) {
        if let Some(handle) = server.as_mut() {
            let result = handle.await;
            *server = None;
            match result {
                Ok(Ok(())) => debug!("Server task finished"),
                Ok(Err(e)) => error!(error = %e, "Server task failed"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }

        loop {
            let idle = self.inner.idle.notified();
            if self.active_connections() == 0 {
                break;
            }
            idle.await;
        }
    }

    fn opened(&self) {
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        self.inner.total.fetch_add(1, Ordering::Relaxed);
    }

    fn closed(&self) {
        if self.inner.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

// =============================================================================
// Listener
// =============================================================================

/// A TCP listener whose accepted connections are tracked.
pub struct RegisteredListener {
    inner: TcpListener,
    registry: ConnectionRegistry,
}

/// Errors that concern only the connection being accepted.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    )
}

impl Listener for RegisteredListener {
    type Io = TrackedStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.inner.accept().await {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        trace!(error = %e, "Failed to set TCP_NODELAY");
                    }
                    self.registry.opened();
                    trace!(peer = %addr, active = self.registry.active_connections(), "Accepted connection");
                    return (TrackedStream::new(stream, self.registry.clone()), addr);
                }
                Err(e) if is_connection_error(&e) => trace!(error = %e, "Connection dropped during accept"),
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

// =============================================================================
// Tracked Stream
// =============================================================================

/// A connection that deregisters itself when dropped.
///
/// Resets and broken pipes are routine for tile clients that pan away, so
/// they are only traced; other I/O errors are logged.
pub struct TrackedStream {
    inner: TcpStream,
    registry: ConnectionRegistry,
    force_close: Pin<Box<WaitForCancellationFutureOwned>>,
    forced: bool,
}

impl TrackedStream {
    fn new(inner: TcpStream, registry: ConnectionRegistry) -> Self {
        let force_close = Box::pin(registry.inner.force_close.clone().cancelled_owned());
        Self {
            inner,
            registry,
            force_close,
            forced: false,
        }
    }

    /// Registers the waker on the force-close token and reports whether it fired.
    fn poll_forced<T>(&mut self, cx: &mut Context<'_>) -> Option<Poll<io::Result<T>>> {
        if !self.forced && self.force_close.as_mut().poll(cx).is_ready() {
            self.forced = true;
        }
        self.forced.then(|| {
            Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection force-closed on shutdown",
            )))
        })
    }
}

fn observe<T>(result: Poll<io::Result<T>>) -> Poll<io::Result<T>> {
    if let Poll::Ready(Err(e)) = &result {
        match e.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionAborted => {
                trace!(error = %e, "Connection reset by peer")
            }
            _ => warn!(error = %e, "Connection I/O error"),
        }
    }
    result
}

impl AsyncRead for TrackedStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(forced) = this.poll_forced(cx) {
            return forced;
        }
        observe(Pin::new(&mut this.inner).poll_read(cx, buf))
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(forced) = this.poll_forced(cx) {
            return forced;
        }
        observe(Pin::new(&mut this.inner).poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(forced) = this.poll_forced(cx) {
            return forced;
        }
        observe(Pin::new(&mut this.inner).poll_flush(cx))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        observe(Pin::new(&mut self.inner).poll_shutdown(cx))
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(forced) = this.poll_forced(cx) {
            return forced;
        }
        observe(Pin::new(&mut this.inner).poll_write_vectored(cx, bufs))
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.registry.closed();
        trace!(active = self.registry.active_connections(), "Connection closed");
    }
}
