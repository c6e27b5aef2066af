//! Socket accounting for connection setup
//!
//! Every socket a transport opens is registered here so it can be counted,
//! inventoried and force-closed. Registration hands back a [`SocketLease`]
//! that removes the entry when dropped, so an attempt cannot leak entries on
//! any exit path.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::debug;

/// Which hop of a connection a socket belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketRole {
    /// Connection to the upstream proxy itself (plain TCP or TLS)
    ProxyHop,
    /// Raw stream after a successful CONNECT
    Tunnel,
    /// TLS session to the real target, layered over a tunnel
    TargetTls,
}

/// Provenance of a registered socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketLabel {
    pub origin: &'static str,
    pub role: SocketRole,
}

impl SocketLabel {
    pub const fn new(origin: &'static str, role: SocketRole) -> Self {
        Self { origin, role }
    }
}

impl std::fmt::Display for SocketLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:?}", self.origin, self.role)
    }
}

#[derive(Debug)]
struct SocketEntry {
    label: SocketLabel,
    opened_at: Instant,
    close: CancellationToken,
}

#[derive(Debug, Default)]
struct RegistryInner {
    sockets: DashMap<u64, SocketEntry>,
    next_id: AtomicU64,
}

/// Concurrent set of live sockets, shared by every attempt that uses it
#[derive(Clone, Default)]
pub struct SocketRegistry {
    inner: Arc<RegistryInner>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket and get the lease that keeps it registered
    pub fn add(&self, label: SocketLabel) -> SocketLease {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let close = CancellationToken::new();
        self.inner.sockets.insert(
            id,
            SocketEntry {
                label,
                opened_at: Instant::now(),
                close: close.clone(),
            },
        );
        debug!(socket_id = id, label = %label, "Socket registered");

        SocketLease {
            id,
            inner: self.inner.clone(),
            close,
            released: false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sockets.is_empty()
    }

    pub fn labels(&self) -> Vec<SocketLabel> {
        self.inner.sockets.iter().map(|e| e.label).collect()
    }

    pub fn count_by_role(&self, role: SocketRole) -> usize {
        self.inner
            .sockets
            .iter()
            .filter(|e| e.label.role == role)
            .count()
    }

    /// Age of the oldest live socket
    pub fn oldest_age(&self) -> Option<Duration> {
        self.inner
            .sockets
            .iter()
            .map(|e| e.opened_at.elapsed())
            .max()
    }

    /// Force-close one socket. Returns false if it is not registered.
    pub fn close(&self, id: u64) -> bool {
        match self.inner.sockets.get(&id) {
            Some(entry) => {
                entry.close.cancel();
                true
            }
            None => false,
        }
    }

    /// Force-close every live socket, returning how many were signalled
    pub fn close_all(&self) -> usize {
        let mut count = 0;
        for entry in self.inner.sockets.iter() {
            entry.close.cancel();
            count += 1;
        }
        debug!(count, "Force-closing registered sockets");
        count
    }
}

impl std::fmt::Debug for SocketRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketRegistry")
            .field("live", &self.len())
            .finish()
    }
}

/// Registration of one socket; dropping it removes the registry entry
#[derive(Debug)]
pub struct SocketLease {
    id: u64,
    inner: Arc<RegistryInner>,
    close: CancellationToken,
    released: bool,
}

impl SocketLease {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Remove the entry now. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some((_, entry)) = self.inner.sockets.remove(&self.id) {
            debug!(
                socket_id = self.id,
                label = %entry.label,
                open_ms = entry.opened_at.elapsed().as_millis() as u64,
                "Socket closed"
            );
        }
    }

    fn close_requested(&self) -> WaitForCancellationFutureOwned {
        self.close.clone().cancelled_owned()
    }
}

impl Drop for SocketLease {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug)]
struct IdleTimer {
    timeout: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl IdleTimer {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sleep: Box::pin(tokio::time::sleep(timeout)),
        }
    }

    fn reset(&mut self) {
        self.sleep.as_mut().reset(Instant::now() + self.timeout);
    }
}

pin_project! {
    /// A registered socket.
    ///
    /// Stays registered until dropped, force-closed through the registry, or
    /// idle for longer than its idle timeout. A forced close releases the
    /// lease immediately and fails every further operation.
    pub struct TrackedStream<S> {
        #[pin]
        inner: S,
        lease: SocketLease,
        close_requested: Pin<Box<WaitForCancellationFutureOwned>>,
        idle: Option<IdleTimer>,
        closed: Option<io::ErrorKind>,
    }
}

impl<S> TrackedStream<S> {
    pub fn new(inner: S, lease: SocketLease) -> Self {
        let close_requested = Box::pin(lease.close_requested());
        Self {
            inner,
            lease,
            close_requested,
            idle: None,
            closed: None,
        }
    }

    /// Force-close the stream after `timeout` without any I/O progress
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.idle = Some(IdleTimer::new(timeout));
        }
        self
    }

    pub fn socket_id(&self) -> u64 {
        self.lease.id()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    fn drive<T>(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        op: impl FnOnce(Pin<&mut S>, &mut Context<'_>) -> Poll<io::Result<T>>,
    ) -> Poll<io::Result<T>> {
        let this = self.project();

        if let Some(kind) = *this.closed {
            return Poll::Ready(Err(io::Error::new(kind, "socket was force-closed")));
        }

        if this.close_requested.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(force_close(
                this.lease,
                this.closed,
                io::ErrorKind::ConnectionAborted,
            )));
        }

        match op(this.inner, cx) {
            Poll::Ready(res) => {
                if let Some(idle) = this.idle.as_mut() {
                    idle.reset();
                }
                Poll::Ready(res)
            }
            Poll::Pending => {
                if let Some(idle) = this.idle.as_mut() {
                    if idle.sleep.as_mut().poll(cx).is_ready() {
                        return Poll::Ready(Err(force_close(
                            this.lease,
                            this.closed,
                            io::ErrorKind::TimedOut,
                        )));
                    }
                }
                Poll::Pending
            }
        }
    }
}

fn force_close(
    lease: &mut SocketLease,
    closed: &mut Option<io::ErrorKind>,
    kind: io::ErrorKind,
) -> io::Error {
    debug!(socket_id = lease.id(), reason = ?kind, "Destroying socket");
    *closed = Some(kind);
    lease.release();
    io::Error::new(kind, "socket was force-closed")
}

impl<S: AsyncRead> AsyncRead for TrackedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.drive(cx, |inner, cx| inner.poll_read(cx, buf))
    }
}

impl<S: AsyncWrite> AsyncWrite for TrackedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.drive(cx, |inner, cx| inner.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.drive(cx, |inner, cx| inner.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.drive(cx, |inner, cx| inner.poll_shutdown(cx))
    }
}
