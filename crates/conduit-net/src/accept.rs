//! Listener abstraction and the accept loop's retry-with-backoff primitive.
//!
//! Transient accept failures (aborted handshakes, descriptor exhaustion, ...)
//! are retried forever with exponentially growing sleeps: 5 ms, 10 ms, 20 ms,
//! doubling up to a 1 s cap. Anything else is returned to the caller. Once the
//! server's shutdown signal fires, [`accept`] reports a clean end of stream.

use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::signal;

/// A source of incoming connections.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// The accepted connection type.
    type Stream: Send + 'static;
    /// Peer / local address type.
    type Addr: fmt::Debug + Clone + Send + Sync + 'static;

    /// Wait for the next connection.
    async fn accept(&self) -> io::Result<(Self::Stream, Self::Addr)>;

    /// The address this listener is bound to.
    fn local_addr(&self) -> io::Result<Self::Addr>;
}

#[async_trait]
impl Listener for TcpListener {
    type Stream = TcpStream;
    type Addr = std::net::SocketAddr;

    async fn accept(&self) -> io::Result<(TcpStream, std::net::SocketAddr)> {
        let (stream, peer) = TcpListener::accept(self).await?;
        if let Err(err) = stream.set_nodelay(true) {
            tracing::warn!(?peer, error = %err, "failed to set TCP_NODELAY");
        }
        Ok((stream, peer))
    }

    fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        TcpListener::local_addr(self)
    }
}

#[cfg(unix)]
#[async_trait]
impl Listener for tokio::net::UnixListener {
    type Stream = tokio::net::UnixStream;
    type Addr = tokio::net::unix::SocketAddr;

    async fn accept(&self) -> io::Result<(Self::Stream, Self::Addr)> {
        tokio::net::UnixListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        tokio::net::UnixListener::local_addr(self)
    }
}

/// Backoff bounds for transient accept errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay before the first retry. Default: 5 ms.
    pub initial: Duration,
    /// Upper bound on any single delay. Default: 1 s.
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(5),
            max: Duration::from_secs(1),
        }
    }
}

/// Doubling delay sequence for one run of consecutive transient errors.
#[derive(Debug)]
pub struct AcceptBackoff {
    config: BackoffConfig,
    current: Option<Duration>,
}

impl AcceptBackoff {
    /// Start a fresh sequence.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current: None,
        }
    }

    /// The delay to sleep before the next retry.
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.config.initial,
            Some(delay) => delay.saturating_mul(2),
        };
        let next = next.min(self.config.max);
        self.current = Some(next);
        next
    }
}

/// Whether an accept error is worth retrying.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || is_descriptor_exhaustion(err)
}

#[cfg(unix)]
fn is_descriptor_exhaustion(err: &io::Error) -> bool {
    // ENFILE / EMFILE
    matches!(err.raw_os_error(), Some(23 | 24))
}

#[cfg(not(unix))]
fn is_descriptor_exhaustion(_err: &io::Error) -> bool {
    false
}

/// Accept one connection, retrying transient errors with backoff.
///
/// Returns `Ok(None)` once `shutdown` reads `true`, including while sleeping
/// between retries. Non-transient errors are returned immediately.
pub async fn accept<L: Listener>(
    listener: &L,
    backoff: &BackoffConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> io::Result<Option<(L::Stream, L::Addr)>> {
    let mut delays = AcceptBackoff::new(backoff.clone());

    loop {
        if *shutdown.borrow() {
            return Ok(None);
        }

        let result = tokio::select! {
            result = listener.accept() => result,
            () = signal::fired(shutdown) => return Ok(None),
        };

        match result {
            Ok(conn) => return Ok(Some(conn)),
            Err(err) if is_transient(&err) => {
                let delay = delays.next_delay();
                tracing::warn!(error = %err, ?delay, "transient accept error, retrying");
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = signal::fired(shutdown) => return Ok(None),
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "accept failed");
                return Err(err);
            }
        }
    }
}
