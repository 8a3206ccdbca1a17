//! Accept loop that turns connections into managed sessions.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};

use crate::accept::{self, BackoffConfig, Listener};
use crate::codec::{Codec, Protocol};
use crate::id::{IdGenerator, SessionId};
use crate::manager::Manager;
use crate::network::Network;
use crate::session::Session;

/// Application logic run once per accepted session.
#[async_trait]
pub trait Handler<C: Codec>: Send + Sync + 'static {
    /// Drive `session` for as long as the application needs it.
    async fn handle_session(&self, session: Arc<Session<C>>);
}

#[async_trait]
impl<C: Codec, T: Handler<C>> Handler<C> for Arc<T> {
    async fn handle_session(&self, session: Arc<Session<C>>) {
        (**self).handle_session(session).await;
    }
}

/// Adapts an async closure into a [`Handler`].
pub struct HandlerFn<F> {
    f: F,
}

impl<F> HandlerFn<F> {
    /// Wrap `f`.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<C, F, Fut> Handler<C> for HandlerFn<F>
where
    C: Codec,
    F: Fn(Arc<Session<C>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle_session(&self, session: Arc<Session<C>>) {
        (self.f)(session).await;
    }
}

/// Owns a listener and dispatches every accepted connection to a [`Handler`].
///
/// Each connection is handled on its own task: the codec is built from the
/// raw stream, a session is registered with this server's [`Manager`], then
/// the handler runs. A codec failure drops the stream and creates nothing.
pub struct Server<L, P, H>
where
    L: Listener,
    P: Protocol<L::Stream>,
{
    /// Held by the accept loop while it runs; emptied by [`stop`](Self::stop).
    listener: Mutex<Option<L>>,
    local_addr: Option<L::Addr>,
    protocol: Arc<P>,
    handler: Arc<H>,
    manager: Arc<Manager<P::Codec>>,
    send_queue_capacity: usize,
    backoff: BackoffConfig,
    shutdown: watch::Sender<bool>,
}

impl<L, P, H> Server<L, P, H>
where
    L: Listener,
    P: Protocol<L::Stream>,
    H: Handler<P::Codec>,
{
    /// Create a server around an already bound listener.
    pub fn new(listener: L, protocol: P, send_queue_capacity: usize, handler: H) -> Self {
        let (shutdown, _) = watch::channel(false);
        let local_addr = listener.local_addr().ok();
        Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            protocol: Arc::new(protocol),
            handler: Arc::new(handler),
            manager: Manager::new(),
            send_queue_capacity,
            backoff: BackoffConfig::default(),
            shutdown,
        }
    }

    /// Override the accept retry bounds.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Draw session ids from `ids` instead of a private generator.
    ///
    /// Must be called before [`serve`](Self::serve).
    pub fn with_id_generator(mut self, ids: Arc<IdGenerator>) -> Self {
        self.manager = Manager::with_id_generator(ids);
        self
    }

    /// The address the listener was bound to.
    pub fn local_addr(&self) -> io::Result<L::Addr> {
        self.local_addr
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "listener has no local address"))
    }

    /// The registry holding this server's sessions.
    pub fn manager(&self) -> &Arc<Manager<P::Codec>> {
        &self.manager
    }

    /// Look up a live session by id.
    pub fn get_session(&self, id: SessionId) -> Option<Arc<Session<P::Codec>>> {
        self.manager.get_session(id)
    }

    /// Run the accept loop until [`stop`](Self::stop) is called or the
    /// listener fails with a non-transient error.
    ///
    /// Returns immediately once the server has been stopped.
    pub async fn serve(&self) -> io::Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        let slot = self.listener.lock().await;
        let Some(listener) = slot.as_ref() else {
            return Ok(());
        };

        loop {
            let Some((stream, peer)) = accept::accept(listener, &self.backoff, &mut shutdown).await?
            else {
                tracing::info!("server stopped accepting");
                return Ok(());
            };

            let protocol = Arc::clone(&self.protocol);
            let handler = Arc::clone(&self.handler);
            let manager = Arc::clone(&self.manager);
            let send_queue_capacity = self.send_queue_capacity;

            tokio::spawn(async move {
                let codec = match protocol.new_codec(stream) {
                    Ok(codec) => codec,
                    Err(err) => {
                        tracing::warn!(?peer, error = %err, "codec setup failed, dropping connection");
                        return;
                    }
                };
                let session = manager.new_session(codec, send_queue_capacity).await;
                tracing::debug!(?peer, session_id = %session.id(), "session accepted");
                handler.handle_session(session).await;
            });
        }
    }

    /// Close the listener, then close every session.
    ///
    /// Returns once all sessions have closed and run their close callbacks.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        drop(self.listener.lock().await.take());
        self.manager.dispose().await;
        tracing::info!("server stopped");
    }
}

impl<L, P, H> fmt::Debug for Server<L, P, H>
where
    L: Listener,
    P: Protocol<L::Stream>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("manager", &self.manager)
            .field("send_queue_capacity", &self.send_queue_capacity)
            .field("backoff", &self.backoff)
            .field("stopped", &*self.shutdown.borrow())
            .finish_non_exhaustive()
    }
}

/// Bind a TCP listener on `network`/`address` and wrap it in a [`Server`].
///
/// `network` must be `"tcp"`, `"tcp4"` or `"tcp6"`. Every resolved address is
/// tried in turn; the first successful bind wins.
pub async fn listen<P, H>(
    network: &str,
    address: &str,
    protocol: P,
    send_queue_capacity: usize,
    handler: H,
) -> io::Result<Server<TcpListener, P, H>>
where
    P: Protocol<tokio::net::TcpStream>,
    H: Handler<P::Codec>,
{
    let network: Network = network.parse()?;
    let mut last_err = None;

    for addr in network.resolve(address).await? {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                tracing::info!(%network, %addr, "listening");
                return Ok(Server::new(listener, protocol, send_queue_capacity, handler));
            }
            Err(err) => {
                tracing::debug!(%addr, error = %err, "bind failed");
                last_err = Some(err);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no address to bind")
    }))
}
