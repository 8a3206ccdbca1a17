//! One connection's read/write/close state machine.
//!
//! A session is `Open` until its first [`Session::close`], then `Closed`
//! forever. The transition is a single compare-and-swap; only the winner tears
//! the connection down:
//!
//! 1. fire the close signal (stops the send loop, if any),
//! 2. in buffered mode, shut the outbound queue under the send write lock and
//!    offer what is left to [`Codec::drain_send_queue`],
//! 3. close the codec and return its result,
//! 4. run close callbacks, in registration order, on a spawned task, then the
//!    close hook (if one was set).
//!
//! Every other caller of `close` gets [`SessionError::Closed`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex as StateMutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, RwLock, mpsc, watch};

use crate::callback::{CloseCallbacks, CloseFn, CloseKey, OwnerToken};
use crate::codec::{Codec, SendQueue};
use crate::error::SessionError;
use crate::id::SessionId;
use crate::signal;

type UserState = Arc<dyn Any + Send + Sync>;

/// Runs the close hook when dropped, so a panicking callback cannot skip it.
struct HookGuard(Option<CloseFn>);

impl Drop for HookGuard {
    fn drop(&mut self) {
        if let Some(hook) = self.0.take() {
            hook();
        }
    }
}

/// An open (or closed) logical connection wrapping one [`Codec`].
///
/// Sessions are always handled through an `Arc`. With a send queue capacity of
/// zero, [`send`](Self::send) writes through the codec directly; otherwise
/// messages are queued and a background task forwards them in FIFO order.
pub struct Session<C: Codec> {
    id: SessionId,
    codec: C,
    /// Sender half of the outbound queue, `None` in direct mode or once closed.
    send_gate: RwLock<Option<mpsc::Sender<C::Message>>>,
    queue: Option<Mutex<SendQueue<C::Message>>>,
    recv_lock: Mutex<()>,
    closed: AtomicBool,
    close_signal: watch::Sender<bool>,
    callbacks: CloseCallbacks,
    state: StateMutex<Option<UserState>>,
}

impl<C: Codec> Session<C> {
    /// Wrap `codec` in a new session.
    ///
    /// A `send_queue_capacity` above zero enables buffered sending and spawns
    /// the send loop, so this must be called from within a tokio runtime.
    pub fn new(id: SessionId, codec: C, send_queue_capacity: usize) -> Arc<Self> {
        let (close_signal, _) = watch::channel(false);
        let (sender, queue) = if send_queue_capacity > 0 {
            let (tx, rx) = mpsc::channel(send_queue_capacity);
            (Some(tx), Some(Mutex::new(rx)))
        } else {
            (None, None)
        };

        let session = Arc::new(Self {
            id,
            codec,
            send_gate: RwLock::new(sender),
            queue,
            recv_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            close_signal,
            callbacks: CloseCallbacks::default(),
            state: StateMutex::new(None),
        });

        if session.queue.is_some() {
            let looped = Arc::clone(&session);
            tokio::spawn(async move {
                looped.send_loop().await;
            });
        }

        tracing::trace!(session_id = %id, send_queue_capacity, "session opened");
        session
    }

    /// This session's identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Borrow the underlying codec.
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether sends go through a background queue.
    pub fn is_buffered(&self) -> bool {
        self.queue.is_some()
    }

    /// Receive the next message.
    ///
    /// Only one receive runs at a time; concurrent callers wait their turn.
    /// A codec error closes the session and is returned as
    /// [`SessionError::Transport`].
    pub async fn receive(&self) -> Result<C::Message, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let _guard = self.recv_lock.lock().await;
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        match self.codec.receive().await {
            Ok(msg) => Ok(msg),
            Err(err) => {
                tracing::debug!(session_id = %self.id, error = %err, "receive failed");
                let _ = self.close().await;
                Err(SessionError::Transport(err))
            }
        }
    }

    /// Send a message.
    ///
    /// In direct mode this waits for the codec. In buffered mode it never
    /// waits: a full queue closes the session and returns
    /// [`SessionError::Blocked`].
    pub async fn send(&self, msg: C::Message) -> Result<(), SessionError> {
        if self.queue.is_none() {
            return self.send_direct(msg).await;
        }

        let outcome = {
            let gate = self.send_gate.read().await;
            if self.is_closed() {
                return Err(SessionError::Closed);
            }
            match gate.as_ref() {
                Some(tx) => tx.try_send(msg),
                None => return Err(SessionError::Closed),
            }
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(session_id = %self.id, "send queue full, closing session");
                let _ = self.close().await;
                Err(SessionError::Blocked)
            }
            Err(TrySendError::Closed(_)) => Err(SessionError::Closed),
        }
    }

    async fn send_direct(&self, msg: C::Message) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let result = {
            let _guard = self.send_gate.write().await;
            if self.is_closed() {
                return Err(SessionError::Closed);
            }
            self.codec.send(msg).await
        };

        if let Err(err) = result {
            tracing::debug!(session_id = %self.id, error = %err, "send failed");
            let _ = self.close().await;
            return Err(SessionError::Transport(err));
        }
        Ok(())
    }

    /// Close the session.
    ///
    /// The first call returns the codec's close result; every later or
    /// concurrent call returns [`SessionError::Closed`]. Close callbacks run
    /// on a spawned task after the codec is closed, so this returns without
    /// waiting for them.
    pub async fn close(&self) -> Result<(), SessionError> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::Closed);
        }

        self.close_signal.send_replace(true);
        let (callbacks, hook) = self.callbacks.seal();

        if let Some(queue) = &self.queue {
            let mut gate = self.send_gate.write().await;
            drop(gate.take());
            let mut rx = queue.lock().await;
            rx.close();
            self.codec.drain_send_queue(&mut rx);
        }

        let result = self.codec.close().await;

        let id = self.id;
        tokio::spawn(async move {
            let _hook = HookGuard(hook);
            for callback in callbacks {
                callback();
            }
            tracing::trace!(session_id = %id, "close callbacks finished");
        });

        match &result {
            Ok(()) => tracing::debug!(session_id = %id, "session closed"),
            Err(err) => tracing::debug!(session_id = %id, error = %err, "session closed with codec error"),
        }
        result.map_err(SessionError::Transport)
    }

    /// Register `f` to run once when the session closes.
    ///
    /// Returns `false` without registering when the session is already
    /// closed. Callbacks run in registration order.
    pub fn add_close_callback<F>(&self, owner: OwnerToken, key: u64, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_closed() {
            return false;
        }
        self.callbacks.add(CloseKey::new(owner, key), Box::new(f))
    }

    /// Unregister the earliest callback added under `(owner, key)`.
    ///
    /// A no-op returning `false` once the session is closed.
    pub fn remove_close_callback(&self, owner: OwnerToken, key: u64) -> bool {
        if self.is_closed() {
            return false;
        }
        self.callbacks.remove(CloseKey::new(owner, key))
    }

    /// Install the hook run after every close callback has finished.
    ///
    /// Returns `false` if the session is closed or a hook is already set.
    pub(crate) fn set_close_hook<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_closed() {
            return false;
        }
        self.callbacks.set_hook(Box::new(f))
    }

    #[cfg(test)]
    pub(crate) fn close_callback_count(&self) -> usize {
        self.callbacks.len()
    }

    /// Attach an application value, replacing any previous one.
    pub fn set_state<T: Any + Send + Sync>(&self, state: T) {
        *self.state.lock() = Some(Arc::new(state));
    }

    /// The attached application value, if one of type `T` is present.
    pub fn state<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let state = self.state.lock().clone()?;
        state.downcast::<T>().ok()
    }

    /// Detach the application value.
    pub fn clear_state(&self) {
        *self.state.lock() = None;
    }

    /// Forward queued messages to the codec until the queue closes, the codec
    /// fails, or the close signal fires.
    async fn send_loop(self: Arc<Self>) {
        let Some(queue) = &self.queue else {
            return;
        };
        let mut close_rx = self.close_signal.subscribe();

        loop {
            let next = {
                let mut rx = queue.lock().await;
                tokio::select! {
                    msg = rx.recv() => msg,
                    () = signal::fired(&mut close_rx) => None,
                }
            };

            let Some(msg) = next else {
                break;
            };
            if self.is_closed() {
                break;
            }
            if let Err(err) = self.codec.send(msg).await {
                tracing::debug!(session_id = %self.id, error = %err, "send loop stopped");
                break;
            }
        }

        let _ = self.close().await;
        tracing::trace!(session_id = %self.id, "send loop exited");
    }
}

impl<C: Codec> fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("buffered", &self.is_buffered())
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}
