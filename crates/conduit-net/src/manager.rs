//! Sharded registry of every session a service has admitted.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::{OnceCell, watch};

use crate::codec::Codec;
use crate::id::{IdGenerator, SessionId};
use crate::session::Session;

/// Number of lock-partitioned shards in a [`Manager`].
pub const SHARD_COUNT: usize = 32;

struct ShardState<C: Codec> {
    sessions: HashMap<SessionId, Arc<Session<C>>>,
    disposed: bool,
}

struct Shard<C: Codec> {
    state: RwLock<ShardState<C>>,
}

impl<C: Codec> Shard<C> {
    fn new() -> Self {
        Self {
            state: RwLock::new(ShardState {
                sessions: HashMap::new(),
                disposed: false,
            }),
        }
    }
}

/// Owns the sessions of one service and coordinates their shutdown.
///
/// Sessions are spread over [`SHARD_COUNT`] shards by `id % SHARD_COUNT`, each
/// with its own lock. [`dispose`](Self::dispose) closes everything and waits
/// until every admitted session has run its close callbacks.
pub struct Manager<C: Codec> {
    shards: Vec<Shard<C>>,
    ids: Arc<IdGenerator>,
    /// Admitted sessions whose close callbacks have not finished yet.
    pending: watch::Sender<usize>,
    disposed: OnceCell<()>,
}

impl<C: Codec> Manager<C> {
    /// Create a manager with its own [`IdGenerator`].
    pub fn new() -> Arc<Self> {
        Self::with_id_generator(Arc::new(IdGenerator::new()))
    }

    /// Create a manager that draws session ids from `ids`.
    pub fn with_id_generator(ids: Arc<IdGenerator>) -> Arc<Self> {
        let (pending, _) = watch::channel(0);
        Arc::new(Self {
            shards: (0..SHARD_COUNT).map(|_| Shard::new()).collect(),
            ids,
            pending,
            disposed: OnceCell::new(),
        })
    }

    /// The id generator this manager assigns from.
    pub fn id_generator(&self) -> &Arc<IdGenerator> {
        &self.ids
    }

    fn shard(&self, id: SessionId) -> &Shard<C> {
        &self.shards[(id.0 % SHARD_COUNT as u64) as usize]
    }

    /// Create a session around `codec` and admit it.
    ///
    /// If its shard has already been disposed the session is closed before it
    /// is returned, so every operation on it fails with
    /// [`SessionError::Closed`](crate::SessionError::Closed).
    pub async fn new_session(self: &Arc<Self>, codec: C, send_queue_capacity: usize) -> Arc<Session<C>> {
        let id = self.ids.next_id();
        let session = Session::new(id, codec, send_queue_capacity);

        if !self.put_session(&session) {
            tracing::debug!(session_id = %id, "manager disposed, rejecting session");
            let _ = session.close().await;
        }
        session
    }

    /// Insert `session` into its shard. Returns `false` if the shard is disposed.
    fn put_session(self: &Arc<Self>, session: &Arc<Session<C>>) -> bool {
        let id = session.id();
        let mut shard = self.shard(id).state.write();
        if shard.disposed {
            return false;
        }

        // Deregistration runs after every close callback, so a drained
        // manager never has callbacks still in flight.
        let manager: Weak<Self> = Arc::downgrade(self);
        let registered = session.set_close_hook(move || {
            if let Some(manager) = manager.upgrade() {
                manager.del_session(id);
            }
        });
        if !registered {
            return false;
        }

        shard.sessions.insert(id, Arc::clone(session));
        self.pending.send_modify(|n| *n += 1);
        true
    }

    fn del_session(&self, id: SessionId) {
        let removed = self.shard(id).state.write().sessions.remove(&id);
        if removed.is_some() {
            self.pending.send_modify(|n| *n -= 1);
        }
    }

    /// Look up a live session by id.
    pub fn get_session(&self, id: SessionId) -> Option<Arc<Session<C>>> {
        self.shard(id).state.read().sessions.get(&id).cloned()
    }

    /// Number of sessions currently registered across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.state.read().sessions.len()).sum()
    }

    /// Whether no sessions are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`dispose`](Self::dispose) has completed.
    pub fn is_disposed(&self) -> bool {
        self.disposed.initialized()
    }

    /// Close every session and wait until all of them have finished their
    /// close callbacks.
    ///
    /// Teardown runs once; concurrent and later callers wait for that single
    /// run to finish. Sessions offered afterwards are closed on arrival.
    pub async fn dispose(&self) {
        self.disposed
            .get_or_init(|| async {
                let mut closed = 0usize;
                for shard in &self.shards {
                    let sessions: Vec<_> = {
                        let mut state = shard.state.write();
                        state.disposed = true;
                        state.sessions.values().cloned().collect()
                    };
                    for session in sessions {
                        if session.close().await.is_ok() {
                            closed += 1;
                        }
                    }
                }
                tracing::debug!(closed, "manager shards disposed, draining");

                let mut pending = self.pending.subscribe();
                let _ = pending.wait_for(|n| *n == 0).await;
                tracing::debug!("manager drained");
            })
            .await;
    }
}

impl<C: Codec> fmt::Debug for Manager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("sessions", &self.len())
            .field("pending", &*self.pending.borrow())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::OwnerToken;
    use crate::testutil::{MockCodec, wait_until};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn codec() -> MockCodec {
        MockCodec::new().0
    }

    #[tokio::test]
    async fn test_session_retrievable_by_id() {
        let manager = Manager::new();
        let mut ids = Vec::new();
        for _ in 0..70 {
            ids.push(manager.new_session(codec(), 0).await.id());
        }

        for id in ids {
            let found = manager.get_session(id).expect("session registered");
            assert_eq!(found.id(), id);
            let shard = &manager.shards[(id.0 % SHARD_COUNT as u64) as usize];
            assert!(shard.state.read().sessions.contains_key(&id));
        }
        assert_eq!(manager.len(), 70);
    }

    #[tokio::test]
    async fn test_unknown_id_not_found() {
        let manager = Manager::<MockCodec>::new();
        assert!(manager.get_session(SessionId(12345)).is_none());
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_closed_session_is_deregistered() {
        let manager = Manager::new();
        let session = manager.new_session(codec(), 0).await;
        let id = session.id();

        session.close().await.unwrap();
        wait_until(|| manager.get_session(id).is_none()).await;
        assert_eq!(*manager.pending.borrow(), 0);
    }

    #[tokio::test]
    async fn test_dispose_closes_and_drains_everything() {
        let manager = Manager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let owner = OwnerToken::new();

        let mut sessions = Vec::new();
        for n in 0..40 {
            let session = manager.new_session(codec(), n % 3).await;
            let counter = Arc::clone(&fired);
            session.add_close_callback(owner, 0, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            sessions.push(session);
        }

        manager.dispose().await;

        assert!(sessions.iter().all(|s| s.is_closed()));
        assert_eq!(fired.load(Ordering::SeqCst), 40, "all callbacks ran before dispose returned");
        assert!(manager.is_empty());
        assert!(manager.is_disposed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dispose_waits_for_slow_callbacks() {
        let manager = Manager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let owner = OwnerToken::new();

        for n in 0..4 {
            let session = manager.new_session(codec(), n % 2).await;
            let counter = Arc::clone(&fired);
            session.add_close_callback(owner, 0, move || {
                std::thread::sleep(std::time::Duration::from_millis(100));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        manager.dispose().await;
        assert_eq!(fired.load(Ordering::SeqCst), 4);
        assert!(manager.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_callback_still_deregisters() {
        let manager = Manager::new();
        let session = manager.new_session(codec(), 0).await;
        session.add_close_callback(OwnerToken::new(), 0, || panic!("callback failure"));

        tokio::time::timeout(std::time::Duration::from_secs(1), manager.dispose())
            .await
            .expect("dispose not stuck on a panicking callback");
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_dispose_runs_once() {
        let manager = Manager::new();
        let (codec, probe) = MockCodec::new();
        let _session = manager.new_session(codec, 0).await;

        manager.dispose().await;
        manager.dispose().await;
        assert_eq!(probe.close_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dispose_waits_for_teardown() {
        let manager = Manager::new();
        for _ in 0..64 {
            manager.new_session(codec(), 2).await;
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    manager.dispose().await;
                    manager.len()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_new_session_after_dispose_is_closed() {
        let manager = Manager::new();
        manager.dispose().await;

        let (codec, probe) = MockCodec::new();
        let session = manager.new_session(codec, 4).await;
        assert!(session.is_closed());
        assert_eq!(probe.close_count(), 1);
        assert!(session.send(1).await.unwrap_err().is_closed());
        assert!(session.receive().await.unwrap_err().is_closed());
        assert!(manager.get_session(session.id()).is_none());
        assert_eq!(*manager.pending.borrow(), 0);
    }

    #[tokio::test]
    async fn test_shared_id_generator() {
        let ids = Arc::new(IdGenerator::new());
        let a = Manager::with_id_generator(Arc::clone(&ids));
        let b = Manager::with_id_generator(Arc::clone(&ids));

        let s1 = a.new_session(codec(), 0).await;
        let s2 = b.new_session(codec(), 0).await;
        assert_ne!(s1.id(), s2.id());
        assert!(a.get_session(s2.id()).is_none());
    }
}
