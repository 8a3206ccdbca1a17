//! Keyed groups of sessions that shed members as they close.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::callback::OwnerToken;
use crate::codec::Codec;
use crate::session::Session;

struct Member<C: Codec> {
    session: Weak<Session<C>>,
    /// Close-callback key registered on the session for this entry.
    slot: u64,
}

struct Inner<K, C: Codec> {
    owner: OwnerToken,
    next_slot: AtomicU64,
    members: RwLock<HashMap<K, Member<C>>>,
    state: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl<K, C> Inner<K, C>
where
    K: Eq + Hash,
    C: Codec,
{
    /// Drop `member`'s close callback from its session, if the session lives.
    fn unregister(&self, member: &Member<C>) -> Option<Arc<Session<C>>> {
        let session = member.session.upgrade()?;
        session.remove_close_callback(self.owner, member.slot);
        Some(session)
    }

    /// Called from a member's close callback.
    fn evict(&self, key: &K, slot: u64) {
        let mut members = self.members.write();
        if members.get(key).is_some_and(|m| m.slot == slot) {
            members.remove(key);
        }
    }
}

/// A keyed collection of sessions, used for grouping and broadcast.
///
/// The channel never keeps a session alive or closes it. Each member carries
/// a close callback that removes it from the channel, so closed sessions drop
/// out on their own. Cloning a `Channel` yields another handle to the same
/// group.
///
/// The callbacks passed to [`fetch`](Self::fetch) and
/// [`fetch_and_remove`](Self::fetch_and_remove) run under the channel lock and
/// must not call back into the same channel.
pub struct Channel<K, C: Codec> {
    inner: Arc<Inner<K, C>>,
}

impl<K, C: Codec> Clone for Channel<K, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, C> Channel<K, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    C: Codec,
{
    /// Create an empty channel.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                owner: OwnerToken::new(),
                next_slot: AtomicU64::new(0),
                members: RwLock::new(HashMap::new()),
                state: Mutex::new(None),
            }),
        }
    }

    /// Add `session` under `key`, evicting (not closing) any previous member.
    ///
    /// Returns `false` and leaves the channel untouched if `session` is
    /// already closed.
    pub fn put(&self, key: K, session: &Arc<Session<C>>) -> bool {
        let mut members = self.inner.members.write();

        let slot = self.inner.next_slot.fetch_add(1, Ordering::Relaxed);
        let channel = Arc::downgrade(&self.inner);
        let evict_key = key.clone();
        let registered = session.add_close_callback(self.inner.owner, slot, move || {
            if let Some(channel) = Weak::upgrade(&channel) {
                channel.evict(&evict_key, slot);
            }
        });
        if !registered {
            return false;
        }

        let member = Member {
            session: Arc::downgrade(session),
            slot,
        };
        if let Some(previous) = members.insert(key, member) {
            self.inner.unregister(&previous);
        }
        true
    }

    /// Remove the member under `key`. Returns whether one was present.
    pub fn remove(&self, key: &K) -> bool {
        let removed = self.inner.members.write().remove(key);
        match removed {
            Some(member) => {
                self.inner.unregister(&member);
                true
            }
            None => false,
        }
    }

    /// The live session stored under `key`.
    pub fn get(&self, key: &K) -> Option<Arc<Session<C>>> {
        self.inner.members.read().get(key)?.session.upgrade()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.inner.members.read().len()
    }

    /// Whether the channel has no members.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `f` for every live member while holding the channel's read lock.
    pub fn fetch<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Session<C>>),
    {
        let members = self.inner.members.read();
        for member in members.values() {
            if let Some(session) = member.session.upgrade() {
                f(&session);
            }
        }
    }

    /// Empty the channel, handing each live member to `f` as it is removed.
    pub fn fetch_and_remove<F>(&self, mut f: F)
    where
        F: FnMut(Arc<Session<C>>),
    {
        let mut members = self.inner.members.write();
        for (_, member) in members.drain() {
            if let Some(session) = self.inner.unregister(&member) {
                f(session);
            }
        }
    }

    /// Drop every member. Member sessions are left open.
    pub fn close(&self) {
        let mut members = self.inner.members.write();
        for (_, member) in members.drain() {
            self.inner.unregister(&member);
        }
    }

    /// Snapshot of the live members.
    pub fn members(&self) -> Vec<Arc<Session<C>>> {
        let mut sessions = Vec::with_capacity(self.len());
        self.fetch(|session| sessions.push(Arc::clone(session)));
        sessions
    }

    /// Send a copy of `msg` to every live member.
    ///
    /// Members are snapshotted first, so no lock is held while sending.
    /// Returns how many sends succeeded; a failed send closes only that member.
    pub async fn broadcast(&self, msg: C::Message) -> usize
    where
        C::Message: Clone,
    {
        let mut delivered = 0;
        for session in self.members() {
            match session.send(msg.clone()).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::debug!(session_id = %session.id(), error = %err, "broadcast send failed");
                }
            }
        }
        delivered
    }

    /// Attach an application value to the channel.
    pub fn set_state<T: Any + Send + Sync>(&self, state: T) {
        *self.inner.state.lock() = Some(Arc::new(state));
    }

    /// The attached application value, if one of type `T` is present.
    pub fn state<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let state = self.inner.state.lock().clone()?;
        state.downcast::<T>().ok()
    }
}

impl<K, C> Default for Channel<K, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    C: Codec,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, C: Codec> fmt::Debug for Channel<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("owner", &self.inner.owner)
            .field("members", &self.inner.members.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::IdGenerator;
    use crate::testutil::{MockCodec, Probe, wait_until};

    fn session(ids: &IdGenerator) -> (Arc<Session<MockCodec>>, Arc<Probe>) {
        let (codec, probe) = MockCodec::new();
        (Session::new(ids.next_id(), codec, 0), probe)
    }

    #[tokio::test]
    async fn test_put_get_len() {
        let ids = IdGenerator::new();
        let channel = Channel::new();
        let (a, _) = session(&ids);
        let (b, _) = session(&ids);

        assert!(channel.put("a", &a));
        assert!(channel.put("b", &b));
        assert_eq!(channel.len(), 2);
        assert_eq!(channel.get(&"a").unwrap().id(), a.id());
        assert!(channel.get(&"missing").is_none());
    }

    #[tokio::test]
    async fn test_closed_member_removes_itself() {
        let ids = IdGenerator::new();
        let channel = Channel::new();
        let (a, _) = session(&ids);
        channel.put("x", &a);
        assert_eq!(channel.len(), 1);

        a.close().await.unwrap();
        wait_until(|| channel.get(&"x").is_none()).await;
        assert_eq!(channel.len(), 0);
    }

    #[tokio::test]
    async fn test_replacement_evicts_without_closing() {
        let ids = IdGenerator::new();
        let channel = Channel::new();
        let (a, _) = session(&ids);
        let (b, _) = session(&ids);

        channel.put("x", &a);
        channel.put("x", &b);
        assert!(!a.is_closed());
        assert_eq!(channel.get(&"x").unwrap().id(), b.id());
        assert_eq!(channel.len(), 1);
        assert_eq!(a.close_callback_count(), 0);

        // The evicted session's closure must not disturb the new occupant.
        a.close().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(channel.get(&"x").unwrap().id(), b.id());
    }

    #[tokio::test]
    async fn test_remove_unregisters_callback() {
        let ids = IdGenerator::new();
        let channel = Channel::new();
        let (a, _) = session(&ids);

        channel.put(1u32, &a);
        assert_eq!(a.close_callback_count(), 1);
        assert!(channel.remove(&1));
        assert!(!channel.remove(&1));
        assert_eq!(a.close_callback_count(), 0);
        assert!(channel.is_empty());
    }

    #[tokio::test]
    async fn test_session_in_multiple_channels() {
        let ids = IdGenerator::new();
        let lobby = Channel::new();
        let room = Channel::new();
        let (a, _) = session(&ids);

        lobby.put("a", &a);
        room.put("a", &a);
        room.put("alias", &a);
        assert_eq!(a.close_callback_count(), 3);

        a.close().await.unwrap();
        wait_until(|| lobby.is_empty() && room.is_empty()).await;
    }

    #[tokio::test]
    async fn test_put_closed_session_is_rejected() {
        let ids = IdGenerator::new();
        let channel = Channel::new();
        let (a, _) = session(&ids);
        let (b, _) = session(&ids);
        channel.put("x", &a);

        b.close().await.unwrap();
        assert!(!channel.put("x", &b));
        assert_eq!(channel.get(&"x").unwrap().id(), a.id());
    }

    #[tokio::test]
    async fn test_fetch_visits_every_member() {
        let ids = IdGenerator::new();
        let channel = Channel::new();
        let sessions: Vec<_> = (0..5).map(|_| session(&ids).0).collect();
        for (n, s) in sessions.iter().enumerate() {
            channel.put(n, s);
        }

        let mut seen = Vec::new();
        channel.fetch(|s| seen.push(s.id()));
        seen.sort();
        let mut expected: Vec<_> = sessions.iter().map(|s| s.id()).collect();
        expected.sort();
        assert_eq!(seen, expected);
        assert_eq!(channel.len(), 5);
    }

    #[tokio::test]
    async fn test_fetch_and_remove_drains() {
        let ids = IdGenerator::new();
        let channel = Channel::new();
        let sessions: Vec<_> = (0..3).map(|_| session(&ids).0).collect();
        for (n, s) in sessions.iter().enumerate() {
            channel.put(n, s);
        }

        let mut drained = 0;
        channel.fetch_and_remove(|s| {
            assert!(!s.is_closed());
            drained += 1;
        });
        assert_eq!(drained, 3);
        assert!(channel.is_empty());
        assert!(sessions.iter().all(|s| s.close_callback_count() == 0));
    }

    #[tokio::test]
    async fn test_close_leaves_sessions_open() {
        let ids = IdGenerator::new();
        let channel = Channel::new();
        let (a, _) = session(&ids);
        let (b, _) = session(&ids);
        channel.put("a", &a);
        channel.put("b", &b);

        channel.close();
        assert!(channel.is_empty());
        assert!(!a.is_closed() && !b.is_closed());
        assert_eq!(a.close_callback_count(), 0);
        assert_eq!(b.close_callback_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_counts_deliveries() {
        let ids = IdGenerator::new();
        let channel = Channel::new();
        let (a, probe_a) = session(&ids);
        let (b, probe_b) = session(&ids);
        let (c, probe_c) = session(&ids);
        channel.put("a", &a);
        channel.put("b", &b);
        channel.put("c", &c);
        probe_c.fail_sends();

        assert_eq!(channel.broadcast(7).await, 2);
        assert_eq!(probe_a.sent(), vec![7]);
        assert_eq!(probe_b.sent(), vec![7]);
        assert!(c.is_closed());
        wait_until(|| channel.len() == 2).await;
    }

    #[tokio::test]
    async fn test_channel_state() {
        let channel = Channel::<u8, MockCodec>::new();
        assert!(channel.state::<u32>().is_none());
        channel.set_state(99u32);
        assert_eq!(channel.state::<u32>().as_deref(), Some(&99));
    }
}
