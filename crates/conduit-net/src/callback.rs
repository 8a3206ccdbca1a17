//! Ordered close-callback registry.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Identifies the component that registered a close callback.
///
/// Every [`Manager`](crate::Manager) and [`Channel`](crate::Channel) holds its
/// own token. Applications registering their own callbacks allocate one with
/// [`OwnerToken::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerToken(u64);

impl OwnerToken {
    /// Allocate a token distinct from every other token in the process.
    pub fn new() -> Self {
        Self(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for OwnerToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Composite key of a close callback: who registered it, and under what key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseKey {
    /// The registering component.
    pub owner: OwnerToken,
    /// Owner-chosen discriminator (a session id, a channel slot, ...).
    pub key: u64,
}

impl CloseKey {
    /// Build a key from its parts.
    pub fn new(owner: OwnerToken, key: u64) -> Self {
        Self { owner, key }
    }
}

pub(crate) type CloseFn = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Entries {
    sealed: bool,
    list: Vec<(CloseKey, CloseFn)>,
    hook: Option<CloseFn>,
}

/// Insertion-ordered list of callbacks, sealed once when the session closes.
///
/// Registering the same key twice keeps both entries; [`remove`](Self::remove)
/// drops the earliest one only.
#[derive(Default)]
pub(crate) struct CloseCallbacks {
    entries: Mutex<Entries>,
}

impl CloseCallbacks {
    /// Append a callback. Returns `false` (and drops `f`) once sealed.
    pub(crate) fn add(&self, key: CloseKey, f: CloseFn) -> bool {
        let mut entries = self.entries.lock();
        if entries.sealed {
            return false;
        }
        entries.list.push((key, f));
        true
    }

    /// Remove the first callback registered under `key`.
    pub(crate) fn remove(&self, key: CloseKey) -> bool {
        let mut entries = self.entries.lock();
        if entries.sealed {
            return false;
        }
        match entries.list.iter().position(|(k, _)| *k == key) {
            Some(index) => {
                drop(entries.list.remove(index));
                true
            }
            None => false,
        }
    }

    /// Set the hook that runs after every callback. Only one hook may be set.
    pub(crate) fn set_hook(&self, f: CloseFn) -> bool {
        let mut entries = self.entries.lock();
        if entries.sealed || entries.hook.is_some() {
            return false;
        }
        entries.hook = Some(f);
        true
    }

    /// Seal the registry and hand back every callback in registration order,
    /// plus the hook.
    pub(crate) fn seal(&self) -> (Vec<CloseFn>, Option<CloseFn>) {
        let mut entries = self.entries.lock();
        entries.sealed = true;
        let list = std::mem::take(&mut entries.list)
            .into_iter()
            .map(|(_, f)| f)
            .collect();
        (list, entries.hook.take())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().list.len()
    }
}

impl fmt::Debug for CloseCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        f.debug_struct("CloseCallbacks")
            .field("sealed", &entries.sealed)
            .field("len", &entries.list.len())
            .field("hook", &entries.hook.is_some())
            .finish()
    }
}
