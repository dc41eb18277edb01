//! Remote-reference handles.
//!
//! A [`RemoteRef`] is a strong, process-locally uniqued handle to one
//! remote computation. Uniquing goes through a weak-valued table keyed by
//! `(origin, seq)`: reconstructing a handle for an identifier that is
//! already live returns the existing handle, so a process holds at most
//! one strong handle per identifier and emits exactly one `del_client`
//! when it lets go.
//!
//! Dropping the last clone of a strong handle notifies the owning process
//! (or applies the removal locally when the owner is this process). All
//! handles live on the event-loop thread — the runtime's types are not
//! `Send` — so finalization needs no cross-thread marshalling.
//!
//! A [`WeakRef`] observes the same identifier without participating in
//! the distributed count and never sends deletion messages.

use crate::runtime::Core;
use crate::types::{RefId, RefKey};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

pub(crate) struct RefInner {
    pub(crate) id: RefId,
    pub(crate) core: Weak<Core>,
}

impl Drop for RefInner {
    fn drop(&mut self) {
        // Last strong holder in this process is gone.
        if let Some(core) = self.core.upgrade() {
            core.release_handle(self.id);
        }
    }
}

/// A strong handle to a remote computation.
///
/// Cloning is cheap and does not change the distributed count: the count
/// tracks *processes*, not handle clones. Equality and hashing follow the
/// identifier's `(origin, seq)` identity.
#[derive(Clone)]
pub struct RemoteRef {
    inner: Rc<RefInner>,
}

impl RemoteRef {
    pub(crate) fn from_inner(inner: Rc<RefInner>) -> Self {
        Self { inner }
    }

    /// A handle not connected to any runtime, for tests of identity
    /// semantics only.
    #[cfg(test)]
    pub(crate) fn detached(id: RefId) -> Self {
        Self {
            inner: Rc::new(RefInner {
                id,
                core: Weak::new(),
            }),
        }
    }

    /// The identifier this handle denotes.
    #[must_use]
    pub fn id(&self) -> RefId {
        self.inner.id
    }

    /// The `(origin, seq)` identity key.
    #[must_use]
    pub fn key(&self) -> RefKey {
        self.inner.id.key()
    }

    /// Creates a weak handle to the same identifier.
    #[must_use]
    pub fn downgrade(&self) -> WeakRef {
        WeakRef {
            id: self.inner.id,
            inner: Rc::downgrade(&self.inner),
        }
    }
}

impl PartialEq for RemoteRef {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for RemoteRef {}

impl Hash for RemoteRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Debug for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RemoteRef").field(&self.inner.id).finish()
    }
}

impl fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.id)
    }
}

/// A weak handle: observes an identifier without keeping the computation
/// alive anywhere.
#[derive(Clone, Debug)]
pub struct WeakRef {
    id: RefId,
    inner: Weak<RefInner>,
}

impl WeakRef {
    /// The identifier this handle denotes.
    #[must_use]
    pub fn id(&self) -> RefId {
        self.id
    }

    /// Upgrades to the strong handle, if this process still holds one.
    #[must_use]
    pub fn upgrade(&self) -> Option<RemoteRef> {
        self.inner.upgrade().map(RemoteRef::from_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProcId;
    use std::collections::HashSet;

    fn rid(origin: u32, seq: u64) -> RefId {
        RefId::new(ProcId::new(2), ProcId::new(origin), seq)
    }

    #[test]
    fn equality_follows_identity_pair() {
        let a = RemoteRef::detached(rid(1, 7));
        let b = RemoteRef::detached(rid(1, 7));
        let c = RemoteRef::detached(rid(1, 8));
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        set.insert(a.clone());
        assert!(set.contains(&b));
        assert!(!set.contains(&c));
    }

    #[test]
    fn weak_upgrade_follows_strong_lifetime() {
        let strong = RemoteRef::detached(rid(1, 1));
        let weak = strong.downgrade();
        assert_eq!(weak.id(), strong.id());
        assert!(weak.upgrade().is_some());
        drop(strong);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn clones_share_one_inner() {
        let a = RemoteRef::detached(rid(3, 9));
        let b = a.clone();
        let weak = a.downgrade();
        drop(a);
        // The clone still pins the identity.
        assert!(weak.upgrade().is_some());
        drop(b);
        assert!(weak.upgrade().is_none());
    }
}
