//! The replicated global object.
//!
//! A global object has one instance per process and a fixed-length peer
//! table mapping each process id to the identifier of that process's
//! instance. The table entries are weak: they never participate in the
//! distributed count, which is what makes the cluster-wide cycle
//! harmless. Lifetime is governed by the client set of each instance's
//! work item instead — `init_global_object` seeds it with every process
//! id, and a process withdraws from all of them at once when its last
//! local user reference goes away.
//!
//! Serializing a global object to a peer sends only that peer's own
//! peer-table identifier; the receiver resolves it to its local instance
//! through the owner-side decode shortcut.

use crate::runtime::Core;
use crate::types::{ProcId, RefId};
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

/// Per-process instance state.
pub(crate) struct GlobalInner {
    /// Identifier of this process's own instance.
    pub(crate) home: RefId,
    /// Instance identifier per process id; empty until bound by
    /// `init_global_object`.
    pub(crate) peers: RefCell<Vec<RefId>>,
}

impl GlobalInner {
    pub(crate) fn unbound(home: RefId) -> Self {
        Self {
            home,
            peers: RefCell::new(Vec::new()),
        }
    }

    /// Binds the peer table. Runs once, before any serialization of the
    /// object can occur on this process.
    pub(crate) fn bind(&self, rids: Vec<RefId>) {
        *self.peers.borrow_mut() = rids;
    }
}

/// The uniqued per-process user wrapper.
///
/// All `GlobalObject` values on one process share a single `GlobalUser`;
/// dropping the last one is the local-disuse event that withdraws this
/// process from every instance's client set.
pub(crate) struct GlobalUser {
    pub(crate) inner: Rc<GlobalInner>,
    pub(crate) core: Weak<Core>,
}

impl Drop for GlobalUser {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.global_user_dropped(&self.inner);
        }
    }
}

/// A replicated value with one instance per process.
///
/// On every process of the cluster, a `GlobalObject` received from any
/// peer resolves to the same local instance.
#[derive(Clone)]
pub struct GlobalObject {
    user: Rc<GlobalUser>,
}

impl GlobalObject {
    pub(crate) fn from_user(user: Rc<GlobalUser>) -> Self {
        Self { user }
    }

    pub(crate) fn user_rc(&self) -> &Rc<GlobalUser> {
        &self.user
    }

    pub(crate) fn inner_rc(&self) -> &Rc<GlobalInner> {
        &self.user.inner
    }

    /// Identifier of this process's own instance.
    #[must_use]
    pub fn home_id(&self) -> RefId {
        self.user.inner.home
    }

    /// Identifier of `peer`'s instance, once the table is bound.
    #[must_use]
    pub fn peer_id(&self, peer: ProcId) -> Option<RefId> {
        self.user.inner.peers.borrow().get(peer.index()).copied()
    }

    /// Number of processes in the peer table (zero before binding).
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.user.inner.peers.borrow().len()
    }

    /// True once `init_global_object` has bound the peer table.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        !self.user.inner.peers.borrow().is_empty()
    }
}

impl PartialEq for GlobalObject {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.user.inner, &other.user.inner)
    }
}

impl fmt::Debug for GlobalObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalObject")
            .field("home", &self.user.inner.home)
            .field("peers", &self.peer_count())
            .finish()
    }
}

/// Runtime-side record of the process's global object.
pub(crate) struct GlobalSlot {
    /// Instance identifiers per process, recorded at bind time. Used to
    /// revive the instance if it is re-introduced after local disuse.
    pub(crate) rids: Vec<RefId>,
    /// The current instance.
    pub(crate) instance: Weak<GlobalInner>,
    /// Strong pin held while the local work item's client set is
    /// non-empty, so remote participants keep the instance alive.
    pub(crate) pinned: Option<Rc<GlobalInner>>,
    /// Uniquing of the user wrapper.
    pub(crate) user: Weak<GlobalUser>,
    /// Process-lifetime hold on the user wrapper. Values passing through
    /// computations come and go; the withdrawal finalizer must fire only
    /// when the process is done with the object for good (reclamation or
    /// teardown), not on a transient zero-crossing.
    pub(crate) anchor: Option<Rc<GlobalUser>>,
}

impl GlobalSlot {
    pub(crate) fn new(instance: &Rc<GlobalInner>) -> Self {
        Self {
            rids: Vec::new(),
            instance: Rc::downgrade(instance),
            pinned: Some(Rc::clone(instance)),
            user: Weak::new(),
            anchor: None,
        }
    }
}
