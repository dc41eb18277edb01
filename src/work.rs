//! Work items, the runnable queue, and the waiting table.
//!
//! A [`WorkItem`] is the owner-side record of one computation: its thunk,
//! completion state, result, the parties awaiting completion, and the set
//! of processes currently holding a strong handle to it. Items owned by
//! this process live in the runtime's reference registry exactly as long
//! as that client set is non-empty.
//!
//! The waiting table maps a remote identifier to the local tasks
//! suspended on it; result delivery removes the first entry whose verb
//! matches, binds the value as the resumption argument, and re-enqueues
//! the item.

use crate::global::GlobalInner;
use crate::registry::ComputationName;
use crate::task::TaskSlot;
use crate::types::{ProcId, RefId, RefKey, Verb};
use crate::value::Value;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::rc::{Rc, Weak};

/// Shared ownership of one work item.
pub(crate) type ItemRef = Rc<RefCell<WorkItem>>;

// ---------------------------------------------------------------------------
// Thunks
// ---------------------------------------------------------------------------

/// What a work item runs when started.
#[derive(Debug)]
pub(crate) enum Thunk {
    /// A registered computation with decoded arguments.
    Computation {
        name: ComputationName,
        args: Vec<Value>,
    },
    /// Internal bookkeeping carried by `DO` messages.
    Control(ControlOp),
}

/// Bookkeeping operations executed as queued work.
#[derive(Debug)]
pub(crate) enum ControlOp {
    /// Remove `peer` from the client set of the local item `id`.
    DelClient { id: RefId, peer: ProcId },
    /// Add `peer` to the client set of the local item `id`.
    AddClient { id: RefId, peer: ProcId },
    /// Bind the local global-object instance into the cluster cycle.
    InitGlobalObject { rids: Vec<RefId> },
}

// ---------------------------------------------------------------------------
// Results and notification
// ---------------------------------------------------------------------------

/// A completed item's stored result.
pub(crate) enum StoredResult {
    /// An ordinary value.
    Plain(Value),
    /// A global object, held weakly so local disappearance of the
    /// instance is detectable.
    GlobalWeak(Weak<GlobalInner>),
}

impl std::fmt::Debug for StoredResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain(v) => f.debug_tuple("Plain").field(v).finish(),
            Self::GlobalWeak(_) => f.write_str("GlobalWeak"),
        }
    }
}

/// Where a completion notice goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NotifySink {
    /// A remote waiter: send `RESULT` on the connection to this peer.
    Peer(ProcId),
    /// A local waiter parked in the waiting table.
    Local,
}

// ---------------------------------------------------------------------------
// WorkItem
// ---------------------------------------------------------------------------

/// Owner-side record of one computation.
pub(crate) struct WorkItem {
    /// Identifier, for items registered in the reference registry.
    /// `None` for fire-and-forget and root items.
    pub(crate) id: Option<RefId>,
    /// The thunk, until the item is started.
    pub(crate) thunk: Option<Thunk>,
    /// The running or suspended task, once started.
    pub(crate) task: Option<TaskSlot>,
    /// Monotone completion flag.
    pub(crate) done: bool,
    /// Result, present iff `done`.
    pub(crate) result: Option<StoredResult>,
    /// Value to resume the suspended task with on its next turn.
    pub(crate) resume: Option<Value>,
    /// Parties awaiting completion: `(sink, verb)` pairs.
    pub(crate) notify: Vec<(NotifySink, Verb)>,
    /// Processes currently holding a strong handle to this item.
    pub(crate) clients: BTreeSet<ProcId>,
}

impl WorkItem {
    /// An item created by an incoming or local `CALL`.
    pub(crate) fn new_call(id: RefId, thunk: Thunk) -> Self {
        Self {
            id: Some(id),
            thunk: Some(thunk),
            task: None,
            done: false,
            result: None,
            resume: None,
            notify: Vec::new(),
            clients: BTreeSet::new(),
        }
    }

    /// An item for a `SYNC`/`FETCH`/`add_client` that arrived before its
    /// `CALL` (third-party forwarding). The later `CALL` fills the thunk.
    pub(crate) fn placeholder(id: RefId) -> Self {
        Self {
            id: Some(id),
            thunk: None,
            task: None,
            done: false,
            result: None,
            resume: None,
            notify: Vec::new(),
            clients: BTreeSet::new(),
        }
    }

    /// An unregistered item driving an already-started task (the
    /// `block_on` root).
    pub(crate) fn rooted(task: TaskSlot) -> Self {
        Self {
            id: None,
            thunk: None,
            task: Some(task),
            done: false,
            result: None,
            resume: None,
            notify: Vec::new(),
            clients: BTreeSet::new(),
        }
    }

    /// An unregistered item: fire-and-forget work.
    pub(crate) fn detached(thunk: Thunk) -> Self {
        Self {
            id: None,
            thunk: Some(thunk),
            task: None,
            done: false,
            result: None,
            resume: None,
            notify: Vec::new(),
            clients: BTreeSet::new(),
        }
    }

    /// Marks the item complete. `done` is monotone; the result is never
    /// replaced once set (the one exception, re-wrapping a global result
    /// weakly, happens before any waiter is notified).
    pub(crate) fn mark_done(&mut self, result: StoredResult) {
        debug_assert!(!self.done, "work item completed twice");
        self.done = true;
        self.result = Some(result);
    }

    /// Drains the notify list for delivery.
    pub(crate) fn take_notify(&mut self) -> Vec<(NotifySink, Verb)> {
        std::mem::take(&mut self.notify)
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.id)
            .field("done", &self.done)
            .field("clients", &self.clients)
            .field("waiters", &self.notify.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// WorkQueue
// ---------------------------------------------------------------------------

/// FIFO queue of runnable items.
#[derive(Default)]
pub(crate) struct WorkQueue {
    items: VecDeque<ItemRef>,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, item: ItemRef) {
        self.items.push_back(item);
    }

    pub(crate) fn pop(&mut self) -> Option<ItemRef> {
        self.items.pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}

// ---------------------------------------------------------------------------
// WaitTable
// ---------------------------------------------------------------------------

/// Local tasks suspended on a remote identifier.
#[derive(Default)]
pub(crate) struct WaitTable {
    map: HashMap<RefKey, Vec<(Verb, ItemRef)>>,
}

impl WaitTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Parks `item` until a result for `(verb, key)` arrives.
    pub(crate) fn park(&mut self, key: RefKey, verb: Verb, item: ItemRef) {
        self.map.entry(key).or_default().push((verb, item));
    }

    /// Delivers a result: removes the first waiter on `key` whose verb
    /// matches, binds `value` as its resumption argument, and returns it
    /// for re-enqueueing. `None` if no waiter matches.
    pub(crate) fn deliver(&mut self, key: RefKey, verb: Verb, value: Value) -> Option<ItemRef> {
        let waiters = self.map.get_mut(&key)?;
        let pos = waiters.iter().position(|(v, _)| *v == verb)?;
        let (_, item) = waiters.remove(pos);
        if waiters.is_empty() {
            self.map.remove(&key);
        }
        item.borrow_mut().resume = Some(value);
        Some(item)
    }

    /// Number of tasks currently suspended on `key`.
    pub(crate) fn waiting_on(&self, key: RefKey) -> usize {
        self.map.get(&key).map_or(0, Vec::len)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
