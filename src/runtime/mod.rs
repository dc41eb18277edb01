//! The per-process runtime: scheduler state, remote invocation, and the
//! distributed reference protocol.
//!
//! One [`Runtime`] is one process of the cluster. Everything it owns —
//! reference registry, work queue, waiting table, peer connections — is
//! exclusively driven by the event-loop thread; no locking anywhere.
//! Parallelism comes from running many processes, never from threads
//! inside one.
//!
//! # Structure
//!
//! - this module: shared state ([`Core`]), handle interning and release,
//!   client-set bookkeeping, `remote_call`/`remote_do`, wait setup
//! - [`event_loop`]: the poll/dispatch/`perform_work` cycle and cluster
//!   bootstrap
//! - [`encoding`]: peer-boundary translation between live values and
//!   their wire form, where `add_client` emission and the owner-side
//!   decode shortcut live
//! - [`ctx`]: the capability handed to computations ([`TaskCtx`])

pub(crate) mod ctx;
pub(crate) mod encoding;
pub(crate) mod event_loop;

pub use ctx::TaskCtx;

use crate::config::RuntimeConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::global::{GlobalInner, GlobalObject, GlobalSlot, GlobalUser};
use crate::group::{Connection, ProcGroup};
use crate::handle::{RefInner, RemoteRef};
use crate::registry::{ComputationName, ComputationRegistry};
use crate::tracing_compat::{debug, trace, warn};
use crate::types::{ProcId, RefId, RefKey, Verb};
use crate::value::{Fault, Value};
use crate::wire::{DoOp, Message};
use crate::work::{ItemRef, StoredResult, Thunk, WaitTable, WorkItem, WorkQueue};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::net::TcpListener;
use std::rc::{Rc, Weak};

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

/// Process-wide runtime state.
///
/// Held behind `Rc` and reached from handles, task contexts, and
/// finalizers through weak back-pointers. Each concern sits in its own
/// cell so that a finalizer running inside one borrow never needs the
/// same cell again.
pub(crate) struct Core {
    pub(crate) config: RuntimeConfig,
    pub(crate) self_weak: Weak<Core>,
    pub(crate) self_id: Cell<ProcId>,
    seq: Cell<u64>,
    pub(crate) group: RefCell<Option<ProcGroup>>,
    /// The reference registry: locally-owned work items, keyed by
    /// `(origin, seq)`. An item is present iff its client set is
    /// non-empty.
    pub(crate) registry: RefCell<HashMap<RefKey, ItemRef>>,
    pub(crate) queue: RefCell<WorkQueue>,
    pub(crate) waiting: RefCell<WaitTable>,
    /// Handle-uniquing table: at most one live strong handle per
    /// identifier per process.
    handles: RefCell<HashMap<RefKey, Weak<RefInner>>>,
    pub(crate) computations: RefCell<ComputationRegistry>,
    pub(crate) global: RefCell<Option<GlobalSlot>>,
    /// Suppresses the global-object drop broadcast while the runtime
    /// itself swaps the instance's strong anchors around.
    pub(crate) global_drop_muted: Cell<bool>,
    pub(crate) listener: RefCell<Option<TcpListener>>,
    /// Accepted connections awaiting their first (classifying) message,
    /// with the claimed peer id once an `identify_socket` arrived before
    /// the group was formed.
    pub(crate) pending: RefCell<Vec<(Connection, Option<ProcId>)>>,
    pub(crate) shutdown: Cell<bool>,
}

impl Core {
    fn new(config: RuntimeConfig) -> Rc<Self> {
        let core = Rc::new_cyclic(|self_weak| Self {
            config,
            self_weak: self_weak.clone(),
            self_id: Cell::new(ProcId::CLIENT),
            seq: Cell::new(0),
            group: RefCell::new(None),
            registry: RefCell::new(HashMap::new()),
            queue: RefCell::new(WorkQueue::new()),
            waiting: RefCell::new(WaitTable::new()),
            handles: RefCell::new(HashMap::new()),
            computations: RefCell::new(ComputationRegistry::new()),
            global: RefCell::new(None),
            global_drop_muted: Cell::new(false),
            listener: RefCell::new(None),
            pending: RefCell::new(Vec::new()),
            shutdown: Cell::new(false),
        });
        core.register_builtins();
        core
    }

    fn register_builtins(self: &Rc<Self>) {
        self.computations
            .borrow_mut()
            .register("empty_global_object", |ctx: TaskCtx, _args| async move {
                let Some(oid) = ctx.oid else {
                    return Err(Fault::new(
                        ctx.self_id(),
                        "empty_global_object",
                        "must be invoked as a call, not fire-and-forget",
                    ));
                };
                let inner = Rc::new(GlobalInner::unbound(oid));
                let user = Rc::new(GlobalUser {
                    inner: Rc::clone(&inner),
                    core: ctx.core.self_weak.clone(),
                });
                let mut slot = GlobalSlot::new(&inner);
                slot.user = Rc::downgrade(&user);
                slot.anchor = Some(Rc::clone(&user));
                let previous = ctx.core.global.borrow_mut().replace(slot);
                if previous.is_some() {
                    debug!("replacing an existing global object instance");
                }
                drop(previous);
                Ok(Value::Global(GlobalObject::from_user(user)))
            });
    }

    // -- identifiers and handles --------------------------------------------

    /// Allocates a fresh identifier for a computation owned by `target`.
    pub(crate) fn alloc_ref(&self, target: ProcId) -> RefId {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        RefId::new(target, self.self_id.get(), seq)
    }

    /// Returns the process-local strong handle for `id`, creating it if
    /// none is live. Two interns of the same identifier yield the same
    /// handle, so its eventual release emits exactly one `del_client`.
    pub(crate) fn intern_ref(&self, id: RefId) -> RemoteRef {
        let mut handles = self.handles.borrow_mut();
        if let Some(existing) = handles.get(&id.key()).and_then(Weak::upgrade) {
            return RemoteRef::from_inner(existing);
        }
        let inner = Rc::new(RefInner {
            id,
            core: self.self_weak.clone(),
        });
        handles.insert(id.key(), Rc::downgrade(&inner));
        RemoteRef::from_inner(inner)
    }

    /// Called by a handle's finalizer: the last local strong holder of
    /// `id` is gone.
    pub(crate) fn release_handle(&self, id: RefId) {
        self.handles.borrow_mut().remove(&id.key());
        if self.shutdown.get() {
            return;
        }
        let me = self.self_id.get();
        if id.owner == me {
            self.apply_del_client(id, me);
        } else if let Err(err) = self.send_message(
            id.owner,
            &Message::Do {
                op: DoOp::DelClient { id, peer: me },
            },
        ) {
            trace!("del_client for {id} not delivered: {err}");
        }
    }

    // -- reference registry -------------------------------------------------

    /// Fetches the work item for `id`, creating a placeholder when a
    /// third-party `sync`/`fetch`/`add_client` outran the `call`.
    pub(crate) fn lookup_or_create(&self, id: RefId, seed_client: Option<ProcId>) -> ItemRef {
        let mut registry = self.registry.borrow_mut();
        let item = registry.entry(id.key()).or_insert_with(|| {
            trace!("materializing placeholder for {id}");
            Rc::new(RefCell::new(WorkItem::placeholder(id)))
        });
        if let Some(peer) = seed_client {
            item.borrow_mut().clients.insert(peer);
        }
        Rc::clone(item)
    }

    pub(crate) fn lookup(&self, key: RefKey) -> Option<ItemRef> {
        self.registry.borrow().get(&key).cloned()
    }

    /// Adds `peer` to the client set of the local item `id`.
    pub(crate) fn apply_add_client(&self, id: RefId, peer: ProcId) {
        let item = self.lookup_or_create(id, Some(peer));
        drop(item);
    }

    /// Removes `peer` from the client set of the local item `id`; when
    /// the set empties the item leaves the registry.
    pub(crate) fn apply_del_client(&self, id: RefId, peer: ProcId) {
        let removed = {
            let mut registry = self.registry.borrow_mut();
            let Some(item) = registry.get(&id.key()) else {
                return;
            };
            let emptied = {
                let mut it = item.borrow_mut();
                it.clients.remove(&peer);
                it.clients.is_empty()
            };
            if emptied {
                registry.remove(&id.key())
            } else {
                None
            }
        };
        if let Some(item) = removed {
            trace!("reclaiming {id}: no clients remain");
            let was_global = matches!(item.borrow().result, Some(StoredResult::GlobalWeak(_)));
            let anchor = if was_global {
                // Last participant left: release the instance pin and
                // the process-lifetime user hold.
                match self.global.borrow_mut().as_mut() {
                    Some(slot) => {
                        slot.pinned = None;
                        slot.anchor.take()
                    }
                    None => None,
                }
            } else {
                None
            };
            // Dropping the item (and anchor) here, outside every
            // borrow, lets values inside release their own handles.
            drop(anchor);
            drop(item);
        }
    }

    // -- remote invocation --------------------------------------------------

    /// Submits `name(args)` to `target` and returns the handle
    /// synchronously.
    pub(crate) fn remote_call(
        self: &Rc<Self>,
        target: ProcId,
        name: ComputationName,
        args: Vec<Value>,
    ) -> Result<RemoteRef> {
        self.check_peer(target)?;
        let me = self.self_id.get();
        let id = self.alloc_ref(target);
        if target == me {
            let item = Rc::new(RefCell::new(WorkItem::new_call(
                id,
                Thunk::Computation { name, args },
            )));
            item.borrow_mut().clients.insert(me);
            self.registry.borrow_mut().insert(id.key(), Rc::clone(&item));
            self.enqueue(item);
        } else {
            let wire_args = args
                .iter()
                .map(|v| self.encode_value_for(target, v))
                .collect::<Result<Vec<_>>>()?;
            self.send_message(
                target,
                &Message::Call {
                    id,
                    name: name.as_str().to_owned(),
                    args: wire_args,
                },
            )?;
        }
        Ok(self.intern_ref(id))
    }

    /// Fire-and-forget: `target` runs `name(args)` with no registry
    /// entry and no handle.
    pub(crate) fn remote_do(
        self: &Rc<Self>,
        target: ProcId,
        name: ComputationName,
        args: Vec<Value>,
    ) -> Result<()> {
        self.check_peer(target)?;
        if target == self.self_id.get() {
            let item = Rc::new(RefCell::new(WorkItem::detached(Thunk::Computation {
                name,
                args,
            })));
            self.enqueue(item);
            Ok(())
        } else {
            let wire_args = args
                .iter()
                .map(|v| self.encode_value_for(target, v))
                .collect::<Result<Vec<_>>>()?;
            self.send_message(
                target,
                &Message::Do {
                    op: DoOp::Named {
                        name: name.as_str().to_owned(),
                        args: wire_args,
                    },
                },
            )
        }
    }

    fn check_peer(&self, target: ProcId) -> Result<()> {
        let group = self.group.borrow();
        let group = group
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::NoGroup).with_context("cluster not formed"))?;
        if group.contains(target) {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::UnknownPeer).with_context(format!("{target} not in group")))
        }
    }

    // -- waiting ------------------------------------------------------------

    /// Sets up a `sync`/`fetch` on `id` for the current task.
    ///
    /// Either the answer is already at hand, or a notify-list entry /
    /// outbound request now exists and the caller must park on the
    /// waiting table.
    pub(crate) fn begin_wait(self: &Rc<Self>, verb: Verb, id: RefId) -> WaitPlan {
        let me = self.self_id.get();
        if id.owner == me {
            let Some(item) = self.lookup(id.key()) else {
                // All clients dropped; nothing will ever answer.
                return WaitPlan::Immediate(Value::Fault(Fault::new(
                    me,
                    verb.to_string(),
                    format!("{id} already reclaimed"),
                )));
            };
            let done = item.borrow().done;
            if done {
                WaitPlan::Immediate(self.verb_value(verb, id, &item))
            } else {
                item.borrow_mut()
                    .notify
                    .push((crate::work::NotifySink::Local, verb));
                WaitPlan::Park
            }
        } else {
            let request = match verb {
                Verb::Sync => Message::Sync { id },
                Verb::Fetch => Message::Fetch { id },
            };
            match self.send_message(id.owner, &request) {
                Ok(()) => WaitPlan::Park,
                Err(err) => WaitPlan::Immediate(Value::Fault(Fault::new(
                    me,
                    verb.to_string(),
                    format!("cannot reach owner of {id}: {err}"),
                ))),
            }
        }
    }

    /// The value a completed item resolves to under `verb`.
    pub(crate) fn verb_value(self: &Rc<Self>, verb: Verb, id: RefId, item: &ItemRef) -> Value {
        match verb {
            Verb::Sync => Value::Ref(self.intern_ref(id)),
            Verb::Fetch => self.result_value(item),
        }
    }

    /// Clones a completed item's result out, resolving the global-object
    /// weak box to the live local instance.
    pub(crate) fn result_value(self: &Rc<Self>, item: &ItemRef) -> Value {
        let stored = {
            let it = item.borrow();
            match it.result {
                Some(StoredResult::Plain(ref v)) => return v.clone(),
                Some(StoredResult::GlobalWeak(_)) => None,
                None => Some(Value::Fault(Fault::new(
                    self.self_id.get(),
                    "result",
                    "work item completed without a result",
                ))),
            }
        };
        if let Some(fallback) = stored {
            return fallback;
        }
        match self.local_global() {
            Some(global) => Value::Global(global),
            None => Value::Fault(Fault::new(
                self.self_id.get(),
                "result",
                "global object instance is gone",
            )),
        }
    }

    // -- global object ------------------------------------------------------

    /// The process's global-object instance as a user value, reviving a
    /// locally-dropped instance from the recorded identifiers.
    pub(crate) fn local_global(self: &Rc<Self>) -> Option<GlobalObject> {
        let user = {
            let mut slot_cell = self.global.borrow_mut();
            let slot = slot_cell.as_mut()?;
            let inner = match slot.instance.upgrade() {
                Some(inner) => inner,
                None => {
                    let me = self.self_id.get();
                    let home = *slot.rids.get(me.index())?;
                    debug!("reviving global object instance for {home}");
                    let inner = Rc::new(GlobalInner::unbound(home));
                    inner.bind(slot.rids.clone());
                    slot.instance = Rc::downgrade(&inner);
                    slot.pinned = Some(Rc::clone(&inner));
                    inner
                }
            };
            match slot.user.upgrade() {
                Some(user) => user,
                None => {
                    let user = Rc::new(GlobalUser {
                        inner,
                        core: self.self_weak.clone(),
                    });
                    slot.user = Rc::downgrade(&user);
                    if slot.anchor.is_none() {
                        slot.anchor = Some(Rc::clone(&user));
                    }
                    user
                }
            }
        };
        Some(GlobalObject::from_user(user))
    }

    /// Finalizer of the last local user reference to the global object:
    /// withdraw this process from every instance's client set.
    pub(crate) fn global_user_dropped(&self, inner: &Rc<GlobalInner>) {
        if self.shutdown.get() || self.global_drop_muted.get() {
            return;
        }
        let rids = inner.peers.borrow().clone();
        if rids.is_empty() {
            // Never bound into the cycle; nothing was seeded.
            return;
        }
        let me = self.self_id.get();
        let Some(own) = rids.get(me.index()).copied() else {
            return;
        };
        let still_client = self
            .lookup(own.key())
            .is_some_and(|item| item.borrow().clients.contains(&me));
        if !still_client {
            return;
        }
        debug!("global object unused locally; withdrawing from peer client sets");
        for rid in rids {
            if rid.owner == me {
                self.apply_del_client(rid, me);
            } else if let Err(err) = self.send_message(
                rid.owner,
                &Message::Do {
                    op: DoOp::DelClient { id: rid, peer: me },
                },
            ) {
                trace!("global del_client for {rid} not delivered: {err}");
            }
        }
    }

    /// Binds the local instance into the cluster-wide cycle.
    pub(crate) fn apply_init_global(self: &Rc<Self>, rids: Vec<RefId>) {
        let me = self.self_id.get();
        let Some(own) = rids.get(me.index()).copied() else {
            warn!("init_global_object with a table that lacks this process");
            return;
        };
        let instance = {
            let mut slot_cell = self.global.borrow_mut();
            let Some(slot) = slot_cell.as_mut() else {
                warn!("init_global_object before empty_global_object");
                return;
            };
            slot.rids.clone_from(&rids);
            slot.instance.clone()
        };
        if let Some(inner) = instance.upgrade() {
            inner.bind(rids.clone());
        }
        let Some(item) = self.lookup(own.key()) else {
            warn!("global instance item {own} missing from registry");
            return;
        };
        // Re-wrap the stored result weakly. The strong user wrapper the
        // constructor returned dies here; mute its finalizer — this is a
        // representation change, not local disuse.
        self.global_drop_muted.set(true);
        let old = {
            let mut it = item.borrow_mut();
            it.result.replace(StoredResult::GlobalWeak(instance))
        };
        drop(old);
        self.global_drop_muted.set(false);
        // Seed the known-topology cycle: every process participates.
        let n = u32::try_from(rids.len()).unwrap_or(u32::MAX);
        let mut it = item.borrow_mut();
        for p in 0..n {
            it.clients.insert(ProcId::new(p));
        }
    }

    // -- plumbing -----------------------------------------------------------

    pub(crate) fn enqueue(&self, item: ItemRef) {
        self.queue.borrow_mut().push(item);
    }

    /// Serializes `message` and queues it on the connection to `peer`,
    /// flushing opportunistically.
    pub(crate) fn send_message(&self, peer: ProcId, message: &Message) -> Result<()> {
        if self.shutdown.get() {
            return Err(Error::new(ErrorKind::Shutdown));
        }
        let bytes = self.config.wire_format.encode(message).map_err(Error::from)?;
        let mut group = self.group.borrow_mut();
        let group = group
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::NoGroup).with_context("cluster not formed"))?;
        let conn = group.conn_mut(peer)?;
        conn.queue_frame(&bytes)?;
        conn.try_flush()
    }

    /// Drops every cycle-forming structure so the core itself can die.
    pub(crate) fn teardown(&self) {
        self.shutdown.set(true);
        let registry: Vec<ItemRef> = {
            let mut reg = self.registry.borrow_mut();
            reg.drain().map(|(_, item)| item).collect()
        };
        let queue = std::mem::take(&mut *self.queue.borrow_mut());
        let waiting = std::mem::take(&mut *self.waiting.borrow_mut());
        let global = self.global.borrow_mut().take();
        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        let group = self.group.borrow_mut().take();
        let listener = self.listener.borrow_mut().take();
        drop((registry, queue, waiting, global, pending, group, listener));
    }
}

/// Outcome of setting up a wait.
pub(crate) enum WaitPlan {
    /// The answer is already known.
    Immediate(Value),
    /// Park on the waiting table; a result will be delivered.
    Park,
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// One process of the cluster.
///
/// Construct it, register the computations this process is willing to
/// run, then either [`bootstrap`](Runtime::bootstrap) a cluster (the
/// initiator), [`serve`](Runtime::serve) as a worker, or stay
/// [`standalone`](Runtime::standalone) for local use.
pub struct Runtime {
    core: Rc<Core>,
}

impl Runtime {
    /// Creates a runtime with the given configuration. No process group
    /// exists yet.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            core: Core::new(config),
        }
    }

    /// Creates a single-process runtime: a group of one, no sockets.
    /// Remote operations targeting the local process work as usual.
    #[must_use]
    pub fn standalone(config: RuntimeConfig) -> Self {
        let rt = Self::new(config);
        let group = ProcGroup::new(
            ProcId::CLIENT,
            vec![crate::group::Location::new("127.0.0.1", 0)],
        );
        *rt.core.group.borrow_mut() = Some(group);
        rt
    }

    /// This process's id (0 until a worker learns its id at bootstrap).
    #[must_use]
    pub fn self_id(&self) -> ProcId {
        self.core.self_id.get()
    }

    /// Number of processes in the cluster, or 0 before formation.
    #[must_use]
    pub fn group_size(&self) -> usize {
        self.core.group.borrow().as_ref().map_or(0, ProcGroup::len)
    }

    /// Registers an async computation.
    pub fn register<F, Fut>(&self, name: impl Into<ComputationName>, f: F)
    where
        F: Fn(TaskCtx, Vec<Value>) -> Fut + 'static,
        Fut: Future<Output = std::result::Result<Value, Fault>> + 'static,
    {
        self.core.computations.borrow_mut().register(name, f);
    }

    /// Registers a synchronous computation.
    pub fn register_fn<F>(&self, name: impl Into<ComputationName>, f: F)
    where
        F: Fn(Vec<Value>) -> std::result::Result<Value, Fault> + 'static,
    {
        self.core.computations.borrow_mut().register_fn(name, f);
    }

    /// Submits `name(args)` to `target`; returns the handle immediately.
    pub fn remote_call(
        &self,
        target: ProcId,
        name: impl Into<ComputationName>,
        args: Vec<Value>,
    ) -> Result<RemoteRef> {
        self.core.remote_call(target, name.into(), args)
    }

    /// Fire-and-forget submission of `name(args)` to `target`.
    pub fn remote_do(
        &self,
        target: ProcId,
        name: impl Into<ComputationName>,
        args: Vec<Value>,
    ) -> Result<()> {
        self.core.remote_do(target, name.into(), args)
    }

    pub(crate) fn core(&self) -> &Rc<Core> {
        &self.core
    }

    /// Number of locally-owned work items currently registered. Each has
    /// a non-empty client set.
    #[must_use]
    pub fn registered_items(&self) -> usize {
        self.core.registry.borrow().len()
    }

    /// True if the registry holds an item for this handle's identifier.
    #[must_use]
    pub fn owns_item(&self, handle: &RemoteRef) -> bool {
        self.core.registry.borrow().contains_key(&handle.key())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.core.teardown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("self_id", &self.core.self_id.get())
            .field("group_size", &self.group_size())
            .field("registered", &self.core.registry.borrow().len())
            .finish()
    }
}
