//! The capability handed to running computations.
//!
//! A [`TaskCtx`] is how a thunk talks to its runtime: submit further
//! remote work, await handles, yield the processor. Awaiting is the one
//! suspension point — `sync` and `fetch` park the current task on the
//! waiting table and the event loop keeps going; the task resumes
//! exactly when the result arrives.

use super::event_loop::ROOT_LABEL;
use super::{Core, WaitPlan};
use crate::error::{Error, ErrorKind, Result};
use crate::global::GlobalObject;
use crate::handle::RemoteRef;
use crate::registry::ComputationName;
use crate::task::{new_gate, AwaitResult, GateRef, TaskSlot, YieldNow};
use crate::types::{ProcId, RefId, Verb};
use crate::value::{Fault, Value};
use crate::wire::{DoOp, Message};
use crate::work::WorkItem;
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

/// Execution context of one running task.
///
/// Cloning is cheap; clones share the task's suspension gate, so awaits
/// issued through any clone suspend the same task.
#[derive(Clone)]
pub struct TaskCtx {
    pub(crate) core: Rc<Core>,
    pub(crate) gate: GateRef,
    /// Identifier of the work item this task runs, if it was started by
    /// a `call` (fire-and-forget and root tasks have none).
    pub(crate) oid: Option<RefId>,
}

impl TaskCtx {
    pub(crate) fn new(core: Rc<Core>, gate: GateRef, oid: Option<RefId>) -> Self {
        Self { core, gate, oid }
    }

    /// This process's id.
    #[must_use]
    pub fn self_id(&self) -> ProcId {
        self.core.self_id.get()
    }

    /// Number of processes in the cluster.
    #[must_use]
    pub fn group_size(&self) -> usize {
        self.core
            .group
            .borrow()
            .as_ref()
            .map_or(0, crate::group::ProcGroup::len)
    }

    /// Submits `name(args)` to `target`; returns the handle immediately.
    /// The computation pipelines: the handle can be forwarded or awaited
    /// before the result exists.
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

    /// Waits until `handle`'s computation completes; resolves to the
    /// handle itself.
    pub async fn sync(&self, handle: &RemoteRef) -> RemoteRef {
        match self.wait(Verb::Sync, handle.id()).await {
            Value::Ref(resolved) => resolved,
            _ => handle.clone(),
        }
    }

    /// Waits until `handle`'s computation completes and returns its
    /// value. A failed computation yields its [`Fault`] as the value —
    /// the wait never hangs on failure.
    pub async fn fetch(&self, handle: &RemoteRef) -> Value {
        self.wait(Verb::Fetch, handle.id()).await
    }

    /// Gives the scheduler one turn without waiting on anything.
    pub async fn yield_now(&self) {
        YieldNow::new().await;
    }

    async fn wait(&self, verb: Verb, id: RefId) -> Value {
        match self.core.begin_wait(verb, id) {
            WaitPlan::Immediate(value) => value,
            WaitPlan::Park => AwaitResult::new(self.gate.clone(), verb, id).await,
        }
    }

    // -- introspection ------------------------------------------------------

    /// Number of locally-owned work items currently registered.
    #[must_use]
    pub fn registered_items(&self) -> usize {
        self.core.registry.borrow().len()
    }

    /// The client set of the locally-owned item identified by
    /// `(origin, seq)`, or `None` once it has been reclaimed.
    #[must_use]
    pub fn item_clients(&self, origin: ProcId, seq: u64) -> Option<Vec<ProcId>> {
        self.core
            .lookup(crate::types::RefKey { origin, seq })
            .map(|item| item.borrow().clients.iter().copied().collect())
    }

    /// Runs the global-object creation protocol across the cluster and
    /// returns the local instance.
    ///
    /// Every process constructs an empty instance; this process then
    /// broadcasts the full identifier table, which each peer binds into
    /// its instance's weak peer table.
    pub async fn make_global(&self) -> Result<GlobalObject> {
        let me = self.self_id();
        let n = self.group_size();
        if n == 0 {
            return Err(Error::new(ErrorKind::NoGroup).with_context("cluster not formed"));
        }
        let mut handles = Vec::with_capacity(n);
        for p in 0..n {
            let target = ProcId::new(u32::try_from(p).unwrap_or(u32::MAX));
            handles.push(self.remote_call(target, "empty_global_object", Vec::new())?);
        }
        // The local instance must exist before the table can be bound
        // into it.
        let own = handles[me.index()].clone();
        let own = self.sync(&own).await;

        let rids: Vec<RefId> = handles.iter().map(RemoteRef::id).collect();
        self.core.apply_init_global(rids.clone());
        for p in 0..n {
            let peer = ProcId::new(u32::try_from(p).unwrap_or(u32::MAX));
            if peer == me {
                continue;
            }
            self.core.send_message(
                peer,
                &Message::Do {
                    op: DoOp::InitGlobalObject { rids: rids.clone() },
                },
            )?;
        }
        match self.fetch(&own).await {
            Value::Global(global) => Ok(global),
            Value::Fault(fault) => {
                Err(Error::new(ErrorKind::Internal).with_context(fault.to_string()))
            }
            other => Err(Error::new(ErrorKind::Internal)
                .with_context(format!("global construction yielded {other}"))),
        }
    }
}

impl std::fmt::Debug for TaskCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCtx")
            .field("self_id", &self.self_id())
            .field("oid", &self.oid)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Runtime entry points that need a task context
// ---------------------------------------------------------------------------

impl super::Runtime {
    /// Forms the cluster as the initiator (process 0): connects to every
    /// worker and sends each its id and the location table.
    ///
    /// `locations[0]` is this process's own location; workers at
    /// `locations[1..]` must already be listening (dialing retries while
    /// they come up).
    pub fn bootstrap(&self, locations: Vec<crate::group::Location>) -> Result<()> {
        if locations.len() < 2 {
            return Err(Error::new(ErrorKind::Bootstrap)
                .with_context("a cluster needs the initiator and at least one worker"));
        }
        if self.core().group.borrow().is_some() {
            return Err(Error::new(ErrorKind::Bootstrap).with_context("cluster already formed"));
        }
        let core = self.core();
        core.self_id.set(ProcId::CLIENT);
        let mut group = crate::group::ProcGroup::new(ProcId::CLIENT, locations.clone());
        for (index, location) in locations.iter().enumerate().skip(1) {
            let peer = ProcId::new(u32::try_from(index).unwrap_or(u32::MAX));
            let conn = crate::group::Connection::connect(
                location,
                core.config.connect_attempts,
                core.config.connect_backoff,
                core.config.max_frame_length,
            )?;
            group.attach(peer, conn)?;
        }
        *core.group.borrow_mut() = Some(group);
        for index in 1..locations.len() {
            let peer = ProcId::new(u32::try_from(index).unwrap_or(u32::MAX));
            core.send_message(
                peer,
                &Message::Hello {
                    id: peer,
                    locations: locations.clone(),
                },
            )?;
        }
        Ok(())
    }

    /// Runs as a worker: accepts the initiator's bootstrap connection,
    /// joins the mesh, and serves until a peer connection reaches EOF.
    pub fn serve(&self, listener: std::net::TcpListener) -> Result<()> {
        listener.set_nonblocking(true)?;
        *self.core().listener.borrow_mut() = Some(listener);
        self.core().run_serve()
    }

    /// Drives the event loop until `root` completes, from code outside
    /// any task (the initiator's main flow, tests).
    ///
    /// # Errors
    ///
    /// Fails if a peer disconnects mid-run or the root future panics. A
    /// *computation* failure is not an error: it arrives as a
    /// [`Value::Fault`] wherever the root fetched it.
    pub fn block_on<F, Fut>(&self, f: F) -> Result<Value>
    where
        F: FnOnce(TaskCtx) -> Fut,
        Fut: Future<Output = Value> + 'static,
    {
        let core = self.core();
        let gate = new_gate();
        let ctx = TaskCtx::new(Rc::clone(core), gate.clone(), None);
        let me = core.self_id.get();
        let future = f(ctx);
        let slot = TaskSlot::new(
            Box::pin(async move { Ok::<Value, Fault>(future.await) }),
            gate,
            me,
            ROOT_LABEL,
        );
        let root = Rc::new(RefCell::new(WorkItem::rooted(slot)));
        core.enqueue(Rc::clone(&root));
        core.run_block_on(&root)
    }
}
