//! The event loop: socket scanning, message dispatch, and `perform_work`.
//!
//! Each iteration accepts pending connections, classifies fresh ones by
//! their first message, dispatches at most one message per peer
//! connection, flushes outbound queues, and — when the scan produced
//! nothing — runs one step of queued work. The loop sleeps only when
//! there is neither readable input nor runnable work.
//!
//! Messages from a single peer are processed in arrival order; across
//! peers they interleave in scan order. Any peer EOF ends a serving
//! loop cleanly; during `block_on` it surfaces as an error so a pending
//! wait fails instead of hanging.

use super::ctx::TaskCtx;
use super::Core;
use crate::error::{Error, ErrorKind, Result};
use crate::group::{Connection, Location, ProcGroup, ReadEvent};
use crate::task::{new_gate, TaskSlot, Turn};
use crate::tracing_compat::{debug, trace, warn};
use crate::types::{ProcId, RefId, Verb};
use crate::value::{Fault, Value};
use crate::wire::{DoOp, Message, WireValue};
use crate::work::{ControlOp, ItemRef, NotifySink, StoredResult, Thunk, WorkItem};
use std::cell::RefCell;
use std::rc::Rc;

/// Label of the task driving `block_on`; a fault attributed to it means
/// the root future itself panicked.
pub(crate) const ROOT_LABEL: &str = "__root";

/// What one loop iteration observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// Something happened: message, classification, or a work turn.
    Busy,
    /// Nothing to do; the caller may sleep.
    Idle,
    /// A peer connection reached EOF.
    Eof(ProcId),
}

enum Inbound {
    Frame(Vec<u8>),
    Nothing,
    Eof,
    Broken,
}

impl Core {
    // -- one iteration ------------------------------------------------------

    pub(crate) fn step(self: &Rc<Self>) -> Step {
        let mut busy = self.accept_pass();
        busy |= self.classify_pending();

        match self.io_pass() {
            Ok(observed_busy) => busy |= observed_busy,
            Err(eof_peer) => return Step::Eof(eof_peer),
        }
        self.flush_pass();

        if !busy {
            let has_work = !self.queue.borrow().is_empty();
            if has_work {
                self.perform_work();
                busy = true;
            }
        }
        if busy {
            Step::Busy
        } else {
            Step::Idle
        }
    }

    /// Accepts whatever the listener has queued.
    fn accept_pass(self: &Rc<Self>) -> bool {
        let mut accepted = Vec::new();
        {
            let listener = self.listener.borrow();
            let Some(listener) = listener.as_ref() else {
                return false;
            };
            loop {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        trace!("accepted connection from {addr}");
                        match Connection::from_stream(stream, self.config.max_frame_length) {
                            Ok(conn) => accepted.push((conn, None)),
                            Err(err) => warn!("failed to adopt accepted connection: {err}"),
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        warn!("accept failed: {err}");
                        break;
                    }
                }
            }
        }
        let any = !accepted.is_empty();
        self.pending.borrow_mut().extend(accepted);
        any
    }

    /// Reads first messages off unclassified connections. A `Hello`
    /// materializes the process group (worker bootstrap); an
    /// `identify_socket` records the dialing peer.
    fn classify_pending(self: &Rc<Self>) -> bool {
        if self.pending.borrow().is_empty() {
            return false;
        }
        let mut busy = false;
        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        let mut keep = Vec::new();
        for (mut conn, claimed) in pending {
            if let Some(peer) = claimed {
                // Identified before the group existed; attach once it does.
                if self.group.borrow().is_some() {
                    self.attach_peer(peer, conn);
                    busy = true;
                } else {
                    keep.push((conn, Some(peer)));
                }
                continue;
            }
            let closed = matches!(conn.try_read(), Ok(ReadEvent::Closed));
            if closed && !conn.has_buffered() {
                debug!("unclassified connection closed");
                continue;
            }
            match conn.next_frame() {
                Ok(Some(bytes)) => match self.config.wire_format.decode(&bytes) {
                    Ok(Message::Hello { id, locations }) => {
                        busy = true;
                        self.adopt_hello(id, locations, conn);
                    }
                    Ok(Message::Do {
                        op: DoOp::IdentifySocket { peer },
                    }) => {
                        busy = true;
                        if self.group.borrow().is_some() {
                            self.attach_peer(peer, conn);
                        } else {
                            keep.push((conn, Some(peer)));
                        }
                    }
                    Ok(other) => {
                        warn!("unclassified connection spoke out of turn: {other:?}");
                    }
                    Err(err) => {
                        warn!("undecodable first message: {err}");
                    }
                },
                Ok(None) => {
                    if closed {
                        debug!("unclassified connection closed mid-frame");
                    } else {
                        keep.push((conn, None));
                    }
                }
                Err(err) => {
                    warn!("bad framing on unclassified connection: {err}");
                }
            }
        }
        self.pending.borrow_mut().extend(keep);
        busy
    }

    fn attach_peer(&self, peer: ProcId, conn: Connection) {
        let mut group = self.group.borrow_mut();
        let Some(group) = group.as_mut() else {
            warn!("no group to attach {peer} to");
            return;
        };
        if let Err(err) = group.attach(peer, conn) {
            warn!("cannot attach {peer}: {err}");
        } else {
            debug!("link to {peer} established");
        }
    }

    /// Worker bootstrap: the first accepted connection carries
    /// `(my_id, locations)` from the initiator.
    fn adopt_hello(self: &Rc<Self>, id: ProcId, locations: Vec<Location>, conn: Connection) {
        if self.group.borrow().is_some() {
            warn!("second bootstrap payload ignored");
            return;
        }
        debug!("joining cluster as {id} among {}", locations.len());
        self.self_id.set(id);
        let mut group = ProcGroup::new(id, locations);
        if let Err(err) = group.attach(ProcId::CLIENT, conn) {
            warn!("cannot record initiator link: {err}");
            return;
        }
        *self.group.borrow_mut() = Some(group);
        if let Err(err) = self.open_higher_peers() {
            warn!("peer mesh incomplete: {err}");
        }
    }

    /// Dials every peer with a higher id and identifies this process, so
    /// the pair ends up with exactly one connection.
    fn open_higher_peers(self: &Rc<Self>) -> Result<()> {
        let me = self.self_id.get();
        let targets: Vec<(ProcId, Location)> = {
            let group = self.group.borrow();
            let Some(group) = group.as_ref() else {
                return Ok(());
            };
            group
                .ids()
                .filter(|p| p.raw() > me.raw())
                .map(|p| (p, group.location(p).cloned()))
                .filter_map(|(p, loc)| loc.ok().map(|l| (p, l)))
                .collect()
        };
        for (peer, location) in targets {
            let conn = Connection::connect(
                &location,
                self.config.connect_attempts,
                self.config.connect_backoff,
                self.config.max_frame_length,
            )?;
            self.attach_peer(peer, conn);
            self.send_message(
                peer,
                &Message::Do {
                    op: DoOp::IdentifySocket { peer: me },
                },
            )?;
        }
        Ok(())
    }

    /// One read-and-dispatch pass over the peer connections: at most one
    /// message per connection per iteration. `Err` carries the peer
    /// whose connection reached EOF.
    fn io_pass(self: &Rc<Self>) -> std::result::Result<bool, ProcId> {
        let ids: Vec<ProcId> = self
            .group
            .borrow()
            .as_ref()
            .map(ProcGroup::connected)
            .unwrap_or_default();
        let mut busy = false;
        for peer in ids {
            let inbound = {
                let mut group = self.group.borrow_mut();
                let Some(group) = group.as_mut() else { break };
                let Ok(conn) = group.conn_mut(peer) else {
                    continue;
                };
                match conn.try_read() {
                    Ok(ReadEvent::Closed) if !conn.has_buffered() => Inbound::Eof,
                    Ok(_) => match conn.next_frame() {
                        Ok(Some(frame)) => Inbound::Frame(frame),
                        Ok(None) => Inbound::Nothing,
                        Err(err) => {
                            warn!("oversized or corrupt frame from {peer}: {err}");
                            conn.drain_inbound();
                            Inbound::Broken
                        }
                    },
                    Err(err) => {
                        warn!("read from {peer} failed: {err}");
                        Inbound::Broken
                    }
                }
            };
            match inbound {
                Inbound::Frame(bytes) => {
                    busy = true;
                    match self.config.wire_format.decode(&bytes) {
                        Ok(message) => {
                            if let Err(err) = self.dispatch(peer, message) {
                                warn!("dispatch of message from {peer} failed: {err}");
                            }
                        }
                        Err(err) => {
                            // Frame boundaries survive but the payload is
                            // garbage; the stream cannot be trusted.
                            warn!("undecodable message from {peer}: {err}");
                            self.drop_connection(peer);
                        }
                    }
                }
                Inbound::Broken => {
                    busy = true;
                    self.drop_connection(peer);
                }
                Inbound::Eof => return Err(peer),
                Inbound::Nothing => {}
            }
        }
        Ok(busy)
    }

    fn drop_connection(&self, peer: ProcId) {
        let conn = self
            .group
            .borrow_mut()
            .as_mut()
            .and_then(|g| g.detach(peer));
        if conn.is_some() {
            warn!("dropping connection to {peer}");
        }
        drop(conn);
    }

    /// Writes whatever each outbound queue has that the socket accepts.
    fn flush_pass(&self) {
        let ids: Vec<ProcId> = self
            .group
            .borrow()
            .as_ref()
            .map(ProcGroup::connected)
            .unwrap_or_default();
        for peer in ids {
            let failed = {
                let mut group = self.group.borrow_mut();
                let Some(group) = group.as_mut() else { break };
                match group.conn_mut(peer) {
                    Ok(conn) => conn.try_flush().is_err(),
                    Err(_) => false,
                }
            };
            if failed {
                warn!("flush to {peer} failed");
                self.drop_connection(peer);
            }
        }
    }

    // -- dispatch -----------------------------------------------------------

    pub(crate) fn dispatch(self: &Rc<Self>, from: ProcId, message: Message) -> Result<()> {
        match message {
            Message::Hello { .. } => {
                warn!("bootstrap payload on an established connection");
                Ok(())
            }
            Message::Call { id, name, args } => {
                let args = args
                    .into_iter()
                    .map(|v| self.decode_value_from(from, v))
                    .collect::<Result<Vec<_>>>()?;
                let item = self.lookup_or_create(id, Some(id.origin));
                let runnable = {
                    let mut it = item.borrow_mut();
                    if it.done || it.task.is_some() || it.thunk.is_some() {
                        warn!("duplicate call for {id} ignored");
                        false
                    } else {
                        it.thunk = Some(Thunk::Computation {
                            name: name.into(),
                            args,
                        });
                        true
                    }
                };
                if runnable {
                    self.enqueue(item);
                }
                Ok(())
            }
            Message::Do { op } => self.dispatch_do(from, op),
            Message::Sync { id } => self.dispatch_wait(from, Verb::Sync, id),
            Message::Fetch { id } => self.dispatch_wait(from, Verb::Fetch, id),
            Message::Result { verb, id, value } => {
                let value = self.decode_value_from(from, value)?;
                self.deliver_local(verb, id, value);
                Ok(())
            }
        }
    }

    fn dispatch_do(self: &Rc<Self>, from: ProcId, op: DoOp) -> Result<()> {
        let thunk = match op {
            DoOp::Named { name, args } => {
                let args = args
                    .into_iter()
                    .map(|v| self.decode_value_from(from, v))
                    .collect::<Result<Vec<_>>>()?;
                Thunk::Computation {
                    name: name.into(),
                    args,
                }
            }
            DoOp::DelClient { id, peer } => Thunk::Control(ControlOp::DelClient { id, peer }),
            DoOp::AddClient { id, peer } => Thunk::Control(ControlOp::AddClient { id, peer }),
            DoOp::InitGlobalObject { rids } => {
                Thunk::Control(ControlOp::InitGlobalObject { rids })
            }
            DoOp::IdentifySocket { peer } => {
                warn!("identify_socket from {peer} on an established connection");
                return Ok(());
            }
        };
        self.enqueue(Rc::new(RefCell::new(WorkItem::detached(thunk))));
        Ok(())
    }

    fn dispatch_wait(self: &Rc<Self>, from: ProcId, verb: Verb, id: RefId) -> Result<()> {
        let item = self.lookup_or_create(id, Some(from));
        let done = item.borrow().done;
        if done {
            self.send_result_to(from, verb, id, &item);
        } else {
            item.borrow_mut().notify.push((NotifySink::Peer(from), verb));
        }
        Ok(())
    }

    // -- work ---------------------------------------------------------------

    /// Pops one item and gives it a turn: start its thunk, or resume its
    /// suspended task with the delivered value.
    pub(crate) fn perform_work(self: &Rc<Self>) {
        let Some(item) = self.queue.borrow_mut().pop() else {
            return;
        };
        let thunk_to_start = {
            let mut it = item.borrow_mut();
            if it.task.is_none() { it.thunk.take() } else { None }
        };
        if let Some(thunk) = thunk_to_start {
            match thunk {
                Thunk::Control(op) => {
                    self.execute_control(op);
                    return;
                }
                Thunk::Computation { name, args } => {
                    let computation = self.computations.borrow().get(&name);
                    let gate = new_gate();
                    let oid = item.borrow().id;
                    let me = self.self_id.get();
                    let future: crate::registry::ComputationFuture = match computation {
                        Some(computation) => {
                            let ctx = TaskCtx::new(Rc::clone(self), gate.clone(), oid);
                            (*computation)(ctx, args)
                        }
                        None => {
                            warn!("no computation registered under `{name}`");
                            let fault =
                                Fault::new(me, name.as_str(), "computation not registered");
                            Box::pin(std::future::ready(Err(fault)))
                        }
                    };
                    item.borrow_mut().task =
                        Some(TaskSlot::new(future, gate, me, name.as_str()));
                }
            }
        }
        let slot = item.borrow_mut().task.take();
        let Some(mut slot) = slot else {
            warn!("runnable item has neither thunk nor task");
            return;
        };
        let resume = item.borrow_mut().resume.take();
        if let Some(value) = resume {
            slot.resume_with(value);
        }
        match slot.turn() {
            Turn::Done(outcome) => {
                let value = match outcome {
                    Ok(value) => value,
                    Err(fault) => {
                        debug!("task `{}` failed: {fault}", slot.label());
                        Value::Fault(fault)
                    }
                };
                // The slot (and with it a failed task's stack) is
                // discarded, never resumed.
                drop(slot);
                self.complete_item(&item, value);
            }
            Turn::Wait(verb, oid) => {
                item.borrow_mut().task = Some(slot);
                self.waiting
                    .borrow_mut()
                    .park(oid.key(), verb, Rc::clone(&item));
            }
            Turn::Yielded => {
                item.borrow_mut().task = Some(slot);
                self.enqueue(item);
            }
        }
    }

    fn execute_control(self: &Rc<Self>, op: ControlOp) {
        match op {
            ControlOp::DelClient { id, peer } => self.apply_del_client(id, peer),
            ControlOp::AddClient { id, peer } => self.apply_add_client(id, peer),
            ControlOp::InitGlobalObject { rids } => self.apply_init_global(rids),
        }
    }

    /// Marks the item done and notifies every waiter.
    pub(crate) fn complete_item(self: &Rc<Self>, item: &ItemRef, value: Value) {
        {
            let mut it = item.borrow_mut();
            it.task = None;
            it.mark_done(StoredResult::Plain(value));
        }
        self.notify_done(item);
    }

    /// Drains the notify list, delivering the result to each waiter —
    /// remote over its connection, local through the waiting table.
    fn notify_done(self: &Rc<Self>, item: &ItemRef) {
        let (id, sinks) = {
            let mut it = item.borrow_mut();
            (it.id, it.take_notify())
        };
        let Some(id) = id else {
            return;
        };
        for (sink, verb) in sinks {
            match sink {
                NotifySink::Peer(peer) => self.send_result_to(peer, verb, id, item),
                NotifySink::Local => {
                    let value = self.verb_value(verb, id, item);
                    self.deliver_local(verb, id, value);
                }
            }
        }
    }

    /// Sends a `RESULT` to a remote waiter. A value that fails to
    /// serialize is replaced by the serialization fault itself so the
    /// requester unblocks.
    pub(crate) fn send_result_to(self: &Rc<Self>, peer: ProcId, verb: Verb, id: RefId, item: &ItemRef) {
        let value = self.verb_value(verb, id, item);
        let wire = match self.encode_value_for(peer, &value) {
            Ok(wire) => wire,
            Err(err) => {
                warn!("result of {id} not serializable: {err}");
                WireValue::Fault(Fault::new(
                    self.self_id.get(),
                    verb.to_string(),
                    format!("result serialization failed: {err}"),
                ))
            }
        };
        if let Err(err) = self.send_message(peer, &Message::Result { verb, id, value: wire }) {
            warn!("result of {id} not delivered to {peer}: {err}");
        }
    }

    /// Hands a result to the first matching local waiter and re-enqueues
    /// it.
    pub(crate) fn deliver_local(&self, verb: Verb, id: RefId, value: Value) {
        match self.waiting.borrow_mut().deliver(id.key(), verb, value) {
            Some(item) => self.enqueue(item),
            None => trace!("no local waiter for {verb} on {id}"),
        }
    }

    // -- loop entry points --------------------------------------------------

    /// Serves until a peer connection reaches EOF (clean worker exit).
    pub(crate) fn run_serve(self: &Rc<Self>) -> Result<()> {
        loop {
            if self.shutdown.get() {
                return Ok(());
            }
            match self.step() {
                Step::Eof(peer) => {
                    debug!("link to {peer} closed; leaving the loop");
                    return Ok(());
                }
                Step::Busy => {}
                Step::Idle => std::thread::sleep(self.config.idle_poll_interval),
            }
        }
    }

    /// Drives the loop until `root` completes; used by `block_on`.
    pub(crate) fn run_block_on(self: &Rc<Self>, root: &ItemRef) -> Result<Value> {
        loop {
            if root.borrow().done {
                break;
            }
            match self.step() {
                Step::Eof(peer) => {
                    return Err(Error::new(ErrorKind::ConnectionClosed)
                        .with_context(format!("{peer} disconnected mid-operation")))
                }
                Step::Busy => {}
                Step::Idle => std::thread::sleep(self.config.idle_poll_interval),
            }
        }
        let value = match &root.borrow().result {
            Some(StoredResult::Plain(value)) => value.clone(),
            _ => {
                return Err(Error::new(ErrorKind::Internal)
                    .with_context("root task completed without a result"))
            }
        };
        if let Value::Fault(fault) = &value {
            if fault.computation == ROOT_LABEL {
                return Err(Error::new(ErrorKind::Internal)
                    .with_context(format!("root task panicked: {}", fault.message)));
            }
        }
        Ok(value)
    }
}
