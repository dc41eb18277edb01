//! Cooperative task execution.
//!
//! A work item's thunk runs as a stored future polled by the event loop.
//! The single suspension point is awaiting a remote identifier: the await
//! future publishes a `WaitFor(verb, oid)` request through the task's
//! [`Gate`] and returns `Pending`; the scheduler parks the item on the
//! waiting table, and when the result arrives the item is re-enqueued
//! with the value, which the await future yields back into the thunk on
//! its next poll.
//!
//! A thunk that fails — by returning a fault or by panicking — produces
//! the fault as the item's result; its future is discarded and never
//! polled again.

use crate::types::{ProcId, RefId, Verb};
use crate::value::{Fault, Value};
use std::cell::RefCell;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Communication cell between a task's await futures and the scheduler.
#[derive(Debug)]
pub(crate) enum Gate {
    /// Running normally; a bare `Pending` means a voluntary yield.
    Idle,
    /// The task is suspended awaiting `(verb, oid)`.
    Wait(Verb, RefId),
    /// A result arrived; the next poll hands it to the await future.
    Resumed(Value),
}

pub(crate) type GateRef = Rc<RefCell<Gate>>;

pub(crate) fn new_gate() -> GateRef {
    Rc::new(RefCell::new(Gate::Idle))
}

// ---------------------------------------------------------------------------
// Await futures
// ---------------------------------------------------------------------------

/// Future that suspends the current task on a remote identifier.
///
/// The caller must have arranged for a result to be delivered (notify
/// list entry or outbound `SYNC`/`FETCH`) *before* awaiting this.
pub(crate) struct AwaitResult {
    gate: GateRef,
    verb: Verb,
    id: RefId,
    registered: bool,
}

impl AwaitResult {
    pub(crate) fn new(gate: GateRef, verb: Verb, id: RefId) -> Self {
        Self {
            gate,
            verb,
            id,
            registered: false,
        }
    }
}

impl Future for AwaitResult {
    type Output = Value;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.registered {
            self.registered = true;
            *self.gate.borrow_mut() = Gate::Wait(self.verb, self.id);
            return Poll::Pending;
        }
        let mut gate = self.gate.borrow_mut();
        match std::mem::replace(&mut *gate, Gate::Idle) {
            Gate::Resumed(value) => Poll::Ready(value),
            other => {
                // Spurious poll before the result arrived.
                *gate = other;
                Poll::Pending
            }
        }
    }
}

/// Future that yields the processor for one scheduler turn.
pub(crate) struct YieldNow {
    yielded: bool,
}

impl YieldNow {
    pub(crate) const fn new() -> Self {
        Self { yielded: false }
    }
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            Poll::Pending
        }
    }
}

// ---------------------------------------------------------------------------
// TaskSlot
// ---------------------------------------------------------------------------

/// Outcome of giving a task one turn.
#[derive(Debug)]
pub(crate) enum Turn {
    /// The thunk finished (value or fault).
    Done(Result<Value, Fault>),
    /// The thunk suspended on `(verb, oid)`: park it on the waiting
    /// table.
    Wait(Verb, RefId),
    /// The thunk yielded without waiting: re-enqueue it.
    Yielded,
}

/// A started thunk: the stored future plus its gate.
pub(crate) struct TaskSlot {
    future: Pin<Box<dyn Future<Output = Result<Value, Fault>>>>,
    gate: GateRef,
    /// Where the thunk runs, for fault attribution.
    origin: ProcId,
    /// Computation name, for fault attribution and diagnostics.
    label: String,
}

impl TaskSlot {
    pub(crate) fn new(
        future: Pin<Box<dyn Future<Output = Result<Value, Fault>>>>,
        gate: GateRef,
        origin: ProcId,
        label: impl Into<String>,
    ) -> Self {
        Self {
            future,
            gate,
            origin,
            label: label.into(),
        }
    }

    /// Binds the resumption value for the next turn.
    pub(crate) fn resume_with(&mut self, value: Value) {
        *self.gate.borrow_mut() = Gate::Resumed(value);
    }

    /// Polls the thunk for one turn. A panic inside the thunk is caught
    /// and reported as a fault; the future must not be polled again
    /// afterwards (the caller discards the slot on `Done`).
    pub(crate) fn turn(&mut self) -> Turn {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let polled = catch_unwind(AssertUnwindSafe(|| self.future.as_mut().poll(&mut cx)));
        match polled {
            Ok(Poll::Ready(result)) => Turn::Done(result),
            Ok(Poll::Pending) => {
                let gate = self.gate.borrow();
                match *gate {
                    Gate::Wait(verb, id) => Turn::Wait(verb, id),
                    _ => Turn::Yielded,
                }
            }
            Err(payload) => Turn::Done(Err(Fault::new(
                self.origin,
                self.label.clone(),
                panic_message(&payload),
            ))),
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }
}

impl std::fmt::Debug for TaskSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSlot")
            .field("label", &self.label)
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_owned()
    }
}

struct NoopWake;

impl Wake for NoopWake {
    fn wake(self: Arc<Self>) {}
}

/// The loop polls tasks directly; readiness comes from result delivery,
/// not wakers, so the waker does nothing.
fn noop_waker() -> Waker {
    Waker::from(Arc::new(NoopWake))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProcId;
    use crate::types::RefId;

    fn rid(seq: u64) -> RefId {
        RefId::new(ProcId::new(2), ProcId::new(1), seq)
    }

    fn slot(
        gate: GateRef,
        fut: impl Future<Output = Result<Value, Fault>> + 'static,
    ) -> TaskSlot {
        TaskSlot::new(Box::pin(fut), gate, ProcId::new(1), "test_thunk")
    }

    #[test]
    fn immediate_completion() {
        let gate = new_gate();
        let mut task = slot(gate, async { Ok(Value::Int(7)) });
        match task.turn() {
            Turn::Done(Ok(Value::Int(7))) => {}
            other => panic!("unexpected turn: {other:?}"),
        }
    }

    #[test]
    fn suspend_then_resume_with_value() {
        let gate = new_gate();
        let await_gate = gate.clone();
        let mut task = slot(gate, async move {
            let v = AwaitResult::new(await_gate, Verb::Fetch, rid(4)).await;
            let n = v.as_int().unwrap_or(0);
            Ok(Value::Int(n + 1))
        });

        match task.turn() {
            Turn::Wait(Verb::Fetch, id) => assert_eq!(id, rid(4)),
            other => panic!("expected wait, got {other:?}"),
        }

        task.resume_with(Value::Int(41));
        match task.turn() {
            Turn::Done(Ok(Value::Int(42))) => {}
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn yield_now_requeues_once() {
        let gate = new_gate();
        let mut task = slot(gate, async {
            YieldNow::new().await;
            Ok(Value::Unit)
        });
        assert!(matches!(task.turn(), Turn::Yielded));
        assert!(matches!(task.turn(), Turn::Done(Ok(Value::Unit))));
    }

    #[test]
    fn sequential_awaits_reuse_the_gate() {
        let gate = new_gate();
        let g = gate.clone();
        let mut task = slot(gate, async move {
            let a = AwaitResult::new(g.clone(), Verb::Fetch, rid(1)).await;
            let b = AwaitResult::new(g.clone(), Verb::Fetch, rid(2)).await;
            Ok(Value::Int(
                a.as_int().unwrap_or(0) + b.as_int().unwrap_or(0),
            ))
        });

        assert!(matches!(task.turn(), Turn::Wait(Verb::Fetch, id) if id == rid(1)));
        task.resume_with(Value::Int(10));
        assert!(matches!(task.turn(), Turn::Wait(Verb::Fetch, id) if id == rid(2)));
        task.resume_with(Value::Int(32));
        assert!(matches!(task.turn(), Turn::Done(Ok(Value::Int(42)))));
    }

    #[test]
    fn panic_becomes_fault() {
        let gate = new_gate();
        let mut task = slot(gate, async {
            assert_eq!(6 * 7, 41, "thunk exploded");
            Ok(Value::Unit)
        });
        match task.turn() {
            Turn::Done(Err(fault)) => {
                assert_eq!(fault.computation, "test_thunk");
                assert!(fault.message.contains("thunk exploded"));
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }
}
