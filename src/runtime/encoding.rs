//! Peer-boundary value translation.
//!
//! Live values and wire values differ exactly where distributed identity
//! matters: handles and global objects. Translating at the boundary is
//! also where the reference protocol's bookkeeping happens.
//!
//! Outbound, a handle addressed to a peer that is not the owner makes
//! the owner aware of the new holder *before* the receiver can act on
//! the handle: the `add_client` goes out (or is applied locally when the
//! sender is the owner) ahead of the message that carries the handle.
//!
//! Inbound, a handle whose owner is the receiving process takes the
//! shortcut: if the computation is done, the decoded value *is* the
//! result (the local instance, for a global object); only a still-running
//! computation yields a handle, and that is the moment the receiver adds
//! itself to the client set.

use super::Core;
use crate::error::{Error, ErrorKind, Result};
use crate::tracing_compat::{trace, warn};
use crate::types::ProcId;
use crate::value::Value;
use crate::wire::{DoOp, Message, WireValue};
use crate::work::StoredResult;
use std::rc::Rc;

impl Core {
    /// Translates `value` for transmission to `dest`, emitting handle
    /// bookkeeping as a side effect.
    pub(crate) fn encode_value_for(self: &Rc<Self>, dest: ProcId, value: &Value) -> Result<WireValue> {
        let me = self.self_id.get();
        Ok(match value {
            Value::Unit => WireValue::Unit,
            Value::Bool(v) => WireValue::Bool(*v),
            Value::Int(v) => WireValue::Int(*v),
            Value::Float(v) => WireValue::Float(*v),
            Value::Str(v) => WireValue::Str(v.clone()),
            Value::Bytes(v) => WireValue::Bytes(v.clone()),
            Value::Fault(f) => WireValue::Fault(f.clone()),
            Value::List(items) => WireValue::List(
                items
                    .iter()
                    .map(|v| self.encode_value_for(dest, v))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Ref(handle) => {
                let id = handle.id();
                if dest == id.owner {
                    // The owner inserts itself during decode.
                } else if id.owner == me {
                    // Local bookkeeping; skipped implicitly when `dest`
                    // is already in the client set.
                    self.apply_add_client(id, dest);
                } else {
                    self.send_message(
                        id.owner,
                        &Message::Do {
                            op: DoOp::AddClient { id, peer: dest },
                        },
                    )?;
                }
                WireValue::Ref(id)
            }
            Value::Global(global) => {
                let rids = global.inner_rc().peers.borrow().clone();
                if rids.is_empty() {
                    return Err(Error::new(ErrorKind::Encode)
                        .with_context("global object serialized before initialization"));
                }
                let Some(dest_rid) = rids.get(dest.index()).copied() else {
                    return Err(Error::new(ErrorKind::Encode)
                        .with_context(format!("{dest} has no global object instance")));
                };
                let own = rids.get(me.index()).copied();
                let already_held = own
                    .and_then(|own| self.lookup(own.key()))
                    .is_some_and(|item| item.borrow().clients.contains(&dest));
                if !already_held {
                    // This send introduces `dest` into the shared cycle:
                    // make it a client of every instance.
                    trace!("introducing {dest} into the global object cycle");
                    for rid in &rids {
                        if rid.owner == me {
                            self.apply_add_client(*rid, dest);
                        } else {
                            self.send_message(
                                rid.owner,
                                &Message::Do {
                                    op: DoOp::AddClient {
                                        id: *rid,
                                        peer: dest,
                                    },
                                },
                            )?;
                        }
                    }
                }
                WireValue::Global(dest_rid)
            }
        })
    }

    /// Reconstructs a value received from `src`.
    pub(crate) fn decode_value_from(self: &Rc<Self>, src: ProcId, value: WireValue) -> Result<Value> {
        let me = self.self_id.get();
        Ok(match value {
            WireValue::Unit => Value::Unit,
            WireValue::Bool(v) => Value::Bool(v),
            WireValue::Int(v) => Value::Int(v),
            WireValue::Float(v) => Value::Float(v),
            WireValue::Str(v) => Value::Str(v),
            WireValue::Bytes(v) => Value::Bytes(v),
            WireValue::Fault(f) => Value::Fault(f),
            WireValue::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|v| self.decode_value_from(src, v))
                    .collect::<Result<Vec<_>>>()?,
            ),
            WireValue::Ref(id) => {
                if id.owner == me {
                    match self.lookup(id.key()) {
                        Some(item) if item.borrow().done => {
                            // Shortcut: the value is already here. No
                            // client-set entry — no handle survives this
                            // decode to ever emit the matching removal.
                            self.result_value(&item)
                        }
                        Some(item) => {
                            item.borrow_mut().clients.insert(me);
                            Value::Ref(self.intern_ref(id))
                        }
                        None => {
                            // Reclaimed (or the call is still in flight
                            // from a third party): hold a place.
                            let item = self.lookup_or_create(id, Some(me));
                            drop(item);
                            Value::Ref(self.intern_ref(id))
                        }
                    }
                } else {
                    Value::Ref(self.intern_ref(id))
                }
            }
            WireValue::Global(rid) => {
                if rid.owner == me {
                    match self.local_global() {
                        Some(global) => {
                            // A revived instance may be backed by a
                            // placeholder item; complete it in place.
                            if let Some(item) = self.lookup(rid.key()) {
                                let weak = Rc::downgrade(global.inner_rc());
                                let mut it = item.borrow_mut();
                                if !it.done {
                                    it.mark_done(StoredResult::GlobalWeak(weak));
                                }
                            }
                            Value::Global(global)
                        }
                        None => {
                            warn!("global object reference from {src} but no local instance");
                            Value::Fault(crate::value::Fault::new(
                                me,
                                "global_object",
                                "no local global object instance",
                            ))
                        }
                    }
                } else {
                    // Transport artifact: someone forwarded a foreign
                    // peer-table entry. Treat it as an ordinary handle.
                    Value::Ref(self.intern_ref(rid))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use crate::types::ProcId;

    fn drain(rt: &Runtime) {
        for _ in 0..64 {
            if rt.core().queue.borrow().is_empty() {
                break;
            }
            rt.core().perform_work();
        }
    }

    #[test]
    fn primitives_roundtrip_locally() {
        let rt = Runtime::standalone(RuntimeConfig::default());
        let me = ProcId::CLIENT;
        let value = Value::List(vec![Value::Int(3), Value::Str("x".into()), Value::Unit]);
        let wire = rt.core().encode_value_for(me, &value).unwrap();
        let back = rt.core().decode_value_from(me, wire).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn own_done_ref_decodes_to_value() {
        let rt = Runtime::standalone(RuntimeConfig::default());
        rt.register_fn("mk", |_| Ok(Value::Int(99)));
        let handle = rt.remote_call(ProcId::CLIENT, "mk", vec![]).unwrap();
        drain(&rt);

        let wire = WireValue::Ref(handle.id());
        let back = rt.core().decode_value_from(ProcId::CLIENT, wire).unwrap();
        assert_eq!(back, Value::Int(99));
    }

    #[test]
    fn own_pending_ref_decodes_to_handle_and_adds_self() {
        let rt = Runtime::standalone(RuntimeConfig::default());
        rt.register_fn("mk", |_| Ok(Value::Int(1)));
        let handle = rt.remote_call(ProcId::CLIENT, "mk", vec![]).unwrap();
        // Not drained: the item is still pending.
        let wire = WireValue::Ref(handle.id());
        let back = rt.core().decode_value_from(ProcId::CLIENT, wire).unwrap();
        match back {
            Value::Ref(h) => assert_eq!(h, handle),
            other => panic!("expected handle, got {other:?}"),
        }
        let item = rt.core().lookup(handle.key()).expect("registered");
        assert!(item.borrow().clients.contains(&ProcId::CLIENT));
    }

    #[test]
    fn foreign_ref_interns_one_handle() {
        let rt = Runtime::standalone(RuntimeConfig::default());
        let foreign = crate::types::RefId::new(ProcId::new(9), ProcId::new(9), 1);
        let a = rt
            .core()
            .decode_value_from(ProcId::CLIENT, WireValue::Ref(foreign))
            .unwrap();
        let b = rt
            .core()
            .decode_value_from(ProcId::CLIENT, WireValue::Ref(foreign))
            .unwrap();
        match (a, b) {
            (Value::Ref(x), Value::Ref(y)) => assert_eq!(x, y),
            other => panic!("expected handles, got {other:?}"),
        }
    }
}
