//! The self-describing value model exchanged between processes.
//!
//! [`Value`] is the in-memory form: it can hold live remote-reference
//! handles and global-object instances, which only make sense inside one
//! process. The serializable twin lives in [`crate::wire`]; translation
//! between the two happens at the peer boundary, where the handle
//! bookkeeping (`add_client` emission, owner-side shortcuts) is applied.
//!
//! A failed computation produces a [`Fault`], which travels in the result
//! slot like any other value: waiters unblock and observe the failure
//! instead of hanging.

use crate::global::GlobalObject;
use crate::handle::RemoteRef;
use crate::types::ProcId;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A value that can be passed to, returned from, or awaited on a remote
/// computation.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// The unit value.
    Unit,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Heterogeneous list.
    List(Vec<Value>),
    /// A strong handle to a remote computation.
    Ref(RemoteRef),
    /// A replicated global object (resolves to the local instance on
    /// every process).
    Global(GlobalObject),
    /// A computation failure delivered in place of a result.
    Fault(Fault),
}

impl Value {
    /// Returns the integer payload, if this is an `Int`.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the float payload, if this is a `Float`.
    #[must_use]
    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string payload, if this is a `Str`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the list payload, if this is a `List`.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the handle, if this is a `Ref`.
    #[must_use]
    pub const fn as_ref_handle(&self) -> Option<&RemoteRef> {
        match self {
            Self::Ref(r) => Some(r),
            _ => None,
        }
    }

    /// Returns true if this value is a computation failure.
    #[must_use]
    pub const fn is_fault(&self) -> bool {
        matches!(self, Self::Fault(_))
    }

    /// Extracts the failure, if this value is one.
    #[must_use]
    pub fn into_fault(self) -> Option<Fault> {
        match self {
            Self::Fault(f) => Some(f),
            _ => None,
        }
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Self::Unit
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

impl From<RemoteRef> for Value {
    fn from(v: RemoteRef) -> Self {
        Self::Ref(v)
    }
}

impl From<Fault> for Value {
    fn from(v: Fault) -> Self {
        Self::Fault(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit => write!(f, "()"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v:?}"),
            Self::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Self::List(v) => {
                write!(f, "[")?;
                for (i, item) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Ref(r) => write!(f, "{}", r.id()),
            Self::Global(_) => write!(f, "<global>"),
            Self::Fault(e) => write!(f, "{e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Fault
// ---------------------------------------------------------------------------

/// A computation failure, delivered to waiters in place of a result.
///
/// Carries the process where the failure happened, the computation name,
/// and a human-readable message. Faults are ordinary values on the wire:
/// a `fetch` of a failed computation returns the fault rather than
/// hanging or tearing down the connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    /// Process the computation ran on.
    pub origin: ProcId,
    /// Name of the failed computation.
    pub computation: String,
    /// Failure description.
    pub message: String,
}

impl Fault {
    /// Creates a fault record.
    #[must_use]
    pub fn new(origin: ProcId, computation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            origin,
            computation: computation.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fault in `{}` on {}: {}",
            self.computation, self.origin, self.message
        )
    }
}

impl std::error::Error for Fault {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_match_variants() {
        assert_eq!(Value::Int(41).as_int(), Some(41));
        assert_eq!(Value::Unit.as_int(), None);
        assert_eq!(Value::Str("hi".into()).as_str(), Some("hi"));
        let list = Value::List(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(list.as_list().map(<[Value]>::len), Some(2));
    }

    #[test]
    fn fault_is_a_value_not_an_error() {
        let fault = Fault::new(ProcId::new(2), "boom_op", "boom");
        let value = Value::from(fault.clone());
        assert!(value.is_fault());
        assert_eq!(value.into_fault(), Some(fault));
    }

    #[test]
    fn display_is_compact() {
        let v = Value::List(vec![Value::Int(1), Value::Str("x".into())]);
        assert_eq!(v.to_string(), "[1, \"x\"]");
        let f = Fault::new(ProcId::new(3), "op", "bad input");
        assert_eq!(f.to_string(), "fault in `op` on P3: bad input");
    }
}
