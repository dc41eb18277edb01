//! Wire protocol: message kinds and their serialized form.
//!
//! Each frame on a peer connection carries exactly one [`Message`].
//!
//! | verb | payload | semantics |
//! |------|---------|-----------|
//! | `Hello` | `(id, locations)` | bootstrap: first message on a freshly accepted connection from the initiator |
//! | `Call` | `(oid, name, args)` | target registers a work item under `oid` and enqueues it |
//! | `Do` | `(op)` | fire-and-forget; no registry entry (named computation or control op) |
//! | `Sync` | `(oid)` | reply `Result(sync, oid, oid)` when done, or attach to the notify list |
//! | `Fetch` | `(oid)` | reply `Result(fetch, oid, value)` when done, or attach to the notify list |
//! | `Result` | `(verb, oid, value)` | deliver to the waiting table keyed by `(verb, oid)` |
//!
//! Values travel as [`WireValue`], the serializable twin of
//! [`crate::value::Value`]: live handles become bare identifiers and
//! global objects become the peer-table identifier for the destination's
//! instance. The translation (with its `add_client` bookkeeping) is the
//! runtime's job; this module is context-free serialization only.

use crate::error::{Error, ErrorKind};
use crate::group::Location;
use crate::types::{ProcId, RefId, Verb};
use crate::value::Fault;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Wire value
// ---------------------------------------------------------------------------

/// Serializable form of [`crate::value::Value`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
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
    List(Vec<WireValue>),
    /// A remote-reference handle, sent as its identifier.
    Ref(RefId),
    /// A global object, sent as the destination's own peer-table
    /// identifier.
    Global(RefId),
    /// A computation failure.
    Fault(Fault),
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A fire-and-forget operation carried by [`Message::Do`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DoOp {
    /// Run a registered computation with no registry entry.
    Named {
        /// Computation name.
        name: String,
        /// Argument values.
        args: Vec<WireValue>,
    },
    /// `peer` no longer holds a strong handle to the item `id`.
    DelClient {
        /// Identifier of the owned work item.
        id: RefId,
        /// The departing holder.
        peer: ProcId,
    },
    /// `peer` now holds a strong handle to the item `id`.
    AddClient {
        /// Identifier of the owned work item.
        id: RefId,
        /// The new holder.
        peer: ProcId,
    },
    /// First message on a dialed connection: names the dialing process so
    /// the accepting side can record the reverse direction.
    IdentifySocket {
        /// The dialing process.
        peer: ProcId,
    },
    /// Bind the local global-object instance into the cluster-wide cycle.
    InitGlobalObject {
        /// One instance identifier per process, indexed by process id.
        rids: Vec<RefId>,
    },
}

/// One wire message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Bootstrap payload: the receiver's assigned id and the cluster's
    /// location table.
    Hello {
        /// Process id assigned to the receiver.
        id: ProcId,
        /// Location of every process, indexed by process id.
        locations: Vec<Location>,
    },
    /// Create a work item under `id`, add `id.origin` to its client set,
    /// and enqueue it.
    Call {
        /// Identifier allocated by the caller.
        id: RefId,
        /// Registered computation to run.
        name: String,
        /// Argument values.
        args: Vec<WireValue>,
    },
    /// Fire-and-forget operation.
    Do {
        /// The operation.
        op: DoOp,
    },
    /// Wait for completion of `id`; resolves to the handle itself.
    Sync {
        /// The awaited identifier.
        id: RefId,
    },
    /// Wait for completion of `id`; resolves to the computed value.
    Fetch {
        /// The awaited identifier.
        id: RefId,
    },
    /// Completion notice for a previous `Sync`/`Fetch`.
    Result {
        /// Which verb this answers.
        verb: Verb,
        /// The completed identifier.
        id: RefId,
        /// The resolution value (the identifier itself for `Sync`).
        value: WireValue,
    },
}

// ---------------------------------------------------------------------------
// Encoding formats
// ---------------------------------------------------------------------------

/// Error raised while encoding or decoding a wire message.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Serialization failed.
    #[error("wire encode failed: {reason}")]
    Encode {
        /// Failure reason.
        reason: String,
    },
    /// Deserialization failed.
    #[error("wire decode failed: {reason}")]
    Decode {
        /// Failure reason.
        reason: String,
    },
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        let kind = match &e {
            WireError::Encode { .. } => ErrorKind::Encode,
            WireError::Decode { .. } => ErrorKind::Decode,
        };
        Self::new(kind).with_source(e)
    }
}

/// On-wire encoding of messages.
///
/// Bincode is the default; JSON trades compactness for a stream that can
/// be read in a packet capture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WireFormat {
    /// Compact binary encoding.
    #[default]
    Bincode,
    /// Human-readable encoding for debugging.
    Json,
}

impl WireFormat {
    /// Serializes a message to bytes.
    pub fn encode(self, message: &Message) -> Result<Vec<u8>, WireError> {
        match self {
            Self::Bincode => bincode::serialize(message).map_err(|err| WireError::Encode {
                reason: err.to_string(),
            }),
            Self::Json => serde_json::to_vec(message).map_err(|err| WireError::Encode {
                reason: err.to_string(),
            }),
        }
    }

    /// Deserializes a message from bytes.
    pub fn decode(self, bytes: &[u8]) -> Result<Message, WireError> {
        match self {
            Self::Bincode => bincode::deserialize(bytes).map_err(|err| WireError::Decode {
                reason: err.to_string(),
            }),
            Self::Json => serde_json::from_slice(bytes).map_err(|err| WireError::Decode {
                reason: err.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_messages() -> Vec<Message> {
        let oid = RefId::new(ProcId::new(2), ProcId::new(1), 7);
        vec![
            Message::Hello {
                id: ProcId::new(1),
                locations: vec![
                    Location::new("127.0.0.1", 9000),
                    Location::new("127.0.0.1", 9001),
                ],
            },
            Message::Call {
                id: oid,
                name: "square".into(),
                args: vec![WireValue::Int(12), WireValue::List(vec![WireValue::Unit])],
            },
            Message::Do {
                op: DoOp::DelClient {
                    id: oid,
                    peer: ProcId::new(1),
                },
            },
            Message::Do {
                op: DoOp::InitGlobalObject {
                    rids: vec![oid, RefId::new(ProcId::new(1), ProcId::new(0), 3)],
                },
            },
            Message::Sync { id: oid },
            Message::Fetch { id: oid },
            Message::Result {
                verb: Verb::Fetch,
                id: oid,
                value: WireValue::Fault(Fault::new(ProcId::new(2), "square", "overflow")),
            },
        ]
    }

    #[test]
    fn bincode_roundtrip() {
        for msg in sample_messages() {
            let bytes = WireFormat::Bincode.encode(&msg).unwrap();
            assert_eq!(WireFormat::Bincode.decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn json_roundtrip() {
        for msg in sample_messages() {
            let bytes = WireFormat::Json.encode(&msg).unwrap();
            assert_eq!(WireFormat::Json.decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn decode_garbage_is_an_error() {
        let err = WireFormat::Bincode.decode(&[0xFF; 3]).expect_err("garbage");
        let core: Error = err.into();
        assert_eq!(core.kind(), ErrorKind::Decode);
    }

    #[test]
    fn formats_are_not_interchangeable() {
        let msg = Message::Sync {
            id: RefId::new(ProcId::new(1), ProcId::new(0), 1),
        };
        let bytes = WireFormat::Json.encode(&msg).unwrap();
        assert!(WireFormat::Bincode.decode(&bytes).is_err());
    }
}
