//! Core identifier types for the runtime.
//!
//! Every process in a cluster is named by a small integer [`ProcId`]
//! assigned at cluster formation (id 0 is the initiating client). Remote
//! computations are named by a [`RefId`] triple: the process that *owns*
//! the computation, the process that *originated* the call, and a
//! per-originator sequence number. Two identifiers denote the same
//! computation iff `(origin, seq)` match; the owner field is always
//! recoverable but may differ between physically distinct copies as a
//! transport artifact, so equality and hashing deliberately ignore it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

// ---------------------------------------------------------------------------
// ProcId
// ---------------------------------------------------------------------------

/// Identifier for a process in the cluster.
///
/// Process ids are assigned once at cluster formation and never reused.
/// Id 0 designates the initiating client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcId(u32);

impl ProcId {
    /// The initiating client's process id.
    pub const CLIENT: Self = Self(0);

    /// Creates a process id from a raw value.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw numeric identifier.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns true if this is the initiating client (id 0).
    #[must_use]
    pub const fn is_client(self) -> bool {
        self.0 == 0
    }

    /// Returns the id as an index into per-process tables.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ProcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Verb
// ---------------------------------------------------------------------------

/// The two wait verbs a task can suspend on.
///
/// `Sync` waits for completion and resolves to the handle itself; `Fetch`
/// waits for completion and resolves to the computed value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    /// Wait for completion; the resumption value is the handle.
    Sync,
    /// Wait for completion; the resumption value is the result.
    Fetch,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Fetch => write!(f, "fetch"),
        }
    }
}

// ---------------------------------------------------------------------------
// RefId
// ---------------------------------------------------------------------------

/// Identifier of one remote computation: `(owner, origin, seq)`.
///
/// - `owner`: the process that executes the computation and stores its
///   result.
/// - `origin`: the process that allocated the identifier (issued the call).
/// - `seq`: monotone per-process counter in `origin`.
///
/// Equality and hashing use only `(origin, seq)`: the originator's counter
/// makes the pair globally unique, and the owner is a routing fact, not an
/// identity fact.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RefId {
    /// Process that owns the computation.
    pub owner: ProcId,
    /// Process that allocated the identifier.
    pub origin: ProcId,
    /// Monotone counter in `origin`.
    pub seq: u64,
}

impl RefId {
    /// Creates an identifier.
    #[must_use]
    pub const fn new(owner: ProcId, origin: ProcId, seq: u64) -> Self {
        Self { owner, origin, seq }
    }

    /// The identity pair used for equality, hashing, and table keys.
    #[must_use]
    pub const fn key(self) -> RefKey {
        RefKey {
            origin: self.origin,
            seq: self.seq,
        }
    }
}

impl PartialEq for RefId {
    fn eq(&self, other: &Self) -> bool {
        self.origin == other.origin && self.seq == other.seq
    }
}

impl Eq for RefId {}

impl Hash for RefId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.origin.hash(state);
        self.seq.hash(state);
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R({}@{}, #{})", self.origin, self.owner, self.seq)
    }
}

/// The `(origin, seq)` identity pair of a [`RefId`].
///
/// Used as the key of the reference registry, the waiting table, and the
/// handle-uniquing table, where the routing `owner` must not participate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RefKey {
    /// Process that allocated the identifier.
    pub origin: ProcId,
    /// Monotone counter in `origin`.
    pub seq: u64,
}

impl fmt::Display for RefKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, #{})", self.origin, self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of<T: Hash>(v: &T) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn equality_ignores_owner() {
        let a = RefId::new(ProcId::new(2), ProcId::new(1), 7);
        let b = RefId::new(ProcId::new(3), ProcId::new(1), 7);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn distinct_origin_or_seq_differ() {
        let a = RefId::new(ProcId::new(2), ProcId::new(1), 7);
        assert_ne!(a, RefId::new(ProcId::new(2), ProcId::new(4), 7));
        assert_ne!(a, RefId::new(ProcId::new(2), ProcId::new(1), 8));
    }

    #[test]
    fn client_is_id_zero() {
        assert!(ProcId::CLIENT.is_client());
        assert!(!ProcId::new(1).is_client());
        assert_eq!(ProcId::new(5).index(), 5);
    }

    #[test]
    fn display_forms() {
        let id = RefId::new(ProcId::new(2), ProcId::new(1), 7);
        assert_eq!(id.to_string(), "R(P1@P2, #7)");
        assert_eq!(Verb::Fetch.to_string(), "fetch");
    }
}
