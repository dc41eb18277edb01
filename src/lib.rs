//! Plexus: a peer-to-peer distributed multiprocessing runtime.
//!
//! # Overview
//!
//! A plexus cluster is a fixed set of processes that execute named
//! computations on behalf of one another. Submitting work to any peer
//! returns a [`RemoteRef`] handle immediately; the handle can be
//! forwarded to other peers or awaited later, so dependent remote
//! computations pipeline without waiting for intermediate results to
//! come home.
//!
//! # Core Guarantees
//!
//! - **One loop per process**: each process is single-threaded
//!   cooperative; registry, queues, and connections are owned by the
//!   event loop and never locked
//! - **Counted lifetime**: a computation's record lives exactly as long
//!   as some process holds a strong handle to it; handle release emits
//!   one `del_client` to the owner
//! - **Failures are values**: a failed computation delivers its
//!   [`Fault`] to every waiter instead of hanging or killing the process
//! - **No closure shipping**: remote execution names a registered
//!   computation; the set of remotely runnable operations is explicit
//!
//! # Module Structure
//!
//! - [`types`]: process, verb, and remote-reference identifiers
//! - [`error`]: error types
//! - [`value`]: the value model exchanged between processes
//! - [`codec`]: length-prefixed framing
//! - [`wire`]: message kinds and serialized form
//! - [`registry`]: named-computation registry
//! - [`handle`]: strong/weak remote-reference handles
//! - [`work`]: work items, run queue, waiting table
//! - [`task`]: cooperative task execution
//! - [`group`]: peer locations and connections
//! - [`global`]: the replicated global object
//! - [`runtime`]: the event loop and remote invocation
//! - [`config`]: runtime tunables
//! - [`tracing_compat`]: optional `tracing` integration

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(dead_code)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod codec;
pub mod config;
pub mod error;
pub mod global;
pub mod group;
pub mod handle;
pub mod registry;
pub mod runtime;
pub mod task;
pub mod tracing_compat;
pub mod types;
pub mod value;
pub mod wire;
pub mod work;

pub use config::RuntimeConfig;
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use global::GlobalObject;
pub use group::Location;
pub use handle::{RemoteRef, WeakRef};
pub use registry::{ComputationName, ComputationRegistry};
pub use runtime::{Runtime, TaskCtx};
pub use types::{ProcId, RefId, Verb};
pub use value::{Fault, Value};
pub use wire::WireFormat;
