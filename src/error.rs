//! Error types and error handling strategy.
//!
//! Transport and protocol failures are explicit and typed. User
//! computation failures are *not* errors at this layer: they are caught,
//! packaged as [`crate::value::Fault`] values, and delivered to waiters in
//! place of a result, so a failed computation never takes the process
//! down and never leaves a waiter hanging.

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Transport ===
    /// Underlying socket I/O failed.
    Io,
    /// Peer connection reached EOF or was dropped.
    ConnectionClosed,
    /// A frame exceeded the configured maximum length or was malformed.
    Frame,
    /// Encoding a wire message failed.
    Encode,
    /// Decoding a wire message failed.
    Decode,

    // === Protocol ===
    /// Message referenced a process id outside the cluster.
    UnknownPeer,
    /// No computation registered under the requested name.
    UnknownComputation,
    /// Cluster bootstrap payload was missing or malformed.
    Bootstrap,
    /// Operation requires a process group that has not been formed yet.
    NoGroup,

    // === Runtime ===
    /// The event loop shut down before the operation completed.
    Shutdown,
    /// Internal invariant violation (bug).
    Internal,
}

/// The main error type for runtime operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error indicates the peer went away.
    #[must_use]
    pub const fn is_disconnect(&self) -> bool {
        matches!(self.kind, ErrorKind::ConnectionClosed | ErrorKind::Shutdown)
    }

    /// Adds context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => ErrorKind::ConnectionClosed,
            _ => ErrorKind::Io,
        };
        Self::new(kind).with_source(e)
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Attach a context string on error.
    fn context(self, ctx: impl Into<String>) -> Result<T>;
    /// Attach context computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(ctx))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

/// A specialized Result type for runtime operations.
pub type Result<T> = core::result::Result<T, Error>;
