//! Tracing compatibility layer.
//!
//! With the `tracing-integration` feature enabled this module re-exports
//! the `tracing` macros; without it, the macros only type-check their
//! format arguments and compile to nothing. The runtime's diagnostics
//! all go through this layer, so the dependency is strictly opt-in.

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    /// Disabled trace-level logging macro.
    #[macro_export]
    macro_rules! trace {
        ($($arg:tt)*) => {{
            let _ = ::core::format_args!($($arg)*);
        }};
    }

    /// Disabled debug-level logging macro.
    #[macro_export]
    macro_rules! debug {
        ($($arg:tt)*) => {{
            let _ = ::core::format_args!($($arg)*);
        }};
    }

    /// Disabled info-level logging macro.
    #[macro_export]
    macro_rules! info {
        ($($arg:tt)*) => {{
            let _ = ::core::format_args!($($arg)*);
        }};
    }

    /// Disabled warn-level logging macro.
    #[macro_export]
    macro_rules! warn {
        ($($arg:tt)*) => {{
            let _ = ::core::format_args!($($arg)*);
        }};
    }

    /// Disabled error-level logging macro.
    #[macro_export]
    macro_rules! error {
        ($($arg:tt)*) => {{
            let _ = ::core::format_args!($($arg)*);
        }};
    }
}

#[cfg(not(feature = "tracing-integration"))]
pub use crate::{debug, error, info, trace, warn};
