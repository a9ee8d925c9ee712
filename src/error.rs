//! Unified error type for registry and monitor operations.
//!
//! Producer-side operations return these errors to the caller; monitor-side
//! code logs and skips the offending item instead, so a single misbehaving
//! producer can never take the monitor down.
//!
//! # Example
//!
//! ```rust,ignore
//! use statshm::{Registry, Result};
//!
//! fn publish(registry: &Registry) -> Result<()> {
//!     let counters = registry.alloc()?;
//!     counters.inc("cpl_count")?;
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Unified error type for all shared-memory counter operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The registry has not been initialized, or initialization previously
    /// failed and the registry is unusable.
    #[error("registry is not initialized")]
    NotInitialized,

    /// Creating, sizing or mapping the shared-memory segment failed.
    #[error("shared memory allocation failed: {0}")]
    Allocation(#[source] std::io::Error),

    /// The counter region of the segment is not aligned for atomic access.
    #[error("counter region is not {0}-byte aligned")]
    Alignment(usize),

    /// All counter sets are currently allocated.
    #[error("no free counter set available")]
    Exhausted,

    /// A counter-set id was returned to a registry that never issued it,
    /// or was already returned.
    #[error("unknown counter set id {0}")]
    UnknownHandle(u32),

    /// A counter was addressed by a name or index the schema does not have.
    #[error("unknown counter {0:?}")]
    UnknownCounter(String),

    /// The operation is not valid in the registry's current lifecycle
    /// state, or an attached segment is too small or internally
    /// inconsistent to be trusted.
    #[error("invalid registry or segment state")]
    InvalidState,

    /// An underlying filesystem or syscall failure outside segment setup.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for registry and monitor operations.
pub type Result<T> = std::result::Result<T, Error>;
