//! Error Module - zreloc Error Types
//!
//! Defines the recoverable errors of the relocation engine and the `fatal!`
//! macro used for invariant violations.
//!
//! # Error Categories
//!
//! ## Memory Errors
//! - `HeapInitialization` - Address space reservation failed
//! - `VirtualMemory` - Commit/map request outside the reservation
//! - `InvalidPointer` - Address outside the heap
//!
//! ## Setup Errors
//! - `Configuration` - Invalid configuration
//! - `InvalidArgument` - Invalid function argument
//! - `ResourceExhausted` - Worker threads could not be spawned
//!
//! ## Internal Errors
//! - `Internal` - A worker panicked or an internal state was corrupted
//!
//! Invariant violations (table overflow, double release, forwarding misses)
//! are not errors. They go through [`fatal!`](crate::fatal), which aborts the
//! process.

use crate::config::ConfigError;
use thiserror::Error;

/// Main error type for all zreloc operations
///
/// # Examples
///
/// ```rust
/// use zreloc::error::RelocError;
///
/// fn handle_error(err: RelocError) {
///     match err {
///         RelocError::InvalidPointer { address } => {
///             eprintln!("not a heap address: {:#x}", address);
///         }
///         _ => {
///             eprintln!("Other error: {}", err);
///         }
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum RelocError {
    /// Heap initialization failed
    ///
    /// **When returned:** The address space reservation for the heap could
    /// not be mapped
    ///
    /// **Recovery strategy:** Cannot recover - terminate gracefully
    #[error("Heap initialization failed: {0}")]
    HeapInitialization(String),

    /// Virtual memory error
    ///
    /// **When returned:** A commit, uncommit, map or unmap request falls
    /// outside the reserved range
    ///
    /// **Recovery strategy:** Fix the caller; the backing is unchanged
    #[error("Virtual memory error: {0}")]
    VirtualMemory(String),

    /// Invalid pointer address
    ///
    /// **When returned:** Heap offset outside the reserved heap
    ///
    /// **Recovery strategy:** Skip the pointer, log warning
    #[error("Invalid pointer address: {address:#x}")]
    InvalidPointer { address: usize },

    /// Configuration error
    ///
    /// **When returned:** Invalid relocation configuration detected
    ///
    /// **Recovery strategy:** Use default configuration or fail fast
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Invalid argument
    ///
    /// **When returned:** Function argument fails validation
    ///
    /// **Example scenarios:**
    /// - Page size not a power of two
    /// - Page start not aligned to the page size
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Resource exhausted
    ///
    /// **When returned:** A worker thread could not be spawned
    ///
    /// **Recovery strategy:** Retry with fewer workers
    #[error("Resource exhausted: {resource}")]
    ResourceExhausted { resource: String },

    /// Internal error - indicates a bug in zreloc
    ///
    /// **When returned:** A worker thread panicked while relocating
    ///
    /// **Action required:** Report with the logged diagnostic
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelocError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RelocError::ResourceExhausted { .. } | RelocError::InvalidPointer { .. }
        )
    }

    /// Check if this error indicates a bug in the code
    pub fn is_bug(&self) -> bool {
        matches!(self, RelocError::Internal(_))
    }
}

/// Result type alias for zreloc operations
pub type Result<T> = std::result::Result<T, RelocError>;

/// Report an invariant violation and abort the process
///
/// Logs the diagnostic at `error` level, then aborts. Unit tests of this
/// crate panic instead, so `#[should_panic]` can observe the message.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        $crate::log::error!("invariant violation: {}", msg);
        $crate::error::abort_on_invariant_violation(&msg)
    }};
}

#[doc(hidden)]
#[cold]
pub fn abort_on_invariant_violation(msg: &str) -> ! {
    if cfg!(test) {
        panic!("invariant violation: {}", msg);
    }

    eprintln!("zreloc: invariant violation: {}", msg);
    std::process::abort()
}
