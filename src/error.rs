//! Unified error handling for npualloc
//!
//! This module provides the crate-level error type used by the dispatcher
//! and the per-device allocators. It implements error categorization for:
//! - User errors (bad arguments, bad configuration)
//! - Recoverable errors (memory pressure the caller may retry after freeing)
//! - Internal errors (bugs, poisoned locks)
//! - Driver errors (runtime/device failures)

use std::fmt;

use crate::driver::DriverError;

/// Unified error type for the caching allocator.
#[derive(Debug, thiserror::Error)]
pub enum NpuAllocError {
    /// Device out of memory after the full recovery ladder. The payload is
    /// the formatted diagnostic (requested size, device capacity, allocated,
    /// active, free, reserved, and the fraction cap when one is set).
    #[error("{0}")]
    OutOfMemory(String),

    /// Driver failure other than out-of-memory.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// A pointer was freed or inspected that this allocator never handed out.
    #[error("invalid device pointer: {0:#x}")]
    InvalidPointer(usize),

    /// Device index outside the initialized device range.
    #[error("invalid device index: {0}")]
    InvalidDevice(i32),

    /// Memory fraction outside [0, 1].
    #[error("invalid memory fraction: {0}. Please set within [0, 1]")]
    InvalidMemoryFraction(f64),

    /// Malformed or out-of-range allocator configuration.
    #[error("invalid allocator config: {0}")]
    InvalidConfig(String),

    /// Lock poisoned (indicates a panic in another allocator caller)
    #[error("internal lock poisoned: {0}")]
    LockPoisoned(String),

    /// A memory-pressure callback failed; the failure propagates to the
    /// allocation that triggered it.
    #[error("free-memory callback '{name}' failed: {reason}")]
    CallbackFailed { name: String, reason: String },
}

impl NpuAllocError {
    /// Categorize the error for handling decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            NpuAllocError::InvalidDevice(_)
            | NpuAllocError::InvalidMemoryFraction(_)
            | NpuAllocError::InvalidConfig(_)
            | NpuAllocError::InvalidPointer(_) => ErrorCategory::User,

            NpuAllocError::OutOfMemory(_) => ErrorCategory::Recoverable,

            NpuAllocError::LockPoisoned(_) => ErrorCategory::Internal,

            NpuAllocError::Driver(_) | NpuAllocError::CallbackFailed { .. } => {
                ErrorCategory::Driver
            }
        }
    }

    /// Check if this error is recoverable (the caller may free memory or
    /// shrink the request and retry).
    pub fn is_recoverable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Recoverable)
    }

    /// Check if this is a user-facing error (actionable by the caller).
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }
}

/// Error category for handling decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// User error - invalid argument or configuration
    User,
    /// Recoverable error - memory pressure
    Recoverable,
    /// Internal error - indicates a bug
    Internal,
    /// Driver error - runtime/device failure
    Driver,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Recoverable => write!(f, "Recoverable"),
            ErrorCategory::Internal => write!(f, "Internal"),
            ErrorCategory::Driver => write!(f, "Driver"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for NpuAllocError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        NpuAllocError::LockPoisoned(err.to_string())
    }
}

/// Result alias used throughout the allocator.
pub type AllocResult<T> = std::result::Result<T, NpuAllocError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            NpuAllocError::InvalidDevice(7).category(),
            ErrorCategory::User
        );
        assert_eq!(
            NpuAllocError::InvalidMemoryFraction(1.5).category(),
            ErrorCategory::User
        );
        assert_eq!(
            NpuAllocError::OutOfMemory("oom".to_string()).category(),
            ErrorCategory::Recoverable
        );
        assert_eq!(
            NpuAllocError::LockPoisoned("poison".to_string()).category(),
            ErrorCategory::Internal
        );
        assert_eq!(
            NpuAllocError::Driver(DriverError::Failure("boom".to_string())).category(),
            ErrorCategory::Driver
        );
    }

    #[test]
    fn test_is_recoverable() {
        assert!(NpuAllocError::OutOfMemory("oom".to_string()).is_recoverable());
        assert!(!NpuAllocError::InvalidDevice(0).is_recoverable());
    }

    #[test]
    fn test_is_user_error() {
        assert!(NpuAllocError::InvalidPointer(0xdead).is_user_error());
        assert!(NpuAllocError::InvalidConfig("bad".to_string()).is_user_error());
        assert!(!NpuAllocError::OutOfMemory("oom".to_string()).is_user_error());
    }

    #[test]
    fn test_error_display() {
        let err = NpuAllocError::InvalidPointer(0xbeef);
        assert_eq!(err.to_string(), "invalid device pointer: 0xbeef");

        let err = NpuAllocError::InvalidMemoryFraction(2.0);
        assert!(err.to_string().contains('2'));
    }

    #[test]
    fn test_driver_error_conversion() {
        let err: NpuAllocError = DriverError::OutOfMemory { requested: 4096 }.into();
        assert!(matches!(err, NpuAllocError::Driver(_)));
    }
}
