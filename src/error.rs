//! Unified error handling for hippool
//!
//! A single error type covers the whole allocation surface. Errors are
//! categorized so callers can decide whether to retry (memory pressure),
//! fix their input (bad slice bounds, unknown device), or report a bug
//! (poisoned lock).

use std::fmt;

/// Unified error type for hippool
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Every allocation tier was exhausted: registry miss, native allocation
    /// failure, a forced reclamation pass that surfaced nothing, and a full
    /// registry drain. Memory pressure may ease later; the caller may retry.
    #[error("out of device memory: {requested} bytes on device {device}")]
    OutOfDeviceMemory { device: usize, requested: usize },

    /// Slice parameters fall outside the parent handle.
    #[error("slice out of bounds: offset={offset} len={len} exceeds {byte_len} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        byte_len: usize,
    },

    /// Device id not recognized by the native backend.
    #[error("invalid device id {device}: backend reports {count} device(s)")]
    InvalidDevice { device: usize, count: usize },

    /// Malformed request (e.g. zero-byte allocation).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A host/device byte copy failed.
    #[error("memory copy failed: {0}")]
    CopyFailed(String),

    /// Native backend fault other than arena exhaustion.
    #[error("backend error: {0}")]
    Backend(String),

    /// Lock poisoned (indicates a bug)
    #[error("internal lock poisoned - this indicates a bug: {0}")]
    LockPoisoned(String),
}

impl PoolError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            PoolError::OutOfDeviceMemory { .. } => ErrorCategory::Recoverable,

            PoolError::OutOfBounds { .. }
            | PoolError::InvalidDevice { .. }
            | PoolError::InvalidRequest(_) => ErrorCategory::User,

            PoolError::CopyFailed(_) | PoolError::Backend(_) => ErrorCategory::Backend,

            PoolError::LockPoisoned(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error is a temporary condition worth retrying
    /// after memory pressure eases.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Recoverable | ErrorCategory::Backend
        )
    }

    /// Check if this error is actionable by the caller (invalid input).
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this error indicates a bug that should be reported.
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// User error - invalid input
    User,
    /// Recoverable error - temporary condition
    Recoverable,
    /// Internal error - indicates a bug
    Internal,
    /// Backend error - device/driver failure
    Backend,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Recoverable => write!(f, "Recoverable"),
            ErrorCategory::Internal => write!(f, "Internal"),
            ErrorCategory::Backend => write!(f, "Backend"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for PoolError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        PoolError::LockPoisoned(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type PoolResult<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            PoolError::OutOfDeviceMemory {
                device: 0,
                requested: 96
            }
            .category(),
            ErrorCategory::Recoverable
        );
        assert_eq!(
            PoolError::OutOfBounds {
                offset: 8,
                len: 16,
                byte_len: 16
            }
            .category(),
            ErrorCategory::User
        );
        assert_eq!(
            PoolError::InvalidDevice {
                device: 7,
                count: 1
            }
            .category(),
            ErrorCategory::User
        );
        assert_eq!(
            PoolError::LockPoisoned("test".to_string()).category(),
            ErrorCategory::Internal
        );
        assert_eq!(
            PoolError::Backend("test".to_string()).category(),
            ErrorCategory::Backend
        );
    }

    #[test]
    fn test_is_recoverable() {
        assert!(PoolError::OutOfDeviceMemory {
            device: 0,
            requested: 1
        }
        .is_recoverable());
        assert!(PoolError::CopyFailed("test".to_string()).is_recoverable());

        assert!(!PoolError::InvalidRequest("test".to_string()).is_recoverable());
        assert!(!PoolError::LockPoisoned("test".to_string()).is_recoverable());
    }

    #[test]
    fn test_is_user_error() {
        assert!(PoolError::InvalidRequest("zero".to_string()).is_user_error());
        assert!(PoolError::OutOfBounds {
            offset: 1,
            len: 1,
            byte_len: 1
        }
        .is_user_error());

        assert!(!PoolError::OutOfDeviceMemory {
            device: 0,
            requested: 1
        }
        .is_user_error());
    }

    #[test]
    fn test_error_display() {
        let err = PoolError::OutOfDeviceMemory {
            device: 1,
            requested: 4096,
        };
        assert_eq!(
            err.to_string(),
            "out of device memory: 4096 bytes on device 1"
        );

        let err = PoolError::OutOfBounds {
            offset: 64,
            len: 64,
            byte_len: 96,
        };
        assert_eq!(
            err.to_string(),
            "slice out of bounds: offset=64 len=64 exceeds 96 bytes"
        );

        let err = PoolError::InvalidDevice { device: 3, count: 2 };
        assert_eq!(
            err.to_string(),
            "invalid device id 3: backend reports 2 device(s)"
        );
    }

    #[test]
    fn test_poison_error_conversion() {
        use std::sync::PoisonError;

        fn convert_poison<T>(err: PoisonError<T>) -> PoolError {
            PoolError::from(err)
        }

        let _ = convert_poison::<i32> as fn(PoisonError<i32>) -> PoolError;
    }

    #[test]
    fn test_error_category_display() {
        assert_eq!(ErrorCategory::User.to_string(), "User");
        assert_eq!(ErrorCategory::Recoverable.to_string(), "Recoverable");
        assert_eq!(ErrorCategory::Internal.to_string(), "Internal");
        assert_eq!(ErrorCategory::Backend.to_string(), "Backend");
    }
}
