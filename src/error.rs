//! Error types surfaced by fallible map operations.

use core::fmt;
use std::collections::TryReserveError;

/// Failure to obtain storage for an insertion or a rehash.
///
/// The map is left exactly as it was before the failing call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReserveError {
    /// The requested bucket or entry count does not fit in `usize`.
    CapacityOverflow,
    /// The allocator refused the request.
    AllocError(TryReserveError),
}

impl fmt::Display for ReserveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReserveError::CapacityOverflow => f.write_str("capacity overflow"),
            ReserveError::AllocError(e) => write!(f, "allocation failed: {e}"),
        }
    }
}

impl std::error::Error for ReserveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReserveError::CapacityOverflow => None,
            ReserveError::AllocError(e) => Some(e),
        }
    }
}

impl From<TryReserveError> for ReserveError {
    fn from(e: TryReserveError) -> Self {
        ReserveError::AllocError(e)
    }
}

/// A non-blocking operation found its bucket (or the bucket array) locked.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WouldBlock;

impl fmt::Display for WouldBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation would block")
    }
}

impl std::error::Error for WouldBlock {}
