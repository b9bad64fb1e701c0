// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Recoverable failures. Everything that can fail recoverably in this
//! runtime bottoms out either in a POSIX call (`shm_open`, `mmap`,
//! `ftruncate`) or in bounds-checked container access, so a failure carries
//! a POSIX errno next to a human-readable cause: callers branch on the
//! errno, operators read the cause. Resource exhaustion and invariant
//! violations are deliberately *not* failures of this type; those abort the
//! process with a specific diagnostic, since no caller can meaningfully
//! continue a launch whose shared state is broken.

//==============================================================================
// Imports
//==============================================================================

use ::libc::{
    c_int,
    EIO,
};
use ::std::{
    error,
    fmt,
    io,
};

//==============================================================================
// Structures
//==============================================================================

/// A recoverable failure.
#[derive(Clone)]
pub struct Fail {
    /// POSIX error code.
    pub errno: c_int,
    /// Cause.
    pub cause: String,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Fail {
    /// Creates a new failure.
    pub fn new(errno: i32, cause: &str) -> Self {
        Self {
            errno,
            cause: cause.to_string(),
        }
    }

    /// Creates a failure that reports an index outside the valid bounds of a
    /// container, carrying both the offending index and the bounds.
    pub fn out_of_range(index: usize, len: usize) -> Self {
        Self {
            errno: libc::ERANGE,
            cause: format!("index out of range (index={}, len={})", index, len),
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Display trait implementation.
impl fmt::Display for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (errno={})", self.cause, self.errno)
    }
}

/// Debug trait implementation.
impl fmt::Debug for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (errno={})", self.cause, self.errno)
    }
}

/// Error trait implementation.
impl error::Error for Fail {}

/// Conversion from I/O errors, preserving the underlying errno when the
/// operating system reported one.
impl From<io::Error> for Fail {
    fn from(e: io::Error) -> Self {
        Self {
            errno: e.raw_os_error().unwrap_or(EIO),
            cause: e.to_string(),
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::Fail;
    use ::std::io;

    /// Out-of-range failures carry the offending index and the bounds.
    #[test]
    fn out_of_range_carries_bounds() {
        let e: Fail = Fail::out_of_range(7, 4);
        assert_eq!(e.errno, libc::ERANGE);
        assert!(e.cause.contains("index=7"));
        assert!(e.cause.contains("len=4"));
    }

    /// I/O errors keep the errno the operating system reported.
    #[test]
    fn io_error_preserves_errno() {
        let e: Fail = io::Error::from_raw_os_error(libc::ENOENT).into();
        assert_eq!(e.errno, libc::ENOENT);
    }
}
