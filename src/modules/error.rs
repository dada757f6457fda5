//! Error taxonomy and exit-status mapping.
//!
//! Every startup failure is one of five kinds. Configuration and resolution
//! errors are fatal before any daemonization side effects; connection errors
//! carry the storage errno so the process exit status reflects the true
//! cause even when the failure happened in the background child.

use std::fmt;
use std::io;

use nix::errno::Errno;
use thiserror::Error;

use super::constants::{EXIT_ERRNO_BASE, EXIT_PROTOCOL_FAILURE};

/// An errno-carrying error from the storage layer.
#[derive(Debug, Clone, Error)]
pub struct StorageError {
    /// Raw errno value describing the failure.
    pub errno: i32,
    /// What the storage layer was doing when it failed.
    pub context: String,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, Errno::from_i32(self.errno).desc())
    }
}

impl StorageError {
    /// Creates a storage error from an errno and a context string.
    pub fn new(errno: i32, context: impl Into<String>) -> Self {
        Self {
            errno,
            context: context.into(),
        }
    }

    /// Creates a not-found error for a path-like subject.
    pub fn not_found(context: impl Into<String>) -> Self {
        Self::new(libc::ENOENT, context)
    }

    /// True when the error is a not-found outcome.
    pub fn is_not_found(&self) -> bool {
        self.errno == libc::ENOENT
    }

    /// Converts an I/O error, preserving the OS errno where present.
    pub fn from_io(err: &io::Error, context: impl Into<String>) -> Self {
        Self::new(err.raw_os_error().unwrap_or(libc::EIO), context)
    }
}

/// A fatal startup error.
#[derive(Debug, Error)]
pub enum StartError {
    /// Bad, missing, or ambiguous command line input. Printed with usage and
    /// never retried.
    #[error("configuration error: {0}")]
    Config(String),
    /// Conflicting or missing identity sources.
    #[error("identity resolution failed: {0}")]
    Resolution(String),
    /// Pool connect or container open failure.
    #[error("connection failed: {0}")]
    Connection(#[from] StorageError),
    /// Malformed daemon handshake.
    #[error("handshake protocol violation: {0}")]
    Protocol(String),
    /// The event loop exited with an error after a successful mount.
    #[error("event loop failed: {0}")]
    Runtime(String),
}

impl StartError {
    /// Process exit status for this error.
    ///
    /// Protocol violations exit 2; everything else maps an errno onto
    /// [`errno_exit_code`] so the status stays under 256 and disjoint from
    /// the reserved values.
    pub fn exit_code(&self) -> i32 {
        match self {
            StartError::Protocol(_) => EXIT_PROTOCOL_FAILURE,
            StartError::Config(_) | StartError::Resolution(_) => errno_exit_code(libc::EINVAL),
            StartError::Connection(err) => errno_exit_code(err.errno),
            StartError::Runtime(_) => errno_exit_code(libc::EIO),
        }
    }

    /// True when usage text should accompany the message.
    pub fn is_usage(&self) -> bool {
        matches!(self, StartError::Config(_))
    }
}

/// Maps an errno onto an exit status: offset by a fixed base, bounded under
/// 256.
pub fn errno_exit_code(errno: i32) -> i32 {
    EXIT_ERRNO_BASE + errno.abs() % (256 - EXIT_ERRNO_BASE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_exit_code_bounds() {
        for errno in [1, libc::ENOENT, libc::EINVAL, libc::EIO, 1000, -5] {
            let code = errno_exit_code(errno);
            assert!(code > EXIT_PROTOCOL_FAILURE);
            assert!(code < 256);
        }
    }

    #[test]
    fn test_protocol_failure_exits_two() {
        let err = StartError::Protocol("short read".to_string());
        assert_eq!(err.exit_code(), EXIT_PROTOCOL_FAILURE);
    }

    #[test]
    fn test_connection_error_carries_errno() {
        let err = StartError::Connection(StorageError::not_found("pool lookup"));
        assert_eq!(err.exit_code(), EXIT_ERRNO_BASE + libc::ENOENT);
    }

    #[test]
    fn test_usage_only_for_config() {
        assert!(StartError::Config("bad".into()).is_usage());
        assert!(!StartError::Resolution("bad".into()).is_usage());
    }
}
