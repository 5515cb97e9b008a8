//! Error types for espforge-core
//!
//! Errors are layered the same way the operations are:
//! - [`SessionError`] is what a device-session backend reports for a single call
//! - [`ValidationError`] rejects a flash plan before any device I/O happens
//! - [`Error`] is what an engine operation (discovery, flash, erase) ends with

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure of a single device-session call
#[derive(Debug, Error)]
pub enum SessionError {
    /// The device did not answer the connect handshake
    #[error("no response from device")]
    NoResponse,

    /// The device stopped answering mid-operation
    #[error("operation timed out")]
    Timeout,

    /// The device answered with something the backend did not expect
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serial port or file I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Read-back of a written region did not match the image
    #[error("verify failed: {len} bytes at 0x{addr:08X} do not match the image")]
    VerifyMismatch {
        /// Start of the mismatching region
        addr: u32,
        /// Length of the region that was compared
        len: u32,
    },

    /// The backend cannot perform this operation
    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),

    /// The session was used after it was closed
    #[error("session already closed")]
    Closed,
}

/// Device operation during which a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Reading chip model and MAC
    Identify,
    /// Erasing the region a task is about to write
    Erase,
    /// Writing a task's image
    Write,
    /// Reading back and comparing a task's image
    Verify,
    /// Full-chip erase
    EraseAll,
    /// Hard reset after a successful operation
    Reset,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identify => write!(f, "identify"),
            Self::Erase => write!(f, "erase"),
            Self::Write => write!(f, "write"),
            Self::Verify => write!(f, "verify"),
            Self::EraseAll => write!(f, "chip erase"),
            Self::Reset => write!(f, "reset"),
        }
    }
}

/// A flash plan was rejected before any device I/O
///
/// Task indices are 1-based positions in the plan.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The plan contains no tasks at all
    #[error("flash plan is empty")]
    EmptyPlan,

    /// Every task in the plan is disabled
    #[error("flash plan has no enabled tasks")]
    NoEnabledTasks,

    /// The firmware file of an enabled task does not exist
    #[error("task {index}: firmware file {} not found", .path.display())]
    MissingFile {
        /// Task index
        index: usize,
        /// Configured path
        path: PathBuf,
    },

    /// The firmware file exists but could not be read
    #[error("task {index}: cannot read {}: {source}", .path.display())]
    Unreadable {
        /// Task index
        index: usize,
        /// Configured path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// The firmware file is zero bytes long
    #[error("task {index}: firmware file {} is empty", .path.display())]
    EmptyImage {
        /// Task index
        index: usize,
        /// Configured path
        path: PathBuf,
    },

    /// `address + len` does not fit the 32-bit flash address space
    #[error("task {index}: {len} bytes at 0x{address:08X} exceed the flash address space")]
    AddressOverflow {
        /// Task index
        index: usize,
        /// Target address
        address: u32,
        /// Image length
        len: usize,
    },

    /// The region runs past the configured flash size
    #[error("task {index}: region 0x{address:08X}..0x{end:08X} exceeds the {flash_size}-byte flash")]
    OutOfBounds {
        /// Task index
        index: usize,
        /// Target address
        address: u32,
        /// Exclusive end of the region
        end: u64,
        /// Configured flash size in bytes
        flash_size: u32,
    },

    /// Two enabled tasks would write the same bytes
    #[error("tasks {first} and {second} overlap at 0x{address:08X}")]
    Overlap {
        /// Earlier task index (by address)
        first: usize,
        /// Later task index (by address)
        second: usize,
        /// First overlapping address
        address: u32,
    },

    /// An address string could not be parsed
    #[error("invalid flash address '{0}'")]
    InvalidAddress(String),

    /// A plan file could not be read or parsed
    #[error("invalid plan file: {0}")]
    PlanFile(String),
}

/// Error an engine operation terminates with
#[derive(Debug, Error)]
pub enum Error {
    /// The port could not be opened or is held by another operation
    #[error("port {port} unavailable: {reason}")]
    PortUnavailable {
        /// Port name
        port: String,
        /// Human-readable reason
        reason: String,
    },

    /// Every baud rate of the fallback policy failed to connect
    #[error("failed to connect to {port} at {} baud: {source}", format_bauds(.attempted))]
    ConnectFailed {
        /// Port name
        port: String,
        /// Baud rates tried, in order
        attempted: Vec<u32>,
        /// Error of the last attempt
        #[source]
        source: SessionError,
    },

    /// The plan was rejected before any device I/O
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A flash task failed; the rest of the plan was not attempted
    #[error("task {index} ({}) failed during {stage}: {source}", .path.display())]
    TaskFailed {
        /// 1-based task index
        index: usize,
        /// Firmware file of the failing task
        path: PathBuf,
        /// Step that failed
        stage: Stage,
        /// Backend error
        #[source]
        source: SessionError,
    },

    /// A device operation outside any task failed
    #[error("{stage} failed on {port}: {source}")]
    Device {
        /// Port name
        port: String,
        /// Step that failed
        stage: Stage,
        /// Backend error
        #[source]
        source: SessionError,
    },

    /// Another operation is active
    #[error("busy: {0}")]
    Busy(String),

    /// The operation was cancelled before it finished
    #[error("operation cancelled")]
    Cancelled,

    /// The worker running the operation panicked
    #[error("worker failed: {0}")]
    Worker(String),
}

impl Error {
    /// Whether the failure only affects one port and the caller can move on
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::PortUnavailable { .. } | Self::ConnectFailed { .. } | Self::Busy(_)
        )
    }
}

fn format_bauds(bauds: &[u32]) -> String {
    let parts: Vec<String> = bauds.iter().map(|b| b.to_string()).collect();
    parts.join("/")
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_failed_lists_bauds() {
        let err = Error::ConnectFailed {
            port: "COM4".into(),
            attempted: vec![115200, 921600],
            source: SessionError::NoResponse,
        };
        assert_eq!(
            err.to_string(),
            "failed to connect to COM4 at 115200/921600 baud: no response from device"
        );
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_task_failed_names_task() {
        let err = Error::TaskFailed {
            index: 2,
            path: PathBuf::from("app.bin"),
            stage: Stage::Verify,
            source: SessionError::VerifyMismatch {
                addr: 0x10000,
                len: 16,
            },
        };
        let msg = err.to_string();
        assert!(msg.starts_with("task 2 (app.bin) failed during verify"));
        assert!(!err.is_recoverable());
    }
}
