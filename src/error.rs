//! Error taxonomy for session operations.

use thiserror::Error;

use crate::traits::{ControlId, ControlType};

/// Error type for camera session operations.
///
/// Frame drops under pool exhaustion are deliberately absent: they are a
/// backpressure outcome reported through the dropped-frame counter only.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The control is not known to the device.
    #[error("invalid control {0}")]
    InvalidControl(ControlId),
    /// The value's type does not match the control's declared type.
    #[error("control {control} expects {expected:?}, got {actual:?}")]
    InvalidControlType {
        /// Control that was addressed.
        control: ControlId,
        /// Type declared by the device.
        expected: ControlType,
        /// Type of the supplied value.
        actual: ControlType,
    },
    /// The value lies outside the device's bounds for the control.
    #[error("value {value} out of range for control {control}")]
    OutOfRange {
        /// Control that was addressed.
        control: ControlId,
        /// Rejected value.
        value: i64,
    },
    /// A call into the device collaborator failed.
    #[error("device I/O failed: {0}")]
    DeviceIo(String),
    /// The command is not valid in the current session state.
    #[error("invalid command: {0}")]
    InvalidCommand(&'static str),
    /// Buffer pool or queue allocation failed while building the session.
    #[error("allocation failed: {0}")]
    MemAlloc(String),
    /// A buffer handle was returned to a pool that did not issue it.
    #[error("buffer slot {0} does not belong to this pool")]
    ForeignBuffer(usize),
    /// The session has been closed.
    #[error("session is closed")]
    SessionClosed,
    /// A background task terminated by panicking.
    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for camera session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
