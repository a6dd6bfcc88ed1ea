//! Error taxonomy for capture, pipeline and coordination operations.

use thiserror::Error;

/// Error type for camera operations.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// No candidate video node opened and exposed a usable capture format.
    #[error("no usable video capture device found")]
    DeviceNotFound,

    /// The driver refused every format close to the requested one.
    #[error("format negotiation failed: {0}")]
    FormatNegotiation(String),

    /// The capture ring or a frame heap could not be allocated.
    #[error("buffer allocation failed: {0}")]
    BufferAllocation(String),

    /// No frame became ready before the deadline. Retryable.
    #[error("timed out waiting for a frame")]
    TimedOut,

    /// The device failed or disappeared; the session must be torn down.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Still-image compression failed or did not fit the output budget.
    #[error("encoding failed: {0}")]
    Encoding(String),

    /// The operation is not legal in the current engine state.
    #[error("{operation} is not allowed while the engine is {state}")]
    InvalidState {
        /// Operation that was attempted.
        operation: &'static str,
        /// State the engine was in.
        state: &'static str,
    },

    /// The camera has not been detected yet.
    #[error("camera is not ready")]
    NotReady,

    /// A parameter value was rejected.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The configuration input could not be read.
    #[error("configuration error: {0}")]
    Config(String),

    /// No camera is registered under this id.
    #[error("unknown camera id {0}")]
    UnknownCamera(usize),

    /// The camera is already opened by another client.
    #[error("camera {0} is already in use")]
    CameraBusy(usize),

    /// A captured frame does not carry the expected test pattern.
    #[error("pattern mismatch: {0}")]
    PatternMismatch(String),
}

impl CaptureError {
    /// Whether the caller may simply try again.
    ///
    /// Timeouts and a not-yet-attached device are transient; everything else
    /// needs an explicit re-open or reconfiguration.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TimedOut | Self::DeviceNotFound)
    }

    /// Map a driver I/O error, routing "not ready yet" onto the timeout path.
    pub fn from_driver(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Self::TimedOut,
            _ => Self::Io(err),
        }
    }
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CaptureError>;
