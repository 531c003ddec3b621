//! # Ember Error Handling
//!
//! Error types for the submission path.
//!
//! Every error falls into one [`ErrorClass`]. Callers branch on the class to
//! decide whether a retry is meaningful: resource exhaustion and invalid
//! requests leave no state behind, a lost device does not recover without an
//! external reset.

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Ember Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Ember unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Request Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Source or destination range lies outside its surface
    RangeOutOfBounds,
    /// Transfer or fill of zero bytes
    ZeroSize,
    /// Fill pattern size is not a power of two up to the supported maximum
    InvalidPattern,
    /// Request carries no work where work is required
    EmptyDispatch,
    /// Operation not supported by the queue's engines
    NotSupported,

    // =========================================================================
    // Resource Errors
    // =========================================================================
    /// Dependency-token pool has no free slot
    TagPoolExhausted,
    /// Command buffer pool reached its live-buffer cap
    OutOfCommandBuffers,
    /// Command buffer full
    CommandBufferFull,
    /// Too many in-flight submissions on the ring
    RingOverflow,
    /// Out of device memory
    OutOfDeviceMemory,
    /// Out of host memory
    OutOfHostMemory,

    // =========================================================================
    // Device Errors
    // =========================================================================
    /// GPU hang detected, the engine must be reset
    DeviceLost,
    /// Submission to hardware failed
    SubmissionFailed,

    // =========================================================================
    // Wait / Event Errors
    // =========================================================================
    /// Operation timed out
    Timeout,
    /// A dependency was aborted before the request could be submitted
    DependencyAborted,
}

impl Error {
    /// Category of this error
    pub const fn class(self) -> ErrorClass {
        match self {
            Self::InvalidParameter
            | Self::RangeOutOfBounds
            | Self::ZeroSize
            | Self::InvalidPattern
            | Self::EmptyDispatch
            | Self::NotSupported => ErrorClass::InvalidRequest,

            Self::TagPoolExhausted
            | Self::OutOfCommandBuffers
            | Self::CommandBufferFull
            | Self::RingOverflow
            | Self::OutOfDeviceMemory
            | Self::OutOfHostMemory => ErrorClass::ResourceExhaustion,

            Self::DeviceLost => ErrorClass::DeviceLost,

            Self::SubmissionFailed => ErrorClass::Rejected,

            Self::Timeout => ErrorClass::Timeout,

            Self::DependencyAborted => ErrorClass::Aborted,
        }
    }

    /// Check if this is a device-lost condition
    #[inline]
    pub const fn is_device_lost(self) -> bool {
        matches!(self.class(), ErrorClass::DeviceLost)
    }

    /// Check if the caller may retry the same request
    #[inline]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self.class(),
            ErrorClass::ResourceExhaustion | ErrorClass::Timeout
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Request
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::RangeOutOfBounds => write!(f, "range out of bounds"),
            Self::ZeroSize => write!(f, "zero-sized transfer"),
            Self::InvalidPattern => write!(f, "invalid fill pattern"),
            Self::EmptyDispatch => write!(f, "empty dispatch"),
            Self::NotSupported => write!(f, "operation not supported"),

            // Resource
            Self::TagPoolExhausted => write!(f, "dependency tag pool exhausted"),
            Self::OutOfCommandBuffers => write!(f, "out of command buffers"),
            Self::CommandBufferFull => write!(f, "command buffer full"),
            Self::RingOverflow => write!(f, "ring buffer overflow"),
            Self::OutOfDeviceMemory => write!(f, "out of device memory"),
            Self::OutOfHostMemory => write!(f, "out of host memory"),

            // Device
            Self::DeviceLost => write!(f, "device lost"),
            Self::SubmissionFailed => write!(f, "submission failed"),

            // Wait
            Self::Timeout => write!(f, "operation timed out"),
            Self::DependencyAborted => write!(f, "dependency aborted"),
        }
    }
}

// =============================================================================
// ERROR CLASS
// =============================================================================

/// Error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Malformed request, nothing was mutated
    InvalidRequest,
    /// A pool or allocation ran dry, partial resources were released
    ResourceExhaustion,
    /// The device hung; nothing recovers without a reset
    DeviceLost,
    /// The hardware refused a batch; the engine did not hang
    Rejected,
    /// A wait expired, status left unresolved
    Timeout,
    /// A dependency was aborted
    Aborted,
}
