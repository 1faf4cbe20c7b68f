//! Error types and native status translation.
//!
//! Every platform call returns a [`Status`] on failure. [`raise_if_error`] and
//! [`StatusExt::context`] turn that status into a structured [`Error`] carrying
//! both the native code and a human-readable description of what was attempted.

use std::fmt;

use thiserror::Error;

use crate::platform::DeviceId;

/// Native platform status value.
///
/// Values follow the CUDA driver numbering so that codes reported by the
/// CUDA backend and by the simulated platform read the same in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub i32);

impl Status {
    /// Operation completed.
    pub const SUCCESS: Status = Status(0);
    /// An argument was out of range.
    pub const INVALID_VALUE: Status = Status(1);
    /// The allocation could not be satisfied.
    pub const OUT_OF_MEMORY: Status = Status(2);
    /// The driver has not been initialised.
    pub const NOT_INITIALIZED: Status = Status(3);
    /// No usable device was found.
    pub const NO_DEVICE: Status = Status(100);
    /// The device ordinal does not name a device.
    pub const INVALID_DEVICE: Status = Status(101);
    /// The context handle is not valid.
    pub const INVALID_CONTEXT: Status = Status(201);
    /// A resource handle is not valid.
    pub const INVALID_HANDLE: Status = Status(400);
    /// A named symbol was not found.
    pub const NOT_FOUND: Status = Status(500);
    /// Asynchronous work has not completed yet.
    pub const NOT_READY: Status = Status(600);
    /// The operation is not supported on this device.
    pub const NOT_SUPPORTED: Status = Status(801);
    /// Unclassified failure.
    pub const UNKNOWN: Status = Status(999);

    /// Returns true for the success value.
    #[inline]
    pub fn is_success(self) -> bool {
        self == Status::SUCCESS
    }

    /// Symbolic name of well-known codes.
    pub fn name(self) -> &'static str {
        match self {
            Status::SUCCESS => "success",
            Status::INVALID_VALUE => "invalid value",
            Status::OUT_OF_MEMORY => "out of memory",
            Status::NOT_INITIALIZED => "not initialized",
            Status::NO_DEVICE => "no device",
            Status::INVALID_DEVICE => "invalid device",
            Status::INVALID_CONTEXT => "invalid context",
            Status::INVALID_HANDLE => "invalid handle",
            Status::NOT_FOUND => "not found",
            Status::NOT_READY => "not ready",
            Status::NOT_SUPPORTED => "not supported",
            _ => "unrecognized status",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

/// Result of a raw platform call.
pub type PlatformResult<T> = std::result::Result<T, Status>;

/// Which affinity-checked operation was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinityOperation {
    /// Launching a kernel on a stream.
    KernelLaunch,
    /// Recording an event on a stream.
    EventRecord,
    /// Prefetching or copying a region through a stream.
    StreamMemoryOperation,
    /// Measuring the time between two events.
    ElapsedTime,
}

impl fmt::Display for AffinityOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AffinityOperation::KernelLaunch => write!(f, "kernel launch"),
            AffinityOperation::EventRecord => write!(f, "event record"),
            AffinityOperation::StreamMemoryOperation => write!(f, "stream memory operation"),
            AffinityOperation::ElapsedTime => write!(f, "elapsed time query"),
        }
    }
}

/// Errors surfaced by gpuhost.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying driver reported a failure.
    #[error("{message}: {status}")]
    Platform {
        /// Native status code.
        status: Status,
        /// What was being attempted.
        message: String,
    },

    /// An operation spans two device affinities that must match.
    #[error("{operation} spans {expected} and {actual}")]
    DeviceMismatch {
        /// The rejected operation.
        operation: AffinityOperation,
        /// Device of the stream (the target).
        expected: DeviceId,
        /// Device of the resource being enqueued.
        actual: DeviceId,
    },

    /// A stream was asked to wait on an event of another device.
    #[error("stream on {stream_device} cannot wait for an event of {event_device}")]
    CrossDeviceDependency {
        /// Device the event belongs to.
        event_device: DeviceId,
        /// Device the waiting stream belongs to.
        stream_device: DeviceId,
    },

    /// The proxy no longer holds a resource.
    #[error("{resource} proxy was already released or moved from")]
    UseAfterRelease {
        /// Kind of resource.
        resource: &'static str,
    },

    /// A configuration value is out of range.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Elapsed time requested for events created without timing.
    #[error("elapsed time requires both events to be created with timing enabled")]
    TimingNotEnabled,

    /// The ambient device/context could not be switched.
    #[error("failed to make {device} current: {status}")]
    DeviceSelectionFailed {
        /// Device that was requested.
        device: DeviceId,
        /// Native status of the failed switch.
        status: Status,
    },

    /// The requested backend is not compiled in or not installed.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create an invalid-argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Native status, for platform and device-selection failures.
    pub fn status(&self) -> Option<Status> {
        match self {
            Error::Platform { status, .. } | Error::DeviceSelectionFailed { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// True when an allocation could not be satisfied.
    pub fn is_out_of_memory(&self) -> bool {
        self.status() == Some(Status::OUT_OF_MEMORY)
    }

    /// True when a device ordinal did not name a device.
    pub fn is_invalid_device(&self) -> bool {
        self.status() == Some(Status::INVALID_DEVICE)
    }

    /// True for both affinity violations.
    pub fn is_device_mismatch(&self) -> bool {
        matches!(
            self,
            Error::DeviceMismatch { .. } | Error::CrossDeviceDependency { .. }
        )
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

/// Result type for gpuhost operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Return normally on success, otherwise fail with the native code and `message`.
pub fn raise_if_error(status: Status, message: impl Into<String>) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(Error::Platform {
            status,
            message: message.into(),
        })
    }
}

/// Attach context to raw platform results.
pub trait StatusExt<T> {
    /// Translate a failure into [`Error::Platform`] with an eagerly built message.
    fn context(self, message: &str) -> Result<T>;

    /// Translate a failure, building the message only on the error path.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T> StatusExt<T> for PlatformResult<T> {
    fn context(self, message: &str) -> Result<T> {
        self.map_err(|status| Error::Platform {
            status,
            message: message.to_string(),
        })
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|status| Error::Platform {
            status,
            message: f(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_if_error_success() {
        assert!(raise_if_error(Status::SUCCESS, "noop").is_ok());
    }

    #[test]
    fn test_raise_if_error_carries_code_and_message() {
        let err = raise_if_error(Status::INVALID_HANDLE, "Failed destroying stream").unwrap_err();
        assert_eq!(err.status(), Some(Status::INVALID_HANDLE));
        let text = err.to_string();
        assert!(text.contains("Failed destroying stream"));
        assert!(text.contains("400"));
    }

    #[test]
    fn test_allocation_failures_are_distinguishable() {
        let oom: Result<()> = Err(Status::OUT_OF_MEMORY).context("alloc");
        let bad_device: Result<()> = Err(Status::INVALID_DEVICE).context("alloc");
        assert!(oom.as_ref().unwrap_err().is_out_of_memory());
        assert!(!oom.unwrap_err().is_invalid_device());
        assert!(bad_device.unwrap_err().is_invalid_device());
    }

    #[test]
    fn test_with_context_is_lazy_on_success() {
        let ok: PlatformResult<u32> = Ok(7);
        let value = ok
            .with_context(|| panic!("message must not be built on success"))
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_mismatch_classification() {
        let a = Error::DeviceMismatch {
            operation: AffinityOperation::KernelLaunch,
            expected: DeviceId(0),
            actual: DeviceId(1),
        };
        let b = Error::CrossDeviceDependency {
            event_device: DeviceId(1),
            stream_device: DeviceId(0),
        };
        assert!(a.is_device_mismatch());
        assert!(b.is_device_mismatch());
        assert!(!Error::TimingNotEnabled.is_device_mismatch());
        assert!(a.to_string().contains("kernel launch"));
    }
}
