//! Error types for the observation scheduler
//!
//! Per-job failures are never reported through these types: they become job
//! state transitions and log lines. These errors cover the infrastructure
//! around the scheduler (files, configuration, device transport, the runner).

use thiserror::Error;

/// Main error type for the scheduler crate
#[derive(Error, Debug)]
pub enum SchedulerError {
    // =========================================================================
    // I/O & Serialization Errors
    // =========================================================================

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // =========================================================================
    // Sequence & Schedule Errors
    // =========================================================================

    /// The capture sequence file could not be read
    #[error("Sequence file inaccessible: {path} - {reason}")]
    SequenceInaccessible { path: String, reason: String },

    /// The capture sequence file was read but could not be parsed
    #[error("Invalid sequence file: {path} - {reason}")]
    InvalidSequence { path: String, reason: String },

    #[error("Invalid schedule file: {path} - {reason}")]
    InvalidSchedule { path: String, reason: String },

    #[error("Unsupported schedule format version {0}")]
    UnsupportedVersion(u32),

    // =========================================================================
    // Configuration Errors
    // =========================================================================

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // =========================================================================
    // Device & Process Errors
    // =========================================================================

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Script error: {path} - {reason}")]
    Script { path: String, reason: String },

    // =========================================================================
    // Runner Errors
    // =========================================================================

    /// The scheduler task has exited and no longer accepts commands
    #[error("Scheduler task is no longer running")]
    ChannelClosed,
}

/// Errors reported by device module collaborators
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// No module of that kind is registered
    #[error("Module unavailable: {0}")]
    Unavailable(String),

    /// The transport to the module failed; the reply is unusable
    #[error("Communication error with {module}: {message}")]
    Communication { module: String, message: String },

    /// The module answered but refused the request
    #[error("{module} rejected '{method}'")]
    Rejected { module: String, method: String },

    #[error("{module} has no property '{property}'")]
    UnknownProperty { module: String, property: String },

    #[error("{module} has no method '{method}'")]
    UnknownMethod { module: String, method: String },

    #[error("Unexpected value for {module}.{property}: {value}")]
    InvalidValue { module: String, property: String, value: String },
}

impl DeviceError {
    /// True when the failure is a transport problem rather than a refusal.
    /// Transport failures are what trigger connection-loss handling.
    pub fn is_communication(&self) -> bool {
        matches!(self, DeviceError::Communication { .. } | DeviceError::Unavailable(_))
    }
}

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Result type for device module calls
pub type DeviceResult<T> = Result<T, DeviceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchedulerError::SequenceInaccessible {
            path: "/tmp/m31.esq".to_string(),
            reason: "not found".to_string(),
        };
        assert_eq!(err.to_string(), "Sequence file inaccessible: /tmp/m31.esq - not found");
    }

    #[test]
    fn test_device_error_classification() {
        let comm = DeviceError::Communication {
            module: "mount".to_string(),
            message: "timeout".to_string(),
        };
        let rejected = DeviceError::Rejected {
            module: "align".to_string(),
            method: "captureAndSolve".to_string(),
        };
        assert!(comm.is_communication());
        assert!(!rejected.is_communication());
        assert!(DeviceError::Unavailable("dome".to_string()).is_communication());
    }

    #[test]
    fn test_device_error_converts() {
        let err: SchedulerError = DeviceError::Unavailable("cap".to_string()).into();
        assert!(matches!(err, SchedulerError::Device(_)));
    }
}
