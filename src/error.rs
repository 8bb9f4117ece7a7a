use thiserror::Error;

use crate::device::DeviceKind;

/// Main error type for the scopecam runtime
#[derive(Error, Debug)]
pub enum ScopecamError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Property error: {0}")]
    Property(#[from] PropertyError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Frame ring error: {0}")]
    Ring(#[from] RingError),

    #[error("Storage sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("System error: {message}")]
    System { message: String },
}

/// Property record validation error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PropertyError {
    #[error("Dimension name cannot be empty")]
    EmptyDimensionName,

    #[error("Dimension index {index} out of range [0,{count})")]
    DimensionIndexOutOfRange { index: usize, count: usize },
}

/// Device kit and manager error types
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("No {kind} device matches pattern \"{pattern}\"")]
    NotFound { kind: DeviceKind, pattern: String },

    #[error("Malformed device pattern \"{pattern}\": {source}")]
    BadPattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("Device \"{name}\" is open exclusively elsewhere")]
    Exclusive { name: String },

    #[error("Device index {index} out of range for driver \"{driver}\"")]
    BadIndex { driver: String, index: usize },

    #[error("Expected a {expected} device, \"{name}\" is a {actual}")]
    WrongKind {
        name: String,
        expected: DeviceKind,
        actual: DeviceKind,
    },

    #[error("Device \"{name}\" rejected the requested properties")]
    ConfigurationRejected { name: String },

    #[error("Device \"{name}\" refused to {action} in state {state}")]
    BadTransition {
        name: String,
        action: &'static str,
        state: &'static str,
    },
}

/// Frame ring error types
#[derive(Error, Debug)]
pub enum RingError {
    #[error("Unmapped byte count {nbytes} is not a multiple of 8")]
    MisalignedUnmap { nbytes: usize },

    #[error("Unmapped {nbytes} bytes but only {readable} are mapped")]
    UnmapOverrun { nbytes: usize, readable: usize },

    #[error("Ring cursors can only be reset while the pipeline is stopped")]
    NotStopped,

    #[error("Failed to map ring region of {capacity} bytes: {source}")]
    Map {
        capacity: usize,
        source: std::io::Error,
    },
}

/// Storage sink error types
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Storage URI is empty")]
    EmptyUri,

    #[error("\"{path}\" is not inside a writable directory")]
    ParentNotWritable { path: String },

    #[error("\"{path}\" exists and is not a directory")]
    NotADirectory { path: String },

    #[error("External metadata is not a JSON object: {details}")]
    BadMetadata { details: String },

    #[error("TIFF encoding failed: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("Write to \"{path}\" failed: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

/// Runtime controller error types
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("{call} is not valid while the runtime is {state}")]
    InvalidState {
        call: &'static str,
        state: &'static str,
    },

    #[error("Acquisition is already running")]
    AlreadyRunning,

    #[error("No streams are configured")]
    NotConfigured,

    #[error("Stream index {index} out of range [0,{count})")]
    StreamOutOfRange { index: usize, count: usize },

    #[error("Stream {index} is not active")]
    StreamInactive { index: usize },

    #[error("Stream {index} failed during acquisition; reconfigure before retrying")]
    StreamFailed { index: usize },
}

impl ScopecamError {
    /// Create a system error with a message
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    /// Whether the caller can recover by resubmitting different values
    pub fn is_recoverable(&self) -> bool {
        match self {
            ScopecamError::Device(DeviceError::NotFound { .. }) => true,
            ScopecamError::Device(DeviceError::BadPattern { .. }) => true,
            ScopecamError::Device(DeviceError::ConfigurationRejected { .. }) => true,
            ScopecamError::Runtime(RuntimeError::InvalidState { .. }) => true,
            ScopecamError::Runtime(RuntimeError::AlreadyRunning) => true,
            ScopecamError::Runtime(RuntimeError::NotConfigured) => true,
            ScopecamError::Config(_) => true,
            ScopecamError::System { .. } => false,
            _ => false,
        }
    }
}

/// Convenience type alias for Results
pub type Result<T> = std::result::Result<T, ScopecamError>;
