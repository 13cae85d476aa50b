use std::io;
use thiserror::Error;

/// Main error type for driver operations
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Missing volume context value: {0}")]
    MissingParameter(String),

    #[error("Volume operation already exists for volume {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Volume {0} is not found")]
    VolumeNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Mounting daemon unavailable: {0}")]
    DaemonUnavailable(String),

    #[error("Daemon call {endpoint} failed with status {status}: {body}")]
    Daemon {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Cannot decode user secret key: {0}")]
    InvalidKey(String),

    #[error("Cannot decrypt saved secret: {0}")]
    DecryptionFailed(String),

    #[error("Malformed config data: {0}")]
    MalformedConfig(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Status classification reported back to the orchestration platform.
///
/// The platform decides whether to retry a lifecycle call based on this code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    InvalidArgument,
    AlreadyExists,
    NotFound,
    PermissionDenied,
    Unavailable,
    Internal,
}

impl DriverError {
    /// Convert error to the platform status code for lifecycle responses
    pub fn code(&self) -> Code {
        match self {
            DriverError::InvalidArgument(_) => Code::InvalidArgument,
            DriverError::MissingParameter(_) => Code::InvalidArgument,
            DriverError::AlreadyExists(_) => Code::AlreadyExists,
            DriverError::NotFound(_) => Code::NotFound,
            DriverError::VolumeNotFound(_) => Code::NotFound,
            DriverError::PermissionDenied(_) => Code::PermissionDenied,
            DriverError::DaemonUnavailable(_) => Code::Unavailable,
            DriverError::Daemon { .. } => Code::Internal,
            DriverError::InvalidKey(_) => Code::InvalidArgument,
            DriverError::DecryptionFailed(_) => Code::InvalidArgument,
            DriverError::MalformedConfig(_) => Code::InvalidArgument,
            DriverError::Config(_) => Code::InvalidArgument,
            DriverError::Io(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                Code::PermissionDenied
            }
            DriverError::Io(_) => Code::Internal,
            DriverError::Internal(_) => Code::Internal,
        }
    }

    /// Classify a failed publish attempt.
    ///
    /// Permission problems stay permission problems, anything the daemon or
    /// the OS rejected as an invalid argument becomes `InvalidArgument`, and
    /// everything else collapses into `Internal`.
    pub fn classify_mount_failure(self) -> DriverError {
        match self {
            DriverError::PermissionDenied(_) | DriverError::InvalidArgument(_) => self,
            DriverError::Io(ref e) if e.kind() == io::ErrorKind::PermissionDenied => {
                DriverError::PermissionDenied(e.to_string())
            }
            DriverError::MalformedConfig(message) => DriverError::InvalidArgument(message),
            other => {
                let message = other.to_string();
                if message.to_lowercase().contains("invalid argument") {
                    DriverError::InvalidArgument(message)
                } else {
                    DriverError::Internal(message)
                }
            }
        }
    }
}

impl From<crate::config::ConfigError> for DriverError {
    fn from(e: crate::config::ConfigError) -> Self {
        DriverError::Config(e.to_string())
    }
}

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;
