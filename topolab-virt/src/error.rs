//! Error types for the backend driver layer.

use thiserror::Error;

/// Errors that can occur during backend driver operations.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Failed to connect to the backend.
    #[error("Failed to connect to backend: {0}")]
    ConnectionFailed(String),

    /// The named resource does not exist on the backend.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Defining a network, volume or domain failed.
    #[error("Failed to define resource: {0}")]
    DefineFailed(String),

    /// A lifecycle action (create, shutdown, destroy, undefine) failed.
    #[error("Action failed: {0}")]
    ActionFailed(String),

    /// Query failed.
    #[error("Failed to query: {0}")]
    QueryFailed(String),

    /// Resource is in an invalid state for the requested operation.
    #[error("Invalid resource state for operation: {0}")]
    InvalidState(String),

    /// The backend does not implement the operation.
    #[error("Operation not supported by backend: {0}")]
    Unsupported(String),

    /// Building a day-0 image failed.
    #[error("Day-0 packaging failed: {0}")]
    Packaging(String),

    /// XML generation error.
    #[error("XML error: {0}")]
    XmlError(String),

    /// A host command could not be run or exited unsuccessfully.
    #[error("Command `{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;
