//! Error types for topology orchestration.

use thiserror::Error;
use topolab_virt::DriverError;

/// Errors raised while resolving or driving a topology.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// A (device, interface) pair is claimed by more than one link or network.
    #[error("A device interface can only be used in 1 link or network (device {device} interface {interface})")]
    ConfigurationConflict { device: u32, interface: u32 },

    /// The configuration is incomplete or inconsistent.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Unknown topology: {0}")]
    UnknownTopology(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Unknown hypervisor: {0}")]
    UnknownHypervisor(String),

    #[error("Unknown device definition: {0}")]
    UnknownDefinition(String),

    /// A backend could not be reached. Only that backend's devices fail.
    #[error("Backend {hypervisor} unreachable: {message}")]
    BackendUnreachable { hypervisor: String, message: String },

    /// A derived address does not fit the configured range.
    #[error("Allocation failed: {0}")]
    Allocation(String),

    /// Reading or writing the configuration store failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Template rendering failed.
    #[error("Render error: {0}")]
    Render(String),

    /// A reachability probe could not run.
    #[error("Probe failed: {0}")]
    Probe(String),

    /// A backend call failed.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for orchestration operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
