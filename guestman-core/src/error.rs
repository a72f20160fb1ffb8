//! Error types for guestman.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.
//! The variants follow the host agent's error taxonomy so that request handlers can
//! map them to status codes without inspecting messages.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for guestman operations.
pub type Result<T> = std::result::Result<T, GuestError>;

/// Main error type for guestman.
#[derive(Error, Debug)]
pub enum GuestError {
    // Lookup errors
    #[error("Guest not found: {guest_id}")]
    GuestNotFound { guest_id: String },

    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("Guest already exists: {guest_id}")]
    AlreadyExists { guest_id: String },

    // Request validation errors
    #[error("Bad request: {reason}")]
    BadRequest { reason: String },

    #[error("Missing parameter: {name}")]
    MissingParameter { name: String },

    #[error("Invalid input parameter {name}: {reason}")]
    InputParameter { name: String, reason: String },

    // Run-state errors
    #[error("Guest {guest_id} is in invalid state: {reason}")]
    InvalidState { guest_id: String, reason: String },

    #[error("Unsupported operation: {operation}. {reason}")]
    Unsupported { operation: String, reason: String },

    // PCI allocation errors
    #[error("No valid PCI address for device {device}")]
    NoValidAddress { device: String },

    // Emulator errors
    #[error("Failed to start guest {guest_id}: {reason}")]
    StartFailed { guest_id: String, reason: String },

    #[error("Monitor error: {reason}")]
    Monitor { reason: String },

    #[error("Monitor command {command} failed: {class}: {desc}")]
    MonitorCommand { command: String, class: String, desc: String },

    #[error("Monitor disconnected")]
    MonitorDisconnected,

    // Guest agent errors
    #[error("Guest agent for {guest_id} is busy")]
    AgentBusy { guest_id: String },

    #[error("Guest agent error: {reason}")]
    Agent { reason: String },

    // Timeouts
    #[error("Timed out: {operation}")]
    Timeout { operation: String },

    // Collaborator errors
    #[error("Storage error: {reason}")]
    Storage { reason: String },

    #[error("Deploy agent error: {reason}")]
    DeployAgent { reason: String },

    #[error("Control plane error: {reason}")]
    ControlPlane { reason: String },

    #[error("Container runtime error: {reason}")]
    ContainerRuntime { reason: String },

    #[error("Command `{command}` failed: {reason}")]
    Subprocess { command: String, reason: String },

    // Task errors
    #[error("Task cancelled: {task}")]
    Cancelled { task: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid descriptor at {path:?}: {reason}")]
    InvalidDesc { path: PathBuf, reason: String },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse error classification used for status codes and error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    BadRequest,
    MissingParameter,
    InputParameter,
    InvalidState,
    Unsupported,
    Timeout,
    Unavailable,
    Internal,
}

/// Structured error body returned to the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: u16,
    pub class: ErrorKind,
    pub details: String,
}

impl GuestError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoError { path: path.into(), source }
    }

    pub fn guest_not_found(guest_id: impl Into<String>) -> Self {
        Self::GuestNotFound { guest_id: guest_id.into() }
    }

    pub fn invalid_state(guest_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidState { guest_id: guest_id.into(), reason: reason.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::GuestNotFound { .. } | Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::BadRequest { .. } | Self::InvalidDesc { .. } => ErrorKind::BadRequest,
            Self::MissingParameter { .. } => ErrorKind::MissingParameter,
            Self::InputParameter { .. } => ErrorKind::InputParameter,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::AgentBusy { .. } | Self::MonitorDisconnected => ErrorKind::Unavailable,
            _ => ErrorKind::Internal,
        }
    }

    /// HTTP status code matching the error kind.
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotFound => 404,
            ErrorKind::AlreadyExists => 409,
            ErrorKind::BadRequest | ErrorKind::MissingParameter | ErrorKind::InputParameter => 400,
            ErrorKind::InvalidState => 400,
            ErrorKind::Unsupported => 501,
            ErrorKind::Timeout => 504,
            ErrorKind::Unavailable => 503,
            ErrorKind::Internal => 500,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody { code: self.http_status(), class: self.kind(), details: self.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_map_to_status() {
        assert_eq!(GuestError::guest_not_found("g1").http_status(), 404);
        assert_eq!(GuestError::AlreadyExists { guest_id: "g1".into() }.http_status(), 409);
        assert_eq!(GuestError::invalid_state("g1", "running").http_status(), 400);
        assert_eq!(
            GuestError::Unsupported { operation: "live snapshot".into(), reason: String::new() }
                .http_status(),
            501
        );
        assert_eq!(GuestError::AgentBusy { guest_id: "g1".into() }.kind(), ErrorKind::Unavailable);
    }

    #[test]
    fn test_error_body_carries_message() {
        let body = GuestError::MissingParameter { name: "desc".into() }.to_body();
        assert_eq!(body.code, 400);
        assert_eq!(body.class, ErrorKind::MissingParameter);
        assert!(body.details.contains("desc"));
    }
}
