//! Error types for robot assembly and backend synchronization

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ArmatureError>;

#[derive(Error, Debug)]
pub enum ArmatureError {
    /// Malformed or missing configuration fields
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Two motors, or a motor and a group, share a name
    #[error("Duplicate name: '{0}' is defined more than once")]
    DuplicateName(String),

    /// Group references loop back onto themselves
    #[error("Cyclic group reference: {}", .0.join(" -> "))]
    CyclicGroup(Vec<String>),

    #[error("Backend connection failed for controller '{controller}' at {target} after {attempts} attempt(s): {reason}")]
    BackendConnection {
        controller: String,
        target: String,
        attempts: u32,
        reason: String,
    },

    /// The backend has no counterpart for a configured object
    #[error("Binding failed for controller '{controller}' on {object}: {reason}")]
    Binding {
        controller: String,
        object: String,
        reason: String,
    },

    #[error("Synchronization failed for controller '{controller}': {reason}")]
    Synchronization { controller: String, reason: String },

    #[error("Controller '{0}' has been shut down")]
    ControllerClosed(String),

    #[error("Tokio task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArmatureError {
    /// Short name of the error class, used in logs and JSON output
    pub fn kind(&self) -> &'static str {
        match self {
            ArmatureError::Configuration(_) => "configuration",
            ArmatureError::DuplicateName(_) => "duplicate_name",
            ArmatureError::CyclicGroup(_) => "cyclic_group",
            ArmatureError::BackendConnection { .. } => "backend_connection",
            ArmatureError::Binding { .. } => "binding",
            ArmatureError::Synchronization { .. } => "synchronization",
            ArmatureError::ControllerClosed(_) => "controller_closed",
            ArmatureError::Task(_) => "task",
            ArmatureError::Io(_) => "io",
        }
    }
}

/// Errors reported by backend I/O implementations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendIoError {
    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient I/O failure: {0}")]
    Transient(String),

    #[error("operation timed out")]
    Timeout,

    #[error("session closed")]
    SessionClosed,
}

impl BackendIoError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendIoError::Transient(_) | BackendIoError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = ArmatureError::CyclicGroup(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "Cyclic group reference: a -> b -> a");
        assert_eq!(err.kind(), "cyclic_group");
    }

    #[test]
    fn test_transient_classification() {
        assert!(BackendIoError::Transient("flaky".into()).is_transient());
        assert!(BackendIoError::Timeout.is_transient());
        assert!(!BackendIoError::SessionClosed.is_transient());
        assert!(!BackendIoError::NotFound("m2".into()).is_transient());
    }
}
