/// Core error taxonomy for the gearbox node agent
use std::path::Path;
use thiserror::Error;

/// Result type for gearbox operations
pub type Result<T> = std::result::Result<T, GearError>;

/// Errors raised by gear and addon lifecycle operations
#[derive(Error, Debug)]
pub enum GearError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Command '{command}' failed (status {status:?}): {stderr}")]
    ExternalTool {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Out of range: {0}")]
    OutOfRange(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Filesystem error: {0}")]
    Filesystem(String),

    #[error("Proxy registry error: {0}")]
    Proxy(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Lock already held by another process")]
    LockBusy,
}

impl GearError {
    /// Filesystem error carrying the offending path
    pub fn fs(path: &Path, err: impl std::fmt::Display) -> Self {
        GearError::Filesystem(format!("{}: {}", path.display(), err))
    }

    /// Process exit code used when this error terminates a command
    pub fn exit_code(&self) -> i32 {
        match self {
            GearError::NotFound(_) => 66,
            GearError::Config(_) | GearError::OutOfRange(_) => 78,
            GearError::LockBusy => 75,
            GearError::Io(_) | GearError::Filesystem(_) => 74,
            _ => 2,
        }
    }
}

impl From<nix::errno::Errno> for GearError {
    fn from(err: nix::errno::Errno) -> Self {
        GearError::Io(std::io::Error::from(err))
    }
}

impl From<serde_json::Error> for GearError {
    fn from(err: serde_json::Error) -> Self {
        GearError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_maps_to_io() {
        let err: GearError = nix::errno::Errno::ENOENT.into();
        match err {
            GearError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_external_tool_message() {
        let err = GearError::ExternalTool {
            command: "setquota -u g1".to_string(),
            status: Some(1),
            stderr: "no quota".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("setquota -u g1"));
        assert!(msg.contains("no quota"));
        assert_eq!(err.exit_code(), 2);
    }
}
