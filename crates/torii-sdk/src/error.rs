//! Error types for the host seam

/// Result type for host-runtime operations
pub type HostResult<T> = Result<T, HostError>;

/// Host-runtime error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum HostError {
    /// The current OS thread could not be attached to the host runtime
    #[error("failed to attach the current thread to the host runtime")]
    AttachFailed,

    /// The host runtime's durable reference table is exhausted
    #[error("host reference table exhausted")]
    ReferenceExhausted,

    /// Any other host-side failure
    #[error("{0}")]
    Other(String),
}

impl From<String> for HostError {
    fn from(s: String) -> Self {
        HostError::Other(s)
    }
}

impl From<&str> for HostError {
    fn from(s: &str) -> Self {
        HostError::Other(s.to_string())
    }
}
