//! Script-VM error type
//!
//! The embeddable-language contract raises errors through a non-local jump;
//! the Rust surface carries them as `Result` values instead. Every fallible
//! VM operation returns `VmResult` and leaves the stack in a well-defined
//! state when it fails.

/// Result type for script-VM operations
pub type VmResult<T> = Result<T, VmError>;

/// An error raised inside the script VM.
///
/// The payload is the error message as script code would observe it from a
/// protected call. Errors produced by native functions and by the VM's own
/// operations share this one type.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct VmError {
    message: String,
}

impl VmError {
    /// Create an error from a message
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The message script code would see
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for VmError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for VmError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}
