//! Bridge error taxonomy
//!
//! Every failure the bridge can surface to script code falls into one of
//! these classes. All of them are recoverable through the VM's protected
//! calls; conversion into `VmError` happens only at the point where
//! script-visible code resumes.

use torii_vm::VmError;

use crate::buffer::BufferError;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Failures surfaced by the bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// No host calling context is obtainable for the current VM/thread
    #[error("host bridge unavailable: {reason}")]
    Unavailable {
        /// Why resolution failed
        reason: String,
    },

    /// A value was not the expected wrapped-handle variant
    #[error("expected a host {expected} handle, got {got}")]
    TypeMismatch {
        /// Expected variant name
        expected: &'static str,
        /// What was found instead
        got: String,
    },

    /// The host runtime could not grant a durable reference
    #[error("could not acquire a durable host reference")]
    RefAcquire,

    /// The host runtime reported a pending exception
    #[error("{message}")]
    HostException {
        /// The host exception's diagnostic text
        message: String,
    },

    /// A write was attempted without a value to assign
    #[error("missing value to assign to '{field}'")]
    MissingValue {
        /// The target field name
        field: String,
    },

    /// Buffer capture or chunk serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[from] BufferError),

    /// A value category has no defined transfer policy
    #[error("cannot transfer a {category} value")]
    Unsupported {
        /// The offending category
        category: String,
    },

    /// A script-VM operation failed underneath the bridge
    #[error(transparent)]
    Vm(#[from] VmError),
}

impl From<BridgeError> for VmError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Vm(e) => e,
            other => VmError::msg(other.to_string()),
        }
    }
}
