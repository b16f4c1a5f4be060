//! Torii SDK - host seam for the script-VM interop bridge
//!
//! This crate provides the minimal types a host runtime implements to be
//! driven by the Torii bridge, without depending on the bridge itself:
//!
//! - [`HostHandle`] — opaque raw handle with a null sentinel
//! - [`HostRuntime`] — thread attachment, durable reference lifecycle,
//!   identity, diagnostics, pending-exception state, the narrow
//!   reflection-dispatch callback, and classpath bind/load
//! - [`DispatchOp`] — the dispatch request contract
//! - [`HostError`] — host-side failures

#![warn(missing_docs)]

mod error;
mod handle;
mod runtime;

pub use error::{HostError, HostResult};
pub use handle::HostHandle;
pub use runtime::{DispatchOp, HostRuntime};
