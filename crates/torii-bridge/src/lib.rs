//! Torii bridge - object bridge and interop marshaling layer
//!
//! Connects the Torii script VM to a managed host runtime:
//!
//! - Environment resolver: per-thread host calling contexts over a
//!   process-wide runtime registry ([`register_runtime`], [`resolve`])
//! - Reference registry / object bridge: host handles wrapped as script
//!   userdata with durable-reference lifetime ([`wrap`], [`unwrap`],
//!   [`release`])
//! - Dispatch tables: per-variant metatables routing script operations to
//!   the host dispatch callback
//! - Exception bridge: host exceptions captured into a per-VM slot and
//!   re-raised as script errors ([`translate`], [`check_and_clear`])
//! - Buffer serializer: compiled-chunk capture into a growable buffer
//!   ([`DumpBuffer`], [`dump_to_buffer`], [`load_buffer`])
//! - Cross-VM value copier ([`copy_value`])
//! - Structural dumper ([`dump_value`], [`describe_stack`])
//! - Module loader bridge: host classpath in the module-resolution chain
//!   plus the `import` / `dump` script globals (installed by
//!   [`open_bridge`])
//!
//! [`mock::MockHost`] is an in-process host runtime for tests.

#![warn(rust_2018_idioms)]

pub mod buffer;
mod copy;
mod dispatch;
mod dump;
mod env;
mod error;
mod except;
mod handle;
mod loader;
pub mod mock;

use torii_sdk::HostHandle;
use torii_vm::Vm;

pub use buffer::{dump_to_buffer, load_buffer, BufferError, DumpBuffer, DUMP_BUFFER_INITIAL};
pub use copy::copy_value;
pub use dispatch::{push_host_closure, push_host_function};
pub use dump::{describe_stack, dump_value};
pub use env::{
    context, register_runtime, resolve, unregister_runtime, HostContext, RuntimeId,
};
pub use error::{BridgeError, BridgeResult};
pub use except::{check_and_clear, has_pending_error, translate, PENDING_ERROR_GLOBAL};
pub use handle::{handle_kind, release, try_unwrap, unwrap, wrap, HandleKind};

use env::BridgeState;

/// Open the bridge on a VM: bind it to a registered host runtime, build the
/// wrapped-handle metatables, and install the module loader and the
/// `import` / `dump` globals.
///
/// Call once per VM instance; the loader guard makes a second call a no-op
/// apart from refreshing the runtime binding.
pub fn open_bridge(vm: &mut Vm, runtime: RuntimeId) -> BridgeResult<()> {
    vm.set_extension(BridgeState {
        runtime_id: runtime,
    });
    for kind in HandleKind::ALL {
        dispatch::bridge_metatable(vm, kind);
    }
    loader::install(vm)?;
    Ok(())
}

/// Wrap and push a host object instance
pub fn push_object(vm: &mut Vm, handle: HostHandle) -> BridgeResult<()> {
    let ctx = context(vm)?;
    wrap(vm, &ctx, handle, HandleKind::Object)
}

/// Wrap and push a host class
pub fn push_class(vm: &mut Vm, handle: HostHandle) -> BridgeResult<()> {
    let ctx = context(vm)?;
    wrap(vm, &ctx, handle, HandleKind::Class)
}

/// Wrap and push a host array
pub fn push_array(vm: &mut Vm, handle: HostHandle) -> BridgeResult<()> {
    let ctx = context(vm)?;
    wrap(vm, &ctx, handle, HandleKind::Array)
}

/// The wrapped handle at `idx` regardless of variant, with its variant
pub fn to_handle(vm: &Vm, idx: isize) -> Option<(HandleKind, HostHandle)> {
    let kind = handle_kind(vm, idx)?;
    try_unwrap(vm, idx, kind).map(|h| (kind, h))
}
