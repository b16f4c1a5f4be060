//! Exception bridge
//!
//! Every cross-runtime call result passes through [`translate`] — the
//! host's exception state is orthogonal to the returned count, so neither
//! channel may be trusted alone. A captured exception is retained, wrapped,
//! in a per-VM global slot for script-side introspection; the slot is
//! cleared again by the next successful cross-runtime call.

use torii_vm::{Value, Vm, VmResult};

use crate::env::HostContext;
use crate::error::BridgeError;
use crate::handle::{self, HandleKind};

/// Name of the per-VM global holding the most recently captured host
/// exception object (nil when no capture is outstanding)
pub const PENDING_ERROR_GLOBAL: &str = "__host_error__";

/// Check for a pending host exception; if one is present, clear it on the
/// host side, retain the exception object in [`PENDING_ERROR_GLOBAL`], push
/// its diagnostic text and return true.
pub fn check_and_clear(vm: &mut Vm, ctx: &HostContext) -> VmResult<bool> {
    let Some(exception) = ctx.runtime.pending_exception() else {
        return Ok(false);
    };
    ctx.runtime.clear_exception();
    let text = match ctx.runtime.describe(exception) {
        Some(text) => text,
        None => {
            // rendering the exception raised another one
            ctx.runtime.clear_exception();
            "host exception".to_string()
        }
    };
    match handle::wrap(vm, ctx, exception, HandleKind::Object) {
        Ok(()) => vm.set_global(PENDING_ERROR_GLOBAL)?,
        Err(_) => {
            vm.push_nil()?;
            vm.set_global(PENDING_ERROR_GLOBAL)?;
        }
    }
    vm.push_str(&text)?;
    Ok(true)
}

/// The single choke point for cross-runtime call results.
///
/// Raises when a host exception is pending or when `raw` is the negative
/// failure sentinel; otherwise clears the pending-error slot and returns
/// `raw` as the result count.
pub fn translate(vm: &mut Vm, ctx: &HostContext, raw: i32) -> VmResult<usize> {
    if check_and_clear(vm, ctx)? {
        let message = match vm.pop() {
            Some(Value::Str(s)) => s.to_string(),
            _ => "host exception".to_string(),
        };
        return Err(BridgeError::HostException { message }.into());
    }
    if raw < 0 {
        return Err(BridgeError::HostException {
            message: "host call failed".to_string(),
        }
        .into());
    }
    vm.push_nil()?;
    vm.set_global(PENDING_ERROR_GLOBAL)?;
    Ok(raw as usize)
}

/// Whether the pending-error slot currently holds a captured exception
pub fn has_pending_error(vm: &Vm) -> bool {
    !vm.globals()
        .borrow()
        .raw_get_str(PENDING_ERROR_GLOBAL)
        .is_nil()
}
