//! Dispatch tables
//!
//! Builds the per-variant metatables that route script operations onto the
//! host dispatch callback. One `populate` match covers all three variants
//! so their operation sets cannot drift apart. The finalize slot is not a
//! metatable entry: the release hook is installed directly on every wrapped
//! userdata (see `handle::release_payload`).
//!
//! Every entry point resolves the host calling context first and fails with
//! a bridge-unavailable error when none is attached — a metamethod must
//! never dereference a missing context.

use torii_sdk::{DispatchOp, HostHandle};
use torii_vm::{fmt_number, TableRef, Value, Vm, VmError, VmResult};

use crate::env::{self, HostContext};
use crate::error::{BridgeError, BridgeResult};
use crate::except;
use crate::handle::{self, HandleKind};

/// The metatable of a wrapped-handle variant, built on first use
pub(crate) fn bridge_metatable(vm: &mut Vm, kind: HandleKind) -> TableRef {
    let (meta, created) = vm.named_metatable(kind.metatable_name());
    if created {
        populate(&meta, kind);
    }
    meta
}

fn populate(meta: &TableRef, kind: HandleKind) {
    let mut m = meta.borrow_mut();
    m.raw_set_str("__eq", Value::native(meta_equals));
    m.raw_set_str("__tostring", Value::native(meta_tostring));
    m.raw_set_str("__concat", Value::native(meta_concat));
    match kind {
        HandleKind::Object => {
            m.raw_set_str("__index", Value::native(object_index));
            m.raw_set_str("__newindex", Value::native(object_newindex));
            m.raw_set_str("__len", Value::native(object_length));
        }
        HandleKind::Class => {
            m.raw_set_str("__index", Value::native(class_index));
            m.raw_set_str("__newindex", Value::native(class_newindex));
            m.raw_set_str("__call", Value::native(class_construct));
            // deliberate repurposing kept for compatibility: #Class is the
            // fully-qualified class name, not a length
            m.raw_set_str("__len", Value::native(class_qualified_name));
        }
        HandleKind::Array => {
            m.raw_set_str("__index", Value::native(array_index));
            m.raw_set_str("__newindex", Value::native(array_newindex));
            m.raw_set_str("__len", Value::native(array_length));
        }
    }
}

// ============================================================================
// Argument helpers
// ============================================================================

pub(crate) fn context_or_raise(vm: &Vm) -> VmResult<HostContext> {
    env::context(vm).map_err(VmError::from)
}

pub(crate) fn arg_slot(vm: &Vm, i: usize) -> VmResult<isize> {
    vm.arg_index(i)
        .map(|abs| abs as isize)
        .ok_or_else(|| VmError::msg(format!("missing argument #{}", i + 1)))
}

fn unwrap_arg(vm: &Vm, i: usize, kind: HandleKind) -> VmResult<HostHandle> {
    let slot = arg_slot(vm, i)?;
    handle::unwrap(vm, slot, kind).map_err(VmError::from)
}

/// Attribute names follow the string-coercion rule: numbers are accepted
/// and rendered, everything else is rejected.
fn attr_name_arg(vm: &Vm, i: usize) -> VmResult<String> {
    match vm.arg(i) {
        Some(Value::Str(s)) => Ok(s.to_string()),
        Some(Value::Number(n)) => Ok(fmt_number(*n)),
        Some(other) => Err(VmError::msg(format!(
            "attribute name must be a string, got {}",
            other.type_name()
        ))),
        None => Err(VmError::msg(format!("missing argument #{}", i + 1))),
    }
}

// ============================================================================
// Common metamethods
// ============================================================================

/// Two wrapped handles are equal iff both are live, of the same variant,
/// and the host reports the same identity. Absence of either handle is
/// "not equal", never an error.
fn meta_equals(vm: &mut Vm) -> VmResult<usize> {
    let kind = vm
        .arg(0)
        .and_then(|v| handle::kind_of_value(vm, v))
        .or_else(|| vm.arg(1).and_then(|v| handle::kind_of_value(vm, v)));
    let Some(kind) = kind else {
        vm.push_bool(false)?;
        return Ok(1);
    };
    let a = arg_slot(vm, 0).ok().and_then(|s| handle::try_unwrap(vm, s, kind));
    let b = arg_slot(vm, 1).ok().and_then(|s| handle::try_unwrap(vm, s, kind));
    match (a, b) {
        (Some(a), Some(b)) => {
            let ctx = context_or_raise(vm)?;
            let same = ctx.runtime.same_object(a, b);
            vm.push_bool(same)?;
        }
        _ => vm.push_bool(false)?,
    }
    Ok(1)
}

/// Host string rendering. A released wrapper renders as nil; a host
/// exception is captured and the operation yields no value.
fn meta_tostring(vm: &mut Vm) -> VmResult<usize> {
    let slot = arg_slot(vm, 0)?;
    let kind = handle::handle_kind(vm, slot).ok_or_else(|| {
        VmError::msg("'__tostring' called on a value that is not a wrapped handle")
    })?;
    let Some(target) = handle::try_unwrap(vm, slot, kind) else {
        vm.push_nil()?;
        return Ok(1);
    };
    let ctx = context_or_raise(vm)?;
    match ctx.runtime.describe(target) {
        Some(text) => {
            vm.push_str(text)?;
            Ok(1)
        }
        None => {
            except::check_and_clear(vm, &ctx)?;
            Ok(0)
        }
    }
}

/// Generic concatenation: convert whichever side needs it to string form
/// and join. Neither operand is required to be a wrapped handle.
fn meta_concat(vm: &mut Vm) -> VmResult<usize> {
    let left_slot = arg_slot(vm, 0)?;
    let right_slot = arg_slot(vm, 1)?;
    let left = vm.tostring(left_slot)?;
    let right = vm.tostring(right_slot)?;
    vm.push_str(format!("{}{}", left, right))?;
    Ok(1)
}

// ============================================================================
// Object metamethods
// ============================================================================

fn object_index(vm: &mut Vm) -> VmResult<usize> {
    let ctx = context_or_raise(vm)?;
    let object = unwrap_arg(vm, 0, HandleKind::Object)?;
    let name = attr_name_arg(vm, 1)?;
    let raw = ctx
        .runtime
        .dispatch(vm, DispatchOp::ObjectIndex { object, name: &name });
    except::translate(vm, &ctx, raw)
}

fn object_newindex(vm: &mut Vm) -> VmResult<usize> {
    let ctx = context_or_raise(vm)?;
    let object = unwrap_arg(vm, 0, HandleKind::Object)?;
    let name = attr_name_arg(vm, 1)?;
    if vm.arg_count() < 3 {
        return Err(BridgeError::MissingValue { field: name }.into());
    }
    let raw = ctx
        .runtime
        .dispatch(vm, DispatchOp::ObjectNewIndex { object, name: &name });
    except::translate(vm, &ctx, raw)
}

fn object_length(vm: &mut Vm) -> VmResult<usize> {
    let ctx = context_or_raise(vm)?;
    let object = unwrap_arg(vm, 0, HandleKind::Object)?;
    let raw = ctx.runtime.dispatch(vm, DispatchOp::ObjectLength { object });
    except::translate(vm, &ctx, raw)
}

// ============================================================================
// Class metamethods
// ============================================================================

fn class_index(vm: &mut Vm) -> VmResult<usize> {
    let ctx = context_or_raise(vm)?;
    let class = unwrap_arg(vm, 0, HandleKind::Class)?;
    let name = attr_name_arg(vm, 1)?;
    let raw = ctx
        .runtime
        .dispatch(vm, DispatchOp::ClassIndex { class, name: &name });
    except::translate(vm, &ctx, raw)
}

fn class_newindex(vm: &mut Vm) -> VmResult<usize> {
    let ctx = context_or_raise(vm)?;
    let class = unwrap_arg(vm, 0, HandleKind::Class)?;
    let name = attr_name_arg(vm, 1)?;
    if vm.arg_count() < 3 {
        return Err(BridgeError::MissingValue { field: name }.into());
    }
    let raw = ctx
        .runtime
        .dispatch(vm, DispatchOp::ClassNewIndex { class, name: &name });
    except::translate(vm, &ctx, raw)
}

/// Calling a class constructs an instance; marshaling the constructor
/// arguments is the host callback's concern, not this layer's.
fn class_construct(vm: &mut Vm) -> VmResult<usize> {
    let ctx = context_or_raise(vm)?;
    let class = unwrap_arg(vm, 0, HandleKind::Class)?;
    let raw = ctx.runtime.dispatch(vm, DispatchOp::Construct { class });
    except::translate(vm, &ctx, raw)
}

fn class_qualified_name(vm: &mut Vm) -> VmResult<usize> {
    let ctx = context_or_raise(vm)?;
    let class = unwrap_arg(vm, 0, HandleKind::Class)?;
    match ctx.runtime.class_name(class) {
        Some(name) => {
            vm.push_str(name)?;
            Ok(1)
        }
        None => except::translate(vm, &ctx, -1),
    }
}

// ============================================================================
// Array metamethods
// ============================================================================

fn array_index(vm: &mut Vm) -> VmResult<usize> {
    let ctx = context_or_raise(vm)?;
    let array = unwrap_arg(vm, 0, HandleKind::Array)?;
    let raw = ctx.runtime.dispatch(vm, DispatchOp::ArrayIndex { array });
    except::translate(vm, &ctx, raw)
}

fn array_newindex(vm: &mut Vm) -> VmResult<usize> {
    let ctx = context_or_raise(vm)?;
    let array = unwrap_arg(vm, 0, HandleKind::Array)?;
    if vm.arg_count() < 3 {
        return Err(BridgeError::MissingValue {
            field: "array element".to_string(),
        }
        .into());
    }
    let raw = ctx.runtime.dispatch(vm, DispatchOp::ArrayNewIndex { array });
    except::translate(vm, &ctx, raw)
}

fn array_length(vm: &mut Vm) -> VmResult<usize> {
    let ctx = context_or_raise(vm)?;
    let array = unwrap_arg(vm, 0, HandleKind::Array)?;
    match ctx.runtime.array_length(array) {
        Some(len) => {
            vm.push_number(len as f64)?;
            Ok(1)
        }
        None => except::translate(vm, &ctx, -1),
    }
}

// ============================================================================
// Host callables
// ============================================================================

/// Wrap a host callable as a script function.
///
/// The callable handle rides as the closure's last upvalue; invoking the
/// closure dispatches the call through the exception bridge.
pub fn push_host_function(vm: &mut Vm, ctx: &HostContext, func: HostHandle) -> BridgeResult<()> {
    handle::wrap(vm, ctx, func, HandleKind::Object)?;
    vm.push_closure(host_function_call, 1)?;
    Ok(())
}

/// Wrap a host callable together with `extra` already-pushed upvalues
pub fn push_host_closure(
    vm: &mut Vm,
    ctx: &HostContext,
    func: HostHandle,
    extra: usize,
) -> BridgeResult<()> {
    handle::wrap(vm, ctx, func, HandleKind::Object)?;
    vm.push_closure(host_function_call, extra + 1)?;
    Ok(())
}

fn host_function_call(vm: &mut Vm) -> VmResult<usize> {
    let ctx = context_or_raise(vm)?;
    let count = vm.upvalue_count();
    let target = count
        .checked_sub(1)
        .and_then(|last| vm.upvalue(last))
        .and_then(|v| handle::handle_of_value(vm, &v, HandleKind::Object))
        .ok_or_else(|| VmError::msg("host function closure lost its target"))?;
    let raw = ctx
        .runtime
        .dispatch(vm, DispatchOp::CallFunction { function: target });
    except::translate(vm, &ctx, raw)
}
