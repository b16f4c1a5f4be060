//! Reference registry / object bridge
//!
//! Wraps host-object handles as script-VM userdata. The payload carries the
//! owning runtime's registry id and one durable host reference; the variant
//! discriminant is the userdata's metatable, which is authoritative — an
//! Object-wrapped handle never satisfies a Class unwrap even if the host
//! object happens to be a class.
//!
//! Release is one-shot: the reference slot is zeroed after the durable
//! reference is returned to the host, so a second release (explicit or from
//! the finalizer) is a no-op. The finalizer runs at a VM-controlled point;
//! if no host context is resolvable there, the release is skipped — leaking
//! one reference beats faulting inside a collection pass.

use std::rc::Rc;

use torii_sdk::HostHandle;
use torii_vm::{Value, Vm};

use crate::dispatch;
use crate::env::{self, HostContext, RuntimeId};
use crate::error::{BridgeError, BridgeResult};

/// Wrapped-handle variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// An object instance
    Object,
    /// A class / type handle
    Class,
    /// An array
    Array,
}

impl HandleKind {
    /// All variants, in a fixed order
    pub const ALL: [HandleKind; 3] = [HandleKind::Object, HandleKind::Class, HandleKind::Array];

    /// Registry name of this variant's metatable
    pub fn metatable_name(self) -> &'static str {
        match self {
            HandleKind::Object => "torii.object",
            HandleKind::Class => "torii.class",
            HandleKind::Array => "torii.array",
        }
    }

    /// Short name used in diagnostics
    pub fn describe(self) -> &'static str {
        match self {
            HandleKind::Object => "object",
            HandleKind::Class => "class",
            HandleKind::Array => "array",
        }
    }
}

/// Byte length of a wrapped-handle payload
pub(crate) const PAYLOAD_LEN: usize = 12;

pub(crate) fn encode_payload(runtime: RuntimeId, handle: HostHandle) -> Vec<u8> {
    let mut data = Vec::with_capacity(PAYLOAD_LEN);
    data.extend_from_slice(&runtime.raw().to_le_bytes());
    data.extend_from_slice(&handle.raw().to_le_bytes());
    data
}

pub(crate) fn decode_payload(data: &[u8]) -> Option<(u32, HostHandle)> {
    if data.len() != PAYLOAD_LEN {
        return None;
    }
    let runtime = u32::from_le_bytes(data[0..4].try_into().ok()?);
    let raw = u64::from_le_bytes(data[4..12].try_into().ok()?);
    Some((runtime, HostHandle::from_raw(raw)))
}

fn clear_payload(data: &mut [u8]) {
    if data.len() == PAYLOAD_LEN {
        data[4..12].fill(0);
    }
}

/// Finalizer installed on every wrapped handle.
///
/// Runs when the script VM collects the wrapper. Must not assume a live
/// host context: if the owning runtime is gone or the thread cannot attach,
/// the release is skipped with a warning.
pub(crate) fn release_payload(data: &mut [u8]) {
    let Some((runtime_raw, handle)) = decode_payload(data) else {
        return;
    };
    if handle.is_null() {
        return;
    }
    match env::resolve(RuntimeId::from_raw(runtime_raw)) {
        Ok(ctx) => {
            ctx.runtime.delete_ref(handle);
            clear_payload(data);
        }
        Err(_) => {
            log::warn!(
                "skipping release of host reference {:#x}: no host context for runtime #{}",
                handle.raw(),
                runtime_raw
            );
        }
    }
}

/// Wrap a host handle as a script-VM value of the given variant.
///
/// Acquires a durable host reference first; if the host cannot grant one,
/// this fails without allocating anything in the script VM. On success one
/// wrapped userdata is pushed.
pub fn wrap(
    vm: &mut Vm,
    ctx: &HostContext,
    handle: HostHandle,
    kind: HandleKind,
) -> BridgeResult<()> {
    if handle.is_null() {
        return Err(BridgeError::RefAcquire);
    }
    let durable = ctx.runtime.new_ref(handle).ok_or(BridgeError::RefAcquire)?;
    let meta = dispatch::bridge_metatable(vm, kind);
    let payload = encode_payload(ctx.id, durable);
    if let Err(e) = vm.push_userdata(payload, Some(meta), Some(release_payload)) {
        ctx.runtime.delete_ref(durable);
        return Err(e.into());
    }
    Ok(())
}

/// The variant of the value at `idx`, if it is a wrapped handle
pub fn handle_kind(vm: &Vm, idx: isize) -> Option<HandleKind> {
    let abs = vm.abs_index(idx).ok()?;
    let value = vm.at(abs)?;
    kind_of_value(vm, value)
}

/// The variant of a wrapped-handle value
pub(crate) fn kind_of_value(vm: &Vm, value: &Value) -> Option<HandleKind> {
    let Value::UserData(u) = value else {
        return None;
    };
    let meta = u.borrow().metatable()?;
    HandleKind::ALL.into_iter().find(|kind| {
        vm.get_named_metatable(kind.metatable_name())
            .is_some_and(|registered| Rc::ptr_eq(&meta, &registered))
    })
}

/// The live host handle carried by a wrapped-handle value of `kind`
pub(crate) fn handle_of_value(vm: &Vm, value: &Value, kind: HandleKind) -> Option<HostHandle> {
    if kind_of_value(vm, value)? != kind {
        return None;
    }
    let Value::UserData(u) = value else {
        return None;
    };
    let (_, handle) = decode_payload(u.borrow().data())?;
    if handle.is_null() {
        None
    } else {
        Some(handle)
    }
}

/// The host handle wrapped at `idx`, or `None` when the value is not a live
/// wrapped handle of `kind`. A released wrapper reads as absent.
pub fn try_unwrap(vm: &Vm, idx: isize, kind: HandleKind) -> Option<HostHandle> {
    let abs = vm.abs_index(idx).ok()?;
    let value = vm.at(abs)?;
    handle_of_value(vm, value, kind)
}

/// The host handle wrapped at `idx`, failing with a type mismatch when the
/// value is anything but a live wrapped handle of `kind`
pub fn unwrap(vm: &Vm, idx: isize, kind: HandleKind) -> BridgeResult<HostHandle> {
    try_unwrap(vm, idx, kind).ok_or_else(|| {
        let got = match vm.abs_index(idx).ok().and_then(|abs| vm.at(abs)) {
            Some(value) => match kind_of_value(vm, value) {
                Some(other) if other != kind => format!("{} handle", other.describe()),
                Some(_) => "released handle".to_string(),
                None => value.type_name().to_string(),
            },
            None => "no value".to_string(),
        };
        BridgeError::TypeMismatch {
            expected: kind.describe(),
            got,
        }
    })
}

/// Explicitly release the wrapped handle at `idx`.
///
/// Idempotent: releasing an already-released wrapper is a no-op. The
/// variant is not checked — any wrapped handle can be released.
pub fn release(vm: &mut Vm, idx: isize) -> BridgeResult<()> {
    let abs = vm.abs_index(idx)?;
    let value = vm.at(abs).cloned();
    match value {
        Some(Value::UserData(u)) if kind_of_value(vm, &Value::UserData(u.clone())).is_some() => {
            release_payload(u.borrow_mut().data_mut());
            Ok(())
        }
        Some(other) => Err(BridgeError::TypeMismatch {
            expected: "wrapped",
            got: other.type_name().to_string(),
        }),
        None => Err(BridgeError::TypeMismatch {
            expected: "wrapped",
            got: "no value".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_round_trip() {
        let runtime = RuntimeId::from_raw(7);
        let data = encode_payload(runtime, HostHandle::from_raw(0xDEAD_BEEF));
        assert_eq!(data.len(), PAYLOAD_LEN);
        let (rt, handle) = decode_payload(&data).unwrap();
        assert_eq!(rt, 7);
        assert_eq!(handle.raw(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_clear_payload_zeroes_only_the_handle() {
        let mut data = encode_payload(RuntimeId::from_raw(3), HostHandle::from_raw(99));
        clear_payload(&mut data);
        let (rt, handle) = decode_payload(&data).unwrap();
        assert_eq!(rt, 3);
        assert!(handle.is_null());
    }

    #[test]
    fn test_decode_rejects_foreign_payloads() {
        assert!(decode_payload(&[1, 2, 3]).is_none());
        assert!(decode_payload(&[0u8; 16]).is_none());
    }
}
