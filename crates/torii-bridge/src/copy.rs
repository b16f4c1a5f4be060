//! Cross-VM value copier
//!
//! Deep-copies a value rooted at a stack slot of one VM onto the top of
//! another, independent VM's stack. Scalars and strings copy by value;
//! tables copy structurally through an identity map, so shared and cyclic
//! structure is preserved instead of recursing without bound; native
//! functions copy by entry point (both VMs share one address space by
//! construction); script functions round-trip through the buffer
//! serializer; wrapped handles are duplicated with a freshly acquired
//! durable host reference so each VM releases its own.
//!
//! Failure at any point leaves both stacks at their prior depth — the
//! partially-built value only ever exists off-stack — and propagates
//! without further host calls.

use std::rc::Rc;

use rustc_hash::FxHashMap;
use torii_vm::{Function, Value, Vm, VmError};

use crate::buffer;
use crate::dispatch;
use crate::env::{self, RuntimeId};
use crate::error::{BridgeError, BridgeResult};
use crate::handle;

/// Chunk name given to script functions that crossed VMs
const COPIED_CHUNK_NAME: &str = "=(copied)";

/// Copy the value at `from_idx` in `from` onto the top of `to`'s stack
pub fn copy_value(from: &mut Vm, from_idx: isize, to: &mut Vm) -> BridgeResult<()> {
    let abs = from.abs_index(from_idx)?;
    let value = from
        .at(abs)
        .cloned()
        .ok_or_else(|| VmError::msg("copy source slot is empty"))?;
    let mut visited: FxHashMap<usize, Value> = FxHashMap::default();
    let copied = transfer(from, to, &value, &mut visited)?;
    to.push(copied)?;
    Ok(())
}

fn transfer(
    from: &mut Vm,
    to: &mut Vm,
    value: &Value,
    visited: &mut FxHashMap<usize, Value>,
) -> BridgeResult<Value> {
    match value {
        Value::Nil => Ok(Value::Nil),
        Value::Boolean(b) => Ok(Value::Boolean(*b)),
        Value::Number(n) => Ok(Value::Number(*n)),
        Value::Str(s) => Ok(Value::str(&**s)),
        Value::Table(source) => {
            let identity = Rc::as_ptr(source) as usize;
            if let Some(already) = visited.get(&identity) {
                return Ok(already.clone());
            }
            let dest = to.push_table()?;
            let dest_value = to
                .pop()
                .ok_or_else(|| VmError::msg("fresh table vanished from the stack"))?;
            // record before descending so self-references resolve to the copy
            visited.insert(identity, dest_value.clone());
            let entries = source.borrow().pairs();
            for (key, val) in entries {
                let copied_key = transfer(from, to, &key, visited)?;
                let copied_val = transfer(from, to, &val, visited)?;
                dest.borrow_mut().raw_set(copied_key, copied_val)?;
            }
            let metatable = source.borrow().metatable();
            if let Some(meta) = metatable {
                let copied_meta = transfer(from, to, &Value::Table(meta), visited)?;
                if let Value::Table(m) = copied_meta {
                    dest.borrow_mut().set_metatable(Some(m));
                }
            }
            Ok(dest_value)
        }
        Value::Function(f) => match &**f {
            Function::Native { func, upvalues } => {
                let mut copied_upvalues = Vec::with_capacity(upvalues.len());
                for upvalue in upvalues {
                    copied_upvalues.push(transfer(from, to, upvalue, visited)?);
                }
                Ok(Value::Function(Rc::new(Function::Native {
                    func: *func,
                    upvalues: copied_upvalues,
                })))
            }
            Function::Script { .. } => {
                from.push(value.clone())?;
                let dumped = buffer::dump_to_buffer(from)?;
                to.load_chunk(dumped.bytes(), COPIED_CHUNK_NAME)?;
                to.pop()
                    .ok_or_else(|| VmError::msg("loaded chunk vanished from the stack").into())
            }
        },
        Value::UserData(source) => {
            match handle::kind_of_value(from, value) {
                Some(kind) => {
                    let payload = source.borrow().data().to_vec();
                    let (runtime_raw, host_handle) = handle::decode_payload(&payload)
                        .ok_or_else(|| BridgeError::Unsupported {
                            category: "malformed wrapped handle".to_string(),
                        })?;
                    let new_payload = if host_handle.is_null() {
                        // a released wrapper crosses as a released wrapper
                        payload
                    } else {
                        let ctx = env::resolve(RuntimeId::from_raw(runtime_raw))?;
                        let fresh = ctx
                            .runtime
                            .new_ref(host_handle)
                            .ok_or(BridgeError::RefAcquire)?;
                        handle::encode_payload(ctx.id, fresh)
                    };
                    let meta = dispatch::bridge_metatable(to, kind);
                    to.push_userdata(new_payload, Some(meta), Some(handle::release_payload))?;
                    to.pop()
                        .ok_or_else(|| VmError::msg("fresh userdata vanished from the stack").into())
                }
                None => {
                    if source.borrow().finalizer().is_some() {
                        // byte-duplicating an unknown owned resource would
                        // release it twice
                        return Err(BridgeError::Unsupported {
                            category: "userdata with a foreign finalizer".to_string(),
                        });
                    }
                    let payload = source.borrow().data().to_vec();
                    to.push_userdata(payload, None, None)?;
                    let dest_value = to
                        .pop()
                        .ok_or_else(|| VmError::msg("fresh userdata vanished from the stack"))?;
                    let metatable = source.borrow().metatable();
                    if let Some(meta) = metatable {
                        let copied_meta = transfer(from, to, &Value::Table(meta), visited)?;
                        if let (Value::UserData(u), Value::Table(m)) = (&dest_value, copied_meta) {
                            u.borrow_mut().set_metatable(Some(m));
                        }
                    }
                    Ok(dest_value)
                }
            }
        }
    }
}
