//! Module loader bridge
//!
//! Extends the VM's module-resolution chain with the host classpath and
//! installs the script-side `import` / `dump` globals.
//!
//! The host loader goes in at position 1 of `package.loaders`, guarded by a
//! flag on the package table so repeated installation is a no-op. `import
//! "pkg.*"` records a package prefix and installs (once) an `__index` hook
//! on the globals table; an unresolved global read then tries each recorded
//! prefix in registration order, and the first successful class bind is
//! cached back as a plain global under its simple name so later reads cost
//! nothing.

use std::cell::RefCell;
use std::rc::Rc;

use torii_vm::{Table, TableRef, Value, Vm, VmError, VmResult};

use crate::dispatch::{arg_slot, context_or_raise};
use crate::dump;
use crate::error::BridgeResult;
use crate::except::{self, PENDING_ERROR_GLOBAL};

/// Globals slot holding import state (`packages` list and `injected` flag)
const IMPORT_STATE_GLOBAL: &str = "__import";

/// Flag on the package table marking the host loader as installed
const LOADER_FLAG: &str = "hostloader";

/// Install the host loader and the `import` / `dump` globals
pub(crate) fn install(vm: &mut Vm) -> BridgeResult<()> {
    install_host_loader(vm)?;
    let globals = vm.globals();
    globals.borrow_mut().raw_set_str("import", Value::native(import));
    globals.borrow_mut().raw_set_str("dump", Value::native(dump_global));
    Ok(())
}

fn fresh_table() -> TableRef {
    Rc::new(RefCell::new(Table::new()))
}

/// Fetch a table-valued field, creating and storing an empty table when the
/// field is missing or not a table
fn ensure_table(owner: &TableRef, field: &str) -> TableRef {
    let existing = owner.borrow().raw_get_str(field);
    if let Value::Table(t) = existing {
        return t;
    }
    let t = fresh_table();
    owner.borrow_mut().raw_set_str(field, Value::Table(t.clone()));
    t
}

/// Insert the host module loader at the head of `package.loaders`,
/// shifting existing loaders up. Installs at most once per VM.
fn install_host_loader(vm: &mut Vm) -> BridgeResult<()> {
    let globals = vm.globals();
    let package = ensure_table(&globals, "package");
    if package.borrow().raw_get_str(LOADER_FLAG).is_truthy() {
        return Ok(());
    }
    package
        .borrow_mut()
        .raw_set_str(LOADER_FLAG, Value::Boolean(true));
    let loaders = ensure_table(&package, "loaders");
    let len = loaders.borrow().seq_len();
    let mut l = loaders.borrow_mut();
    for i in (1..=len).rev() {
        let shifted = l.seq_get(i);
        l.raw_set(Value::Number((i + 1) as f64), shifted)?;
    }
    l.raw_set(Value::Number(1.0), Value::native(host_module_loader))?;
    log::debug!("host module loader installed at position 1");
    Ok(())
}

/// Loader entry: offer an unresolved module name to the host classpath
fn host_module_loader(vm: &mut Vm) -> VmResult<usize> {
    let name = string_arg(vm, 0)?;
    let ctx = context_or_raise(vm)?;
    let raw = ctx.runtime.load_module(vm, &name);
    except::translate(vm, &ctx, raw)
}

fn string_arg(vm: &Vm, i: usize) -> VmResult<String> {
    match vm.arg(i) {
        Some(Value::Str(s)) => Ok(s.to_string()),
        Some(other) => Err(VmError::msg(format!(
            "string expected, got {}",
            other.type_name()
        ))),
        None => Err(VmError::msg(format!("missing argument #{}", i + 1))),
    }
}

/// Last `.`/`$`-separated segment of a qualified name
fn simple_name(name: &str) -> &str {
    name.rsplit(['.', '$']).next().unwrap_or(name)
}

/// Walk `package.loaders` in order; the first loader producing a non-nil
/// value resolves the module
fn require(vm: &mut Vm, name: &str) -> VmResult<Option<Value>> {
    let globals = vm.globals();
    let package = match globals.borrow().raw_get_str("package") {
        Value::Table(t) => t,
        _ => return Ok(None),
    };
    let loaders = match package.borrow().raw_get_str("loaders") {
        Value::Table(t) => t,
        _ => return Ok(None),
    };
    let count = loaders.borrow().seq_len();
    for i in 1..=count {
        let loader = loaders.borrow().seq_get(i);
        if loader.is_nil() {
            break;
        }
        let base = vm.top();
        vm.push(loader)?;
        vm.push_str(name)?;
        let results = vm.call(1)?;
        let resolved = if results >= 1 {
            let first = vm.at(vm.top() - results).cloned().unwrap_or(Value::Nil);
            if first.is_nil() {
                None
            } else {
                Some(first)
            }
        } else {
            None
        };
        vm.truncate(base);
        if resolved.is_some() {
            return Ok(resolved);
        }
    }
    Ok(None)
}

/// The `import` global.
///
/// `import "pkg.*"` tracks a package prefix for unresolved-global lookup;
/// `import "pkg.Class"` resolves a module or binds a class and caches it
/// under its simple name; `import { ... }` applies each string entry.
fn import(vm: &mut Vm) -> VmResult<usize> {
    match vm.arg(0).cloned() {
        Some(Value::Str(name)) => import_one(vm, &name),
        Some(Value::Table(batch)) => {
            let entries = batch.borrow().pairs();
            for (_, entry) in entries {
                if let Value::Str(name) = entry {
                    let base = vm.top();
                    import_one(vm, &name)?;
                    vm.truncate(base);
                }
            }
            Ok(0)
        }
        Some(other) => Err(VmError::msg(format!(
            "string or table expected, got {}",
            other.type_name()
        ))),
        None => Err(VmError::msg("string or table expected")),
    }
}

fn import_one(vm: &mut Vm, name: &str) -> VmResult<usize> {
    if let Some(prefix) = name.strip_suffix(".*") {
        track_package(vm, prefix)?;
        return Ok(0);
    }
    // module resolution gets first refusal
    if let Some(module) = require(vm, name)? {
        vm.push(module)?;
        return Ok(1);
    }
    // then the host classpath
    let ctx = context_or_raise(vm)?;
    let base = vm.top();
    let raw = ctx.runtime.bind_class(vm, name);
    match except::translate(vm, &ctx, raw) {
        Ok(count) if count > 0 => {
            let class_slot = vm.top() - count;
            let class = vm.at(class_slot).cloned().unwrap_or(Value::Nil);
            vm.truncate(class_slot);
            vm.push(class.clone())?;
            vm.push(class)?;
            vm.set_global(simple_name(name))?;
            Ok(1)
        }
        Ok(_) => Err(VmError::msg(format!("module '{}' not found", name))),
        Err(e) => {
            // a failed import drops partial results and does not leave a
            // stale captured exception
            vm.truncate(base);
            vm.push_nil()?;
            vm.set_global(PENDING_ERROR_GLOBAL)?;
            Err(e)
        }
    }
}

/// Record a package prefix and make sure the unresolved-global hook is
/// installed (at most once per VM)
fn track_package(vm: &mut Vm, prefix: &str) -> VmResult<()> {
    let globals = vm.globals();
    let state = ensure_table(&globals, IMPORT_STATE_GLOBAL);
    let packages = ensure_table(&state, "packages");
    packages.borrow_mut().seq_push(Value::str(prefix))?;
    if state.borrow().raw_get_str("injected").is_truthy() {
        return Ok(());
    }
    let meta = globals
        .borrow()
        .metatable()
        .unwrap_or_else(fresh_table);
    meta.borrow_mut()
        .raw_set_str("__index", Value::native(resolve_global));
    globals.borrow_mut().set_metatable(Some(meta));
    state
        .borrow_mut()
        .raw_set_str("injected", Value::Boolean(true));
    log::debug!("unresolved-global import hook installed ({}.*)", prefix);
    Ok(())
}

/// `__index` hook on the globals table: try each tracked package prefix in
/// registration order; the first successful class bind wins and is cached
/// as a plain global under the unresolved name.
fn resolve_global(vm: &mut Vm) -> VmResult<usize> {
    // (globals, key)
    let globals = vm.globals();
    let key = match vm.arg(1) {
        Some(Value::Str(s)) => s.to_string(),
        _ => return Ok(0),
    };
    let hit = globals.borrow().raw_get_str(&key);
    if !hit.is_nil() {
        vm.push(hit)?;
        return Ok(1);
    }
    let state = ensure_table(&globals, IMPORT_STATE_GLOBAL);
    let packages = ensure_table(&state, "packages");
    let count = packages.borrow().seq_len();
    for i in 1..=count {
        let prefix = match packages.borrow().seq_get(i) {
            Value::Str(s) => s.to_string(),
            _ => continue,
        };
        let qualified = format!("{}.{}", prefix, key);
        let ctx = context_or_raise(vm)?;
        let base = vm.top();
        let raw = ctx.runtime.bind_class(vm, &qualified);
        let failed = except::check_and_clear(vm, &ctx)?;
        if !failed && raw > 0 {
            let class_slot = vm.top() - raw as usize;
            let class = vm.at(class_slot).cloned().unwrap_or(Value::Nil);
            vm.truncate(base);
            vm.push(class.clone())?;
            vm.push(class)?;
            vm.set_global(&key)?;
            log::debug!("bound host class {} as global '{}'", qualified, key);
            return Ok(1);
        }
        // drop the staged message and reset the captured-exception slot
        // before trying the next prefix
        vm.truncate(base);
        vm.push_nil()?;
        vm.set_global(PENDING_ERROR_GLOBAL)?;
    }
    Ok(0)
}

/// The `dump` global: structural rendering of one argument
fn dump_global(vm: &mut Vm) -> VmResult<usize> {
    let slot = arg_slot(vm, 0)?;
    let text = dump::dump_value(vm, slot)?;
    vm.push_str(text)?;
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_name() {
        assert_eq!(simple_name("com.example.Widget"), "Widget");
        assert_eq!(simple_name("Outer$Inner"), "Inner");
        assert_eq!(simple_name("bare"), "bare");
    }
}
