//! Module loader bridge integration tests
//!
//! Covers the host loader's place in the module-resolution chain, the
//! `import` global in all three forms (package pattern, single class,
//! batch), the unresolved-global hook with its registration-order search
//! and simple-name caching, and the `dump` global.

use std::sync::Arc;

use torii_bridge::mock::MockHost;
use torii_bridge::{has_pending_error, open_bridge, to_handle, HandleKind, RuntimeId};
use torii_vm::{Value, Vm};

fn harness() -> (Arc<MockHost>, RuntimeId, Vm) {
    let host = MockHost::new();
    let id = host.register();
    let mut vm = Vm::new();
    open_bridge(&mut vm, id).unwrap();
    (host, id, vm)
}

/// Call the `import` global with one string argument
fn run_import(vm: &mut Vm, name: &str) -> torii_vm::VmResult<usize> {
    let count = vm.get_global("import")?;
    assert_eq!(count, 1);
    vm.push_str(name)?;
    vm.call(1)
}

#[test]
fn test_loader_installed_once_at_position_one() {
    let (_, id, mut vm) = harness();
    // a second open is a no-op for the loader chain
    open_bridge(&mut vm, id).unwrap();

    let globals = vm.globals();
    let package = match globals.borrow().raw_get_str("package") {
        Value::Table(t) => t,
        other => panic!("expected a package table, got {}", other.type_name()),
    };
    let loaders = match package.borrow().raw_get_str("loaders") {
        Value::Table(t) => t,
        other => panic!("expected a loaders table, got {}", other.type_name()),
    };
    assert_eq!(loaders.borrow().seq_len(), 1);
    assert!(matches!(loaders.borrow().seq_get(1), Value::Function(_)));
}

#[test]
fn test_loader_insertion_shifts_existing_loaders() {
    fn stub(_vm: &mut Vm) -> torii_vm::VmResult<usize> {
        Ok(0)
    }
    let host = MockHost::new();
    let id = host.register();
    let mut vm = Vm::new();
    // a pre-existing loader chain
    let package = vm.push_table().unwrap();
    vm.set_global("package").unwrap();
    let loaders = std::rc::Rc::new(std::cell::RefCell::new(torii_vm::Table::new()));
    loaders.borrow_mut().seq_push(Value::native(stub)).unwrap();
    package
        .borrow_mut()
        .raw_set_str("loaders", Value::Table(loaders.clone()));

    open_bridge(&mut vm, id).unwrap();
    assert_eq!(loaders.borrow().seq_len(), 2);
    // slot 2 is the shifted original
    let shifted = loaders.borrow().seq_get(2);
    assert!(matches!(shifted, Value::Function(_)));
}

#[test]
fn test_import_module_resolves_before_classpath() {
    let (host, _, mut vm) = harness();
    host.define_module("util.text", 7.5);
    let results = run_import(&mut vm, "util.text").unwrap();
    assert_eq!(results, 1);
    assert!(vm.pop().unwrap().raw_equals(&Value::Number(7.5)));
    // the module came from the loader chain, not a class bind
    assert!(host.bind_attempts().is_empty());
}

#[test]
fn test_import_single_class_caches_simple_name() {
    let (host, _, mut vm) = harness();
    host.define_class("com.example.Widget");
    let results = run_import(&mut vm, "com.example.Widget").unwrap();
    assert_eq!(results, 1);
    assert_eq!(to_handle(&vm, -1).unwrap().0, HandleKind::Class);
    vm.pop();

    // cached under the simple name as a plain global
    let globals = vm.globals();
    let cached = globals.borrow().raw_get_str("Widget");
    assert!(matches!(cached, Value::UserData(_)));
}

#[test]
fn test_import_unknown_class_raises_and_clears_slot() {
    let (_host, _, mut vm) = harness();
    let err = run_import(&mut vm, "com.example.Missing").unwrap_err();
    assert!(err.message().contains("class not found"));
    assert!(!has_pending_error(&vm));
}

#[test]
fn test_import_package_then_unresolved_global_binds_once() {
    let (host, _, mut vm) = harness();
    host.define_class("com.example.Widget");

    assert_eq!(run_import(&mut vm, "com.example.*").unwrap(), 0);

    let count = vm.get_global("Widget").unwrap();
    assert_eq!(count, 1);
    assert_eq!(to_handle(&vm, -1).unwrap().0, HandleKind::Class);
    vm.pop();
    assert_eq!(host.bind_attempts(), vec!["com.example.Widget".to_string()]);

    // the second read hits the cached global, no further bind attempts
    let count = vm.get_global("Widget").unwrap();
    assert_eq!(count, 1);
    vm.pop();
    assert_eq!(host.bind_attempts().len(), 1);
}

#[test]
fn test_package_prefixes_tried_in_registration_order() {
    let (host, _, mut vm) = harness();
    host.define_class("second.pkg.Thing");

    run_import(&mut vm, "first.pkg.*").unwrap();
    run_import(&mut vm, "second.pkg.*").unwrap();

    let count = vm.get_global("Thing").unwrap();
    assert_eq!(count, 1);
    vm.pop();
    assert_eq!(
        host.bind_attempts(),
        vec!["first.pkg.Thing".to_string(), "second.pkg.Thing".to_string()]
    );
    // the failed first attempt left no captured exception behind
    assert!(!has_pending_error(&vm));
}

#[test]
fn test_unresolved_global_with_no_match_yields_nothing() {
    let (host, _, mut vm) = harness();
    run_import(&mut vm, "com.example.*").unwrap();
    let count = vm.get_global("Nothing").unwrap();
    assert_eq!(count, 0);
    assert_eq!(host.bind_attempts(), vec!["com.example.Nothing".to_string()]);
    assert!(!has_pending_error(&vm));
}

#[test]
fn test_import_batch_table() {
    let (host, _, mut vm) = harness();
    host.define_class("a.One");
    host.define_class("b.Two");

    let count = vm.get_global("import").unwrap();
    assert_eq!(count, 1);
    let batch = vm.push_table().unwrap();
    batch.borrow_mut().seq_push(Value::str("a.*")).unwrap();
    batch.borrow_mut().seq_push(Value::str("b.*")).unwrap();
    assert_eq!(vm.call(1).unwrap(), 0);

    vm.get_global("One").unwrap();
    vm.pop();
    vm.get_global("Two").unwrap();
    vm.pop();
    // "Two" misses in package "a" before binding in "b"
    assert_eq!(
        host.bind_attempts(),
        vec![
            "a.One".to_string(),
            "a.Two".to_string(),
            "b.Two".to_string()
        ]
    );
}

#[test]
fn test_binding_same_class_twice_yields_equal_handles() {
    let (host, _, mut vm) = harness();
    host.define_class("com.example.Widget");
    run_import(&mut vm, "com.example.Widget").unwrap();
    run_import(&mut vm, "com.example.Widget").unwrap();
    // two distinct wrappers, one host identity
    assert_eq!(vm.top(), 2);
    assert!(!vm.at(0).unwrap().raw_equals(vm.at(1).unwrap()));
    assert!(vm.values_equal(0, 1).unwrap());
}

#[test]
fn test_dump_global_renders_tables() {
    let (_, _, mut vm) = harness();
    let count = vm.get_global("dump").unwrap();
    assert_eq!(count, 1);
    let t = vm.push_table().unwrap();
    t.borrow_mut().raw_set_str("k", Value::str("v"));
    let results = vm.call(1).unwrap();
    assert_eq!(results, 1);
    assert!(vm
        .pop()
        .unwrap()
        .raw_equals(&Value::str("{\n  [\"k\"] = \"v\"\n}")));
}
