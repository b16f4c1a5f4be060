//! Object bridge integration tests
//!
//! Drives the reference registry, dispatch tables and exception bridge
//! end-to-end against the in-process mock host: wrap/release lifecycle,
//! variant discipline, metamethod dispatch, and the pending-error slot
//! contract.

use std::sync::Arc;

use torii_sdk::HostRuntime;

use torii_bridge::mock::{MockBehavior, MockHost, MockValue};
use torii_bridge::{
    has_pending_error, open_bridge, push_array, push_class, push_object, release, resolve,
    to_handle, translate, try_unwrap, unwrap, BridgeError, HandleKind, RuntimeId,
};
use torii_vm::{Value, Vm};

fn harness() -> (Arc<MockHost>, RuntimeId, Vm) {
    let host = MockHost::new();
    let id = host.register();
    let mut vm = Vm::new();
    open_bridge(&mut vm, id).unwrap();
    (host, id, vm)
}

// ===== Reference lifecycle =====

#[test]
fn test_wrap_then_release_leaves_no_reference() {
    let (host, _, mut vm) = harness();
    host.define_class("com.acme.Widget");
    let object = host.new_object("com.acme.Widget");

    push_object(&mut vm, object).unwrap();
    assert_eq!(host.live_durable_refs(), 1);

    release(&mut vm, -1).unwrap();
    assert_eq!(host.live_durable_refs(), 0);

    // releasing twice is a no-op
    release(&mut vm, -1).unwrap();
    assert_eq!(host.live_durable_refs(), 0);
}

#[test]
fn test_collection_releases_reference() {
    let (host, _, mut vm) = harness();
    host.define_class("com.acme.Widget");
    let object = host.new_object("com.acme.Widget");

    push_object(&mut vm, object).unwrap();
    assert_eq!(host.live_durable_refs(), 1);
    drop(vm.pop());
    assert_eq!(host.live_durable_refs(), 0);
}

#[test]
fn test_vm_drop_releases_references() {
    let (host, _, mut vm) = harness();
    host.define_class("com.acme.Widget");
    for _ in 0..5 {
        let object = host.new_object("com.acme.Widget");
        push_object(&mut vm, object).unwrap();
    }
    assert_eq!(host.live_durable_refs(), 5);
    drop(vm);
    assert_eq!(host.live_durable_refs(), 0);
}

#[test]
fn test_finalizer_skips_release_without_context() {
    let (host, id, mut vm) = harness();
    host.define_class("com.acme.Widget");
    let object = host.new_object("com.acme.Widget");
    push_object(&mut vm, object).unwrap();
    assert_eq!(host.live_durable_refs(), 1);

    // with the runtime gone the finalizer must skip, not fault
    torii_bridge::unregister_runtime(id);
    drop(vm);
    assert_eq!(host.live_durable_refs(), 1);
}

#[test]
fn test_wrap_fails_when_reference_table_exhausted() {
    let (host, _, mut vm) = harness();
    host.define_class("com.acme.Widget");
    host.set_ref_capacity(Some(1));
    let first = host.new_object("com.acme.Widget");
    let second = host.new_object("com.acme.Widget");

    push_object(&mut vm, first).unwrap();
    let before = vm.top();
    let err = push_object(&mut vm, second).unwrap_err();
    assert!(matches!(err, BridgeError::RefAcquire));
    // failure allocates nothing in the script VM
    assert_eq!(vm.top(), before);
}

// ===== Variant discipline =====

#[test]
fn test_unwrap_rejects_other_variants() {
    let (host, _, mut vm) = harness();
    host.define_class("com.acme.Widget");
    let object = host.new_object("com.acme.Widget");
    let class = host.class_handle("com.acme.Widget").unwrap();
    let array = host.new_array(vec![1.0]);

    push_object(&mut vm, object).unwrap();
    push_class(&mut vm, class).unwrap();
    push_array(&mut vm, array).unwrap();

    for (slot, kind) in [
        (0, HandleKind::Object),
        (1, HandleKind::Class),
        (2, HandleKind::Array),
    ] {
        assert!(unwrap(&vm, slot, kind).is_ok());
        for other in HandleKind::ALL {
            if other != kind {
                assert!(matches!(
                    unwrap(&vm, slot, other),
                    Err(BridgeError::TypeMismatch { .. })
                ));
                assert!(try_unwrap(&vm, slot, other).is_none());
            }
        }
    }
}

#[test]
fn test_try_unwrap_on_plain_values() {
    let (_, _, mut vm) = harness();
    vm.push_number(1.0).unwrap();
    vm.push_str("s").unwrap();
    assert!(try_unwrap(&vm, 0, HandleKind::Object).is_none());
    assert!(try_unwrap(&vm, 1, HandleKind::Class).is_none());
    assert!(to_handle(&vm, 0).is_none());
}

#[test]
fn test_released_handle_reads_as_absent() {
    let (host, _, mut vm) = harness();
    host.define_class("com.acme.Widget");
    let object = host.new_object("com.acme.Widget");
    push_object(&mut vm, object).unwrap();
    release(&mut vm, -1).unwrap();
    assert!(try_unwrap(&vm, -1, HandleKind::Object).is_none());
    assert!(matches!(
        unwrap(&vm, -1, HandleKind::Object),
        Err(BridgeError::TypeMismatch { .. })
    ));
}

// ===== Dispatch: attribute access =====

#[test]
fn test_class_static_read() {
    let (host, _, mut vm) = harness();
    host.define_class("com.acme.Counter");
    host.set_static("com.acme.Counter", "limit", MockValue::Number(42.0));
    let class = host.class_handle("com.acme.Counter").unwrap();

    push_class(&mut vm, class).unwrap();
    vm.push_str("limit").unwrap();
    let results = vm.get_table().unwrap();
    assert_eq!(results, 1);
    assert!(vm.pop().unwrap().raw_equals(&Value::Number(42.0)));
}

#[test]
fn test_class_static_write_round_trip() {
    let (host, _, mut vm) = harness();
    host.define_class("com.acme.Counter");
    host.set_static("com.acme.Counter", "limit", MockValue::Number(1.0));
    let class = host.class_handle("com.acme.Counter").unwrap();

    push_class(&mut vm, class).unwrap();
    let class_value = vm.peek(0).cloned().unwrap();
    vm.push_str("limit").unwrap();
    vm.push_number(99.0).unwrap();
    vm.set_table().unwrap();

    vm.push(class_value).unwrap();
    vm.push_str("limit").unwrap();
    vm.get_table().unwrap();
    assert!(vm.pop().unwrap().raw_equals(&Value::Number(99.0)));
}

#[test]
fn test_write_without_value_is_an_arity_error() {
    let (host, _, mut vm) = harness();
    host.define_class("com.acme.Counter");
    let class = host.class_handle("com.acme.Counter").unwrap();
    push_class(&mut vm, class).unwrap();
    let class_value = vm.pop().unwrap();

    let meta = vm
        .get_named_metatable(HandleKind::Class.metatable_name())
        .unwrap();
    let handler = meta.borrow().raw_get_str("__newindex");
    vm.push(handler).unwrap();
    vm.push(class_value).unwrap();
    vm.push_str("limit").unwrap();
    let err = vm.call(2).unwrap_err();
    assert!(err.message().contains("missing value"));
}

#[test]
fn test_object_field_read_and_write() {
    let (host, _, mut vm) = harness();
    host.define_class("com.acme.Point");
    let object = host.new_object("com.acme.Point");
    host.set_field(object, "x", MockValue::Number(3.0));

    push_object(&mut vm, object).unwrap();
    let object_value = vm.peek(0).cloned().unwrap();
    vm.push_str("x").unwrap();
    vm.get_table().unwrap();
    assert!(vm.pop().unwrap().raw_equals(&Value::Number(3.0)));

    vm.push(object_value.clone()).unwrap();
    vm.push_str("x").unwrap();
    vm.push_number(8.0).unwrap();
    vm.set_table().unwrap();

    vm.push(object_value).unwrap();
    vm.push_str("x").unwrap();
    vm.get_table().unwrap();
    assert!(vm.pop().unwrap().raw_equals(&Value::Number(8.0)));
}

#[test]
fn test_missing_member_raises_host_exception() {
    let (host, _, mut vm) = harness();
    host.define_class("com.acme.Point");
    let object = host.new_object("com.acme.Point");
    push_object(&mut vm, object).unwrap();
    vm.push_str("nope").unwrap();
    let err = vm.get_table().unwrap_err();
    assert!(err.message().contains("no such member"));
    assert!(has_pending_error(&vm));
}

// ===== Dispatch: construction =====

#[test]
fn test_class_call_constructs_instance() {
    let (host, _, mut vm) = harness();
    host.define_class("com.acme.Point");
    host.set_template_field("com.acme.Point", "x", MockValue::Number(0.0));
    let class = host.class_handle("com.acme.Point").unwrap();

    push_class(&mut vm, class).unwrap();
    let results = vm.call(0).unwrap();
    assert_eq!(results, 1);
    assert_eq!(to_handle(&vm, -1).unwrap().0, HandleKind::Object);

    vm.push_str("x").unwrap();
    vm.get_table().unwrap();
    assert!(vm.pop().unwrap().raw_equals(&Value::Number(0.0)));
}

// ===== Dispatch: equality =====

#[test]
fn test_equals_same_host_identity() {
    let (host, _, mut vm) = harness();
    host.define_class("com.acme.Widget");
    let object = host.new_object("com.acme.Widget");

    // two distinct wrappers around one host object
    push_object(&mut vm, object).unwrap();
    push_object(&mut vm, object).unwrap();
    assert!(vm.values_equal(0, 1).unwrap());

    let other = host.new_object("com.acme.Widget");
    push_object(&mut vm, other).unwrap();
    assert!(!vm.values_equal(0, 2).unwrap());
}

#[test]
fn test_equals_across_variants_is_false() {
    let (host, _, mut vm) = harness();
    host.define_class("com.acme.Widget");
    let class = host.class_handle("com.acme.Widget").unwrap();

    // the same host object wrapped under two different variants
    push_class(&mut vm, class).unwrap();
    push_object(&mut vm, class).unwrap();
    assert!(!vm.values_equal(0, 1).unwrap());
}

#[test]
fn test_equals_with_released_handle_is_false_not_an_error() {
    let (host, _, mut vm) = harness();
    host.define_class("com.acme.Widget");
    let object = host.new_object("com.acme.Widget");
    push_object(&mut vm, object).unwrap();
    push_object(&mut vm, object).unwrap();
    release(&mut vm, 0).unwrap();
    assert!(!vm.values_equal(0, 1).unwrap());
}

// ===== Dispatch: to-string, length, concatenation =====

#[test]
fn test_tostring_uses_host_rendering() {
    let (host, _, mut vm) = harness();
    host.define_class("com.acme.Widget");
    let object = host.new_object("com.acme.Widget");
    let class = host.class_handle("com.acme.Widget").unwrap();

    push_object(&mut vm, object).unwrap();
    assert!(vm.tostring(-1).unwrap().starts_with("com.acme.Widget@"));
    push_class(&mut vm, class).unwrap();
    assert_eq!(&*vm.tostring(-1).unwrap(), "class com.acme.Widget");
}

#[test]
fn test_tostring_exception_populates_slot() {
    let (host, _, mut vm) = harness();
    host.define_class("com.acme.Widget");
    let object = host.new_object("com.acme.Widget");
    push_object(&mut vm, object).unwrap();
    host.invalidate_object(object);

    assert!(vm.tostring(-1).is_err());
    assert!(has_pending_error(&vm));
}

#[test]
fn test_class_length_is_qualified_name() {
    let (host, _, mut vm) = harness();
    host.define_class("com.acme.deep.Thing");
    let class = host.class_handle("com.acme.deep.Thing").unwrap();
    push_class(&mut vm, class).unwrap();
    let results = vm.length(-1).unwrap();
    assert_eq!(results, 1);
    assert!(vm.pop().unwrap().raw_equals(&Value::str("com.acme.deep.Thing")));
}

#[test]
fn test_array_length_and_elements() {
    let (host, _, mut vm) = harness();
    let array = host.new_array(vec![10.0, 20.0, 30.0]);
    push_array(&mut vm, array).unwrap();
    let array_value = vm.peek(0).cloned().unwrap();

    vm.length(-1).unwrap();
    assert!(vm.pop().unwrap().raw_equals(&Value::Number(3.0)));

    vm.push(array_value.clone()).unwrap();
    vm.push_number(2.0).unwrap();
    vm.get_table().unwrap();
    assert!(vm.pop().unwrap().raw_equals(&Value::Number(20.0)));

    // element write
    vm.push(array_value.clone()).unwrap();
    vm.push_number(2.0).unwrap();
    vm.push_number(99.0).unwrap();
    vm.set_table().unwrap();
    vm.push(array_value.clone()).unwrap();
    vm.push_number(2.0).unwrap();
    vm.get_table().unwrap();
    assert!(vm.pop().unwrap().raw_equals(&Value::Number(99.0)));

    // out of bounds raises through the exception bridge
    vm.push(array_value).unwrap();
    vm.push_number(7.0).unwrap();
    let err = vm.get_table().unwrap_err();
    assert!(err.message().contains("out of bounds"));
}

#[test]
fn test_object_length_dispatches_to_host() {
    let (host, _, mut vm) = harness();
    host.define_class("com.acme.Bag");
    let object = host.new_object("com.acme.Bag");
    host.set_field(object, "a", MockValue::Number(1.0));
    host.set_field(object, "b", MockValue::Number(2.0));
    push_object(&mut vm, object).unwrap();
    vm.length(-1).unwrap();
    assert!(vm.pop().unwrap().raw_equals(&Value::Number(2.0)));
}

#[test]
fn test_concat_with_plain_string_either_side() {
    let (host, _, mut vm) = harness();
    host.define_class("com.acme.Widget");
    let class = host.class_handle("com.acme.Widget").unwrap();

    push_class(&mut vm, class).unwrap();
    let class_value = vm.peek(0).cloned().unwrap();
    vm.push_str(" rules").unwrap();
    vm.concat2().unwrap();
    assert!(vm
        .pop()
        .unwrap()
        .raw_equals(&Value::str("class com.acme.Widget rules")));

    vm.push_str("the ").unwrap();
    vm.push(class_value).unwrap();
    vm.concat2().unwrap();
    assert!(vm
        .pop()
        .unwrap()
        .raw_equals(&Value::str("the class com.acme.Widget")));
}

// ===== Environment resolver =====

#[test]
fn test_operations_fail_cleanly_without_context() {
    let (host, id, mut vm) = harness();
    host.define_class("com.acme.Widget");
    let class = host.class_handle("com.acme.Widget").unwrap();
    push_class(&mut vm, class).unwrap();

    torii_bridge::unregister_runtime(id);
    vm.push_str("anything").unwrap();
    let err = vm.get_table().unwrap_err();
    assert!(err.message().contains("bridge unavailable"));
}

#[test]
fn test_attachment_is_cached_per_thread() {
    let (host, id, _vm) = harness();
    resolve(id).unwrap();
    resolve(id).unwrap();
    assert_eq!(host.attach_count(), 1);
}

// ===== Exception bridge =====

#[test]
fn test_throwing_member_sets_slot_and_success_clears_it() {
    let (host, _, mut vm) = harness();
    host.define_class("com.acme.Boomer");
    let object = host.new_object("com.acme.Boomer");
    host.set_field(object, "bad", MockValue::Throws("kaboom".to_string()));
    host.set_field(object, "good", MockValue::Number(5.0));

    push_object(&mut vm, object).unwrap();
    let object_value = vm.pop().unwrap();

    vm.push(object_value.clone()).unwrap();
    vm.push_str("bad").unwrap();
    let err = vm.get_table().unwrap_err();
    assert!(err.message().contains("kaboom"));
    assert!(has_pending_error(&vm));

    vm.push(object_value).unwrap();
    vm.push_str("good").unwrap();
    vm.get_table().unwrap();
    vm.pop();
    assert!(!has_pending_error(&vm));
}

#[test]
fn test_translate_never_succeeds_with_pending_exception() {
    let (host, id, mut vm) = harness();
    let ctx = resolve(id).unwrap();
    host.inject_exception("sneaky");
    // a non-negative count does not launder a pending exception
    let err = translate(&mut vm, &ctx, 1).unwrap_err();
    assert!(err.message().contains("sneaky"));
    assert!(host.pending_exception().is_none());
}

// ===== Host callables =====

#[test]
fn test_host_function_members() {
    let (host, _, mut vm) = harness();
    host.define_class("com.acme.Calc");
    let object = host.new_object("com.acme.Calc");
    host.set_field(object, "echo", MockValue::Method(MockBehavior::Echo));
    host.set_field(object, "sum", MockValue::Method(MockBehavior::Sum));
    host.set_field(
        object,
        "fail",
        MockValue::Method(MockBehavior::Fail("broken".to_string())),
    );
    push_object(&mut vm, object).unwrap();
    let object_value = vm.pop().unwrap();

    vm.push(object_value.clone()).unwrap();
    vm.push_str("echo").unwrap();
    vm.get_table().unwrap();
    vm.push_str("ping").unwrap();
    let results = vm.call(1).unwrap();
    assert_eq!(results, 1);
    assert!(vm.pop().unwrap().raw_equals(&Value::str("ping")));

    vm.push(object_value.clone()).unwrap();
    vm.push_str("sum").unwrap();
    vm.get_table().unwrap();
    vm.push_number(1.0).unwrap();
    vm.push_number(2.0).unwrap();
    vm.push_number(3.0).unwrap();
    vm.call(3).unwrap();
    assert!(vm.pop().unwrap().raw_equals(&Value::Number(6.0)));

    vm.push(object_value).unwrap();
    vm.push_str("fail").unwrap();
    vm.get_table().unwrap();
    let err = vm.call(0).unwrap_err();
    assert!(err.message().contains("broken"));
    assert!(has_pending_error(&vm));
}

#[test]
fn test_host_closure_with_extra_upvalues() {
    use torii_bridge::push_host_closure;
    let (host, id, mut vm) = harness();
    let echo = host.new_callable(MockBehavior::Echo);
    let ctx = resolve(id).unwrap();

    vm.push_str("spare upvalue").unwrap();
    push_host_closure(&mut vm, &ctx, echo, 1).unwrap();
    assert_eq!(vm.top(), 1);

    vm.push_number(5.0).unwrap();
    let results = vm.call(1).unwrap();
    assert_eq!(results, 1);
    assert!(vm.pop().unwrap().raw_equals(&Value::Number(5.0)));
}
