//! In-process mock host runtime
//!
//! A small reflective object model implementing [`HostRuntime`] entirely in
//! memory: classes with static members and instance templates, objects,
//! arrays, callables and throwables, plus a durable-reference table with an
//! optional capacity cap. The test suites drive every bridge component
//! through it; embedders can use it to test script code without a real
//! host runtime attached.
//!
//! Locking discipline: the state mutex is never held across a call back
//! into the bridge (wrapping re-enters `new_ref`).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use torii_sdk::{DispatchOp, HostHandle, HostResult, HostRuntime};
use torii_vm::{Value, Vm};

use crate::dispatch;
use crate::env::{self, RuntimeId};
use crate::handle::{self, HandleKind};

/// A member value in the mock object model
#[derive(Clone)]
pub enum MockValue {
    /// Numeric field
    Number(f64),
    /// String field
    Str(String),
    /// Reference to another mock object (by object id)
    Object(u64),
    /// Callable member with a canned behavior
    Method(MockBehavior),
    /// Reading this member raises a host exception
    Throws(String),
}

/// Behavior of a mock callable
#[derive(Clone)]
pub enum MockBehavior {
    /// Return the first call argument unchanged
    Echo,
    /// Return the sum of all numeric call arguments
    Sum,
    /// Raise a host exception
    Fail(String),
}

enum MockObject {
    Class {
        name: String,
        statics: FxHashMap<String, MockValue>,
        template: Vec<(String, MockValue)>,
        constructible: bool,
    },
    Object {
        class: String,
        fields: FxHashMap<String, MockValue>,
    },
    Array {
        elements: Vec<f64>,
    },
    Throwable {
        text: String,
    },
    Callable {
        behavior: MockBehavior,
    },
}

#[derive(Default)]
struct State {
    objects: FxHashMap<u64, MockObject>,
    handles: FxHashMap<u64, u64>,
    durable: FxHashSet<u64>,
    next_object: u64,
    next_handle: u64,
    pending: Option<u64>,
    classes: FxHashMap<String, u64>,
    modules: FxHashMap<String, f64>,
    bind_attempts: Vec<String>,
    ref_capacity: Option<usize>,
}

impl State {
    fn alloc_object(&mut self, object: MockObject) -> u64 {
        self.next_object += 1;
        let id = self.next_object;
        self.objects.insert(id, object);
        id
    }

    fn alloc_handle(&mut self, object_id: u64) -> HostHandle {
        self.next_handle += 1;
        let raw = 0x1000 + self.next_handle;
        self.handles.insert(raw, object_id);
        HostHandle::from_raw(raw)
    }

    fn object_of(&self, handle: HostHandle) -> Option<u64> {
        self.handles.get(&handle.raw()).copied()
    }

    fn raise(&mut self, text: &str) -> i32 {
        let id = self.alloc_object(MockObject::Throwable {
            text: text.to_string(),
        });
        let handle = self.alloc_handle(id);
        self.pending = Some(handle.raw());
        -1
    }
}

/// In-memory host runtime for tests and examples
pub struct MockHost {
    state: Mutex<State>,
    attach_count: AtomicUsize,
    id: OnceCell<RuntimeId>,
}

impl MockHost {
    /// Create an unregistered mock host
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            attach_count: AtomicUsize::new(0),
            id: OnceCell::new(),
        })
    }

    /// Register with the environment resolver and remember the id
    pub fn register(self: &Arc<Self>) -> RuntimeId {
        let id = env::register_runtime(self.clone());
        let _ = self.id.set(id);
        id
    }

    /// The registry id (after [`register`](Self::register))
    pub fn runtime_id(&self) -> RuntimeId {
        *self.id.get().expect("mock host not registered")
    }

    // ========================================================================
    // Fixture building
    // ========================================================================

    /// Define an empty, constructible class under a fully-qualified name
    pub fn define_class(&self, name: &str) {
        let mut state = self.state.lock();
        let id = state.alloc_object(MockObject::Class {
            name: name.to_string(),
            statics: FxHashMap::default(),
            template: Vec::new(),
            constructible: true,
        });
        state.classes.insert(name.to_string(), id);
    }

    /// Set a static member on a defined class
    pub fn set_static(&self, class: &str, member: &str, value: MockValue) {
        let mut state = self.state.lock();
        let Some(&id) = state.classes.get(class) else {
            return;
        };
        if let Some(MockObject::Class { statics, .. }) = state.objects.get_mut(&id) {
            statics.insert(member.to_string(), value);
        }
    }

    /// Add an instance field to a class's construction template
    pub fn set_template_field(&self, class: &str, field: &str, value: MockValue) {
        let mut state = self.state.lock();
        let Some(&id) = state.classes.get(class) else {
            return;
        };
        if let Some(MockObject::Class { template, .. }) = state.objects.get_mut(&id) {
            template.push((field.to_string(), value));
        }
    }

    /// Create an object of a defined class and return a local handle
    pub fn new_object(&self, class: &str) -> HostHandle {
        let mut state = self.state.lock();
        let template = match state.classes.get(class).copied() {
            Some(id) => match state.objects.get(&id) {
                Some(MockObject::Class { template, .. }) => template.clone(),
                _ => Vec::new(),
            },
            None => Vec::new(),
        };
        let id = state.alloc_object(MockObject::Object {
            class: class.to_string(),
            fields: template.into_iter().collect(),
        });
        state.alloc_handle(id)
    }

    /// Set a field on an existing object
    pub fn set_field(&self, object: HostHandle, field: &str, value: MockValue) {
        let mut state = self.state.lock();
        let Some(id) = state.object_of(object) else {
            return;
        };
        if let Some(MockObject::Object { fields, .. }) = state.objects.get_mut(&id) {
            fields.insert(field.to_string(), value);
        }
    }

    /// Create an array and return a local handle
    pub fn new_array(&self, elements: Vec<f64>) -> HostHandle {
        let mut state = self.state.lock();
        let id = state.alloc_object(MockObject::Array { elements });
        state.alloc_handle(id)
    }

    /// Create a callable and return a local handle
    pub fn new_callable(&self, behavior: MockBehavior) -> HostHandle {
        let mut state = self.state.lock();
        let id = state.alloc_object(MockObject::Callable { behavior });
        state.alloc_handle(id)
    }

    /// A local handle to a defined class
    pub fn class_handle(&self, name: &str) -> Option<HostHandle> {
        let mut state = self.state.lock();
        let id = state.classes.get(name).copied()?;
        Some(state.alloc_handle(id))
    }

    /// Drop the object behind a handle, making every reference to it dangle
    pub fn invalidate_object(&self, handle: HostHandle) {
        let mut state = self.state.lock();
        if let Some(id) = state.object_of(handle) {
            state.objects.remove(&id);
        }
    }

    /// Set the pending exception directly, independent of any dispatch
    pub fn inject_exception(&self, text: &str) {
        let mut state = self.state.lock();
        state.raise(text);
    }

    /// Register a loadable module resolving to a number
    pub fn define_module(&self, name: &str, value: f64) {
        self.state.lock().modules.insert(name.to_string(), value);
    }

    /// Cap the durable reference table (None = unlimited)
    pub fn set_ref_capacity(&self, capacity: Option<usize>) {
        self.state.lock().ref_capacity = capacity;
    }

    // ========================================================================
    // Test observability
    // ========================================================================

    /// Durable references currently outstanding
    pub fn live_durable_refs(&self) -> usize {
        self.state.lock().durable.len()
    }

    /// Every class name offered to `bind_class`, in call order
    pub fn bind_attempts(&self) -> Vec<String> {
        self.state.lock().bind_attempts.clone()
    }

    /// How many times a thread attached
    pub fn attach_count(&self) -> usize {
        self.attach_count.load(Ordering::SeqCst)
    }

    /// The mock object id behind a handle
    pub fn object_id_of(&self, handle: HostHandle) -> Option<u64> {
        self.state.lock().object_of(handle)
    }

    // ========================================================================
    // Marshaling
    // ========================================================================

    fn push_mock_value(&self, vm: &mut Vm, value: MockValue) -> i32 {
        match value {
            MockValue::Number(n) => {
                if vm.push_number(n).is_err() {
                    return self.state.lock().raise("script stack exhausted");
                }
                1
            }
            MockValue::Str(s) => {
                if vm.push_str(s).is_err() {
                    return self.state.lock().raise("script stack exhausted");
                }
                1
            }
            MockValue::Object(object_id) => {
                let (local, kind) = {
                    let mut state = self.state.lock();
                    let kind = match state.objects.get(&object_id) {
                        Some(MockObject::Class { .. }) => HandleKind::Class,
                        Some(MockObject::Array { .. }) => HandleKind::Array,
                        _ => HandleKind::Object,
                    };
                    (state.alloc_handle(object_id), kind)
                };
                self.wrap_into(vm, local, kind)
            }
            MockValue::Method(behavior) => {
                let local = self.new_callable(behavior);
                let Ok(ctx) = env::resolve(self.runtime_id()) else {
                    return self.state.lock().raise("host context unavailable");
                };
                match dispatch::push_host_function(vm, &ctx, local) {
                    Ok(()) => 1,
                    Err(_) => self.state.lock().raise("could not wrap host callable"),
                }
            }
            MockValue::Throws(text) => self.state.lock().raise(&text),
        }
    }

    fn wrap_into(&self, vm: &mut Vm, local: HostHandle, kind: HandleKind) -> i32 {
        let Ok(ctx) = env::resolve(self.runtime_id()) else {
            return self.state.lock().raise("host context unavailable");
        };
        match handle::wrap(vm, &ctx, local, kind) {
            Ok(()) => 1,
            Err(_) => self.state.lock().raise("could not acquire host reference"),
        }
    }

    fn value_from_vm(&self, vm: &Vm, arg: usize) -> Option<MockValue> {
        match vm.arg(arg)? {
            Value::Number(n) => Some(MockValue::Number(*n)),
            Value::Str(s) => Some(MockValue::Str(s.to_string())),
            value @ Value::UserData(_) => {
                let kind = handle::kind_of_value(vm, value)?;
                let slot = vm.arg_index(arg)? as isize;
                let host = handle::try_unwrap(vm, slot, kind)?;
                let id = self.state.lock().object_of(host)?;
                Some(MockValue::Object(id))
            }
            _ => None,
        }
    }
}

impl HostRuntime for MockHost {
    fn attach_current_thread(&self) -> HostResult<()> {
        self.attach_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn new_ref(&self, handle: HostHandle) -> Option<HostHandle> {
        let mut state = self.state.lock();
        let object_id = state.object_of(handle)?;
        if let Some(cap) = state.ref_capacity {
            if state.durable.len() >= cap {
                return None;
            }
        }
        let durable = state.alloc_handle(object_id);
        state.durable.insert(durable.raw());
        Some(durable)
    }

    fn delete_ref(&self, handle: HostHandle) {
        let mut state = self.state.lock();
        if state.durable.remove(&handle.raw()) {
            state.handles.remove(&handle.raw());
        }
    }

    fn same_object(&self, a: HostHandle, b: HostHandle) -> bool {
        let state = self.state.lock();
        match (state.object_of(a), state.object_of(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    fn describe(&self, handle: HostHandle) -> Option<String> {
        let mut state = self.state.lock();
        let rendered = state.object_of(handle).and_then(|id| {
            state.objects.get(&id).map(|object| match object {
                MockObject::Object { class, .. } => format!("{}@{:x}", class, id),
                MockObject::Class { name, .. } => format!("class {}", name),
                MockObject::Array { elements } => format!("array[{}]", elements.len()),
                MockObject::Throwable { text } => text.clone(),
                MockObject::Callable { .. } => format!("callable#{}", id),
            })
        });
        if rendered.is_none() {
            state.raise("invalid handle");
        }
        rendered
    }

    fn class_name(&self, class: HostHandle) -> Option<String> {
        let mut state = self.state.lock();
        let name = match state.object_of(class).and_then(|id| state.objects.get(&id)) {
            Some(MockObject::Class { name, .. }) => Some(name.clone()),
            _ => None,
        };
        if name.is_none() {
            state.raise("not a class handle");
        }
        name
    }

    fn array_length(&self, array: HostHandle) -> Option<usize> {
        let mut state = self.state.lock();
        let len = match state.object_of(array).and_then(|id| state.objects.get(&id)) {
            Some(MockObject::Array { elements }) => Some(elements.len()),
            _ => None,
        };
        if len.is_none() {
            state.raise("not an array handle");
        }
        len
    }

    fn pending_exception(&self) -> Option<HostHandle> {
        self.state.lock().pending.map(HostHandle::from_raw)
    }

    fn clear_exception(&self) {
        self.state.lock().pending = None;
    }

    fn dispatch(&self, vm: &mut Vm, op: DispatchOp<'_>) -> i32 {
        match op {
            DispatchOp::ClassIndex { class, name } => {
                let member = {
                    let state = self.state.lock();
                    match state.object_of(class).and_then(|id| state.objects.get(&id)) {
                        Some(MockObject::Class {
                            name: class_name,
                            statics,
                            ..
                        }) => match statics.get(name) {
                            Some(value) => Ok(value.clone()),
                            None => Err(format!("no such member: {}.{}", class_name, name)),
                        },
                        _ => Err("not a class handle".to_string()),
                    }
                };
                match member {
                    Ok(value) => self.push_mock_value(vm, value),
                    Err(text) => self.state.lock().raise(&text),
                }
            }
            DispatchOp::ClassNewIndex { class, name } => {
                let Some(value) = self.value_from_vm(vm, 2) else {
                    return self
                        .state
                        .lock()
                        .raise(&format!("unsupported value for field '{}'", name));
                };
                let mut state = self.state.lock();
                let Some(id) = state.object_of(class) else {
                    return state.raise("not a class handle");
                };
                let updated = match state.objects.get_mut(&id) {
                    Some(MockObject::Class { statics, .. }) => {
                        statics.insert(name.to_string(), value);
                        true
                    }
                    _ => false,
                };
                if updated {
                    0
                } else {
                    state.raise("not a class handle")
                }
            }
            DispatchOp::Construct { class } => {
                let built = {
                    let mut state = self.state.lock();
                    let blueprint = match state.object_of(class).and_then(|id| state.objects.get(&id)) {
                        Some(MockObject::Class {
                            name,
                            template,
                            constructible,
                            ..
                        }) => {
                            if *constructible {
                                Ok((name.clone(), template.clone()))
                            } else {
                                Err("class is not constructible".to_string())
                            }
                        }
                        _ => Err("not a class handle".to_string()),
                    };
                    blueprint.map(|(class_name, template)| {
                        let id = state.alloc_object(MockObject::Object {
                            class: class_name,
                            fields: template.into_iter().collect(),
                        });
                        state.alloc_handle(id)
                    })
                };
                match built {
                    Ok(local) => self.wrap_into(vm, local, HandleKind::Object),
                    Err(text) => self.state.lock().raise(&text),
                }
            }
            DispatchOp::ObjectIndex { object, name } => {
                let member = {
                    let state = self.state.lock();
                    match state.object_of(object).and_then(|id| state.objects.get(&id)) {
                        Some(MockObject::Object { class, fields }) => match fields.get(name) {
                            Some(value) => Ok(value.clone()),
                            None => Err(format!("no such member: {}.{}", class, name)),
                        },
                        _ => Err("not an object handle".to_string()),
                    }
                };
                match member {
                    Ok(value) => self.push_mock_value(vm, value),
                    Err(text) => self.state.lock().raise(&text),
                }
            }
            DispatchOp::ObjectNewIndex { object, name } => {
                let Some(value) = self.value_from_vm(vm, 2) else {
                    return self
                        .state
                        .lock()
                        .raise(&format!("unsupported value for field '{}'", name));
                };
                let mut state = self.state.lock();
                let Some(id) = state.object_of(object) else {
                    return state.raise("not an object handle");
                };
                let updated = match state.objects.get_mut(&id) {
                    Some(MockObject::Object { fields, .. }) => {
                        fields.insert(name.to_string(), value);
                        true
                    }
                    _ => false,
                };
                if updated {
                    0
                } else {
                    state.raise("not an object handle")
                }
            }
            DispatchOp::ObjectLength { object } => {
                let count = {
                    let state = self.state.lock();
                    match state.object_of(object).and_then(|id| state.objects.get(&id)) {
                        Some(MockObject::Object { fields, .. }) => Some(fields.len()),
                        _ => None,
                    }
                };
                match count {
                    Some(n) => {
                        if vm.push_number(n as f64).is_err() {
                            return self.state.lock().raise("script stack exhausted");
                        }
                        1
                    }
                    None => self.state.lock().raise("not an object handle"),
                }
            }
            DispatchOp::ArrayIndex { array } => {
                let index = match vm.arg(1) {
                    Some(Value::Number(n)) => *n as i64,
                    _ => return self.state.lock().raise("array index must be a number"),
                };
                let element = {
                    let state = self.state.lock();
                    match state.object_of(array).and_then(|id| state.objects.get(&id)) {
                        Some(MockObject::Array { elements }) => {
                            if index >= 1 && (index as usize) <= elements.len() {
                                Ok(elements[index as usize - 1])
                            } else {
                                Err(format!("array index out of bounds: {}", index))
                            }
                        }
                        _ => Err("not an array handle".to_string()),
                    }
                };
                match element {
                    Ok(n) => {
                        if vm.push_number(n).is_err() {
                            return self.state.lock().raise("script stack exhausted");
                        }
                        1
                    }
                    Err(text) => self.state.lock().raise(&text),
                }
            }
            DispatchOp::ArrayNewIndex { array } => {
                let index = match vm.arg(1) {
                    Some(Value::Number(n)) => *n as i64,
                    _ => return self.state.lock().raise("array index must be a number"),
                };
                let value = match vm.arg(2) {
                    Some(Value::Number(n)) => *n,
                    _ => return self.state.lock().raise("array element must be a number"),
                };
                let mut state = self.state.lock();
                let Some(id) = state.object_of(array) else {
                    return state.raise("not an array handle");
                };
                let outcome = match state.objects.get_mut(&id) {
                    Some(MockObject::Array { elements }) => {
                        if index >= 1 && (index as usize) <= elements.len() {
                            elements[index as usize - 1] = value;
                            Ok(())
                        } else {
                            Err(format!("array index out of bounds: {}", index))
                        }
                    }
                    _ => Err("not an array handle".to_string()),
                };
                match outcome {
                    Ok(()) => 0,
                    Err(text) => state.raise(&text),
                }
            }
            DispatchOp::CallFunction { function } => {
                let behavior = {
                    let state = self.state.lock();
                    match state.object_of(function).and_then(|id| state.objects.get(&id)) {
                        Some(MockObject::Callable { behavior }) => Ok(behavior.clone()),
                        _ => Err("not a callable handle".to_string()),
                    }
                };
                match behavior {
                    Ok(MockBehavior::Echo) => {
                        let first = vm.arg(0).cloned().unwrap_or(Value::Nil);
                        if vm.push(first).is_err() {
                            return self.state.lock().raise("script stack exhausted");
                        }
                        1
                    }
                    Ok(MockBehavior::Sum) => {
                        let mut total = 0.0;
                        for i in 0..vm.arg_count() {
                            if let Some(Value::Number(n)) = vm.arg(i) {
                                total += n;
                            }
                        }
                        if vm.push_number(total).is_err() {
                            return self.state.lock().raise("script stack exhausted");
                        }
                        1
                    }
                    Ok(MockBehavior::Fail(text)) => self.state.lock().raise(&text),
                    Err(text) => self.state.lock().raise(&text),
                }
            }
        }
    }

    fn bind_class(&self, vm: &mut Vm, name: &str) -> i32 {
        let found = {
            let mut state = self.state.lock();
            state.bind_attempts.push(name.to_string());
            match state.classes.get(name).copied() {
                Some(id) => Some(state.alloc_handle(id)),
                None => None,
            }
        };
        match found {
            Some(local) => self.wrap_into(vm, local, HandleKind::Class),
            None => self.state.lock().raise(&format!("class not found: {}", name)),
        }
    }

    fn load_module(&self, vm: &mut Vm, name: &str) -> i32 {
        let value = self.state.lock().modules.get(name).copied();
        match value {
            Some(n) => {
                if vm.push_number(n).is_err() {
                    return self.state.lock().raise("script stack exhausted");
                }
                1
            }
            None => 0,
        }
    }
}
