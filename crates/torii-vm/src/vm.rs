//! The VM surface: stack, globals, metamethod dispatch
//!
//! This is the embedding contract of the script VM — the operations an
//! embedder (and the interop bridge) programs against. There is no
//! interpreter behind it: compiled chunks are opaque payloads, and every
//! operation here is driven by the host side.
//!
//! Stack discipline follows the embeddable-language convention: operations
//! consume their operands from the top of the stack and push their results,
//! reporting how many values they produced. Errors unwind as `VmError`
//! results and always leave the stack at a well-defined depth.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashMap;

use crate::chunk::{Chunk, ChunkSink, DUMP_SLICE};
use crate::error::{VmError, VmResult};
use crate::table::Table;
use crate::value::{fmt_number, Finalizer, Function, NativeFn, TableRef, UserData, Value};

/// Metamethod chain length guard (`__index` tables pointing at tables)
const MAX_META_CHAIN: usize = 100;

/// Nested native-call depth guard
const MAX_CALL_DEPTH: usize = 200;

static NEXT_VM_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one VM instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmId(u64);

impl VmId {
    fn next() -> Self {
        VmId(NEXT_VM_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw id value
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// VM construction options
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Hard ceiling on stack slots; pushes beyond it are rejected
    pub max_stack: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self { max_stack: 65_536 }
    }
}

struct Frame {
    base: usize,
    nargs: usize,
    upvalues: Vec<Value>,
}

/// One script VM instance.
///
/// Single-threaded by contract: a `Vm` is neither `Send` nor `Sync`, and the
/// embedder owns any cross-thread serialization.
pub struct Vm {
    stack: Vec<Value>,
    globals: TableRef,
    named_meta: FxHashMap<String, TableRef>,
    frames: Vec<Frame>,
    extensions: FxHashMap<TypeId, Box<dyn Any>>,
    options: VmOptions,
    id: VmId,
}

impl Vm {
    /// Create a VM with default options
    pub fn new() -> Self {
        Self::with_options(VmOptions::default())
    }

    /// Create a VM with explicit options
    pub fn with_options(options: VmOptions) -> Self {
        Self {
            stack: Vec::new(),
            globals: Rc::new(RefCell::new(Table::new())),
            named_meta: FxHashMap::default(),
            frames: Vec::new(),
            extensions: FxHashMap::default(),
            options,
            id: VmId::next(),
        }
    }

    /// This instance's id
    pub fn id(&self) -> VmId {
        self.id
    }

    // ========================================================================
    // Stack
    // ========================================================================

    /// Current stack height
    pub fn top(&self) -> usize {
        self.stack.len()
    }

    /// Push a value, rejecting growth past the configured ceiling
    pub fn push(&mut self, value: Value) -> VmResult<()> {
        if self.stack.len() >= self.options.max_stack {
            return Err(VmError::msg("stack overflow"));
        }
        self.stack.push(value);
        Ok(())
    }

    /// Pop the top value
    pub fn pop(&mut self) -> Option<Value> {
        self.stack.pop()
    }

    /// Drop the top `n` values
    pub fn pop_n(&mut self, n: usize) {
        let keep = self.stack.len().saturating_sub(n);
        self.stack.truncate(keep);
    }

    /// Truncate the stack to `len` slots
    pub fn truncate(&mut self, len: usize) {
        self.stack.truncate(len);
    }

    /// The value `n` slots below the top (0 = top)
    pub fn peek(&self, n: usize) -> Option<&Value> {
        let len = self.stack.len();
        if n < len {
            self.stack.get(len - 1 - n)
        } else {
            None
        }
    }

    /// The value at absolute slot `i` (0-based)
    pub fn at(&self, i: usize) -> Option<&Value> {
        self.stack.get(i)
    }

    /// Resolve a possibly-negative index (-1 = top) to an absolute slot
    pub fn abs_index(&self, i: isize) -> VmResult<usize> {
        let len = self.stack.len() as isize;
        let abs = if i < 0 { len + i } else { i };
        if abs < 0 || abs >= len {
            return Err(VmError::msg(format!("stack index {} out of range", i)));
        }
        Ok(abs as usize)
    }

    /// Owned copy of the value at a possibly-negative index
    fn value_at(&self, i: isize) -> VmResult<Value> {
        let abs = self.abs_index(i)?;
        self.at(abs)
            .cloned()
            .ok_or_else(|| VmError::msg(format!("stack index {} out of range", i)))
    }

    /// Push nil
    pub fn push_nil(&mut self) -> VmResult<()> {
        self.push(Value::Nil)
    }

    /// Push a boolean
    pub fn push_bool(&mut self, b: bool) -> VmResult<()> {
        self.push(Value::Boolean(b))
    }

    /// Push a number
    pub fn push_number(&mut self, n: f64) -> VmResult<()> {
        self.push(Value::Number(n))
    }

    /// Push a string
    pub fn push_str(&mut self, s: impl AsRef<str>) -> VmResult<()> {
        self.push(Value::str(s))
    }

    /// Push a fresh empty table and return its reference
    pub fn push_table(&mut self) -> VmResult<TableRef> {
        let t: TableRef = Rc::new(RefCell::new(Table::new()));
        self.push(Value::Table(t.clone()))?;
        Ok(t)
    }

    // ========================================================================
    // Functions and closures
    // ========================================================================

    /// Push a native function with no upvalues
    pub fn push_native(&mut self, func: NativeFn) -> VmResult<()> {
        self.push(Value::Function(Rc::new(Function::Native {
            func,
            upvalues: Vec::new(),
        })))
    }

    /// Push a native closure capturing the top `n` stack values as upvalues
    /// (popped first-pushed-first)
    pub fn push_closure(&mut self, func: NativeFn, n: usize) -> VmResult<()> {
        if self.stack.len() < n {
            return Err(VmError::msg("not enough values for closure upvalues"));
        }
        let split = self.stack.len() - n;
        let upvalues = self.stack.split_off(split);
        self.push(Value::Function(Rc::new(Function::Native { func, upvalues })))
    }

    /// Upvalue `i` (0-based) of the innermost native call frame
    pub fn upvalue(&self, i: usize) -> Option<Value> {
        self.frames.last().and_then(|f| f.upvalues.get(i).cloned())
    }

    /// Argument count of the innermost native call frame
    pub fn arg_count(&self) -> usize {
        self.frames.last().map(|f| f.nargs).unwrap_or(0)
    }

    /// Argument `i` (0-based) of the innermost native call frame.
    ///
    /// Valid until the native function starts pushing results.
    pub fn arg(&self, i: usize) -> Option<&Value> {
        let frame = self.frames.last()?;
        if i < frame.nargs {
            self.stack.get(frame.base + i)
        } else {
            None
        }
    }

    /// Absolute stack slot of argument `i` of the innermost native frame
    pub fn arg_index(&self, i: usize) -> Option<usize> {
        let frame = self.frames.last()?;
        if i < frame.nargs {
            Some(frame.base + i)
        } else {
            None
        }
    }

    /// Upvalue count of the innermost native call frame
    pub fn upvalue_count(&self) -> usize {
        self.frames.last().map(|f| f.upvalues.len()).unwrap_or(0)
    }

    // ========================================================================
    // Userdata and metatables
    // ========================================================================

    /// Push a userdata block
    pub fn push_userdata(
        &mut self,
        data: Vec<u8>,
        metatable: Option<TableRef>,
        finalizer: Option<Finalizer>,
    ) -> VmResult<()> {
        self.push(Value::UserData(Rc::new(RefCell::new(UserData::new(
            data, metatable, finalizer,
        )))))
    }

    /// The metatable registered under `name`, creating it on first use.
    /// The boolean is true when this call created it.
    pub fn named_metatable(&mut self, name: &str) -> (TableRef, bool) {
        if let Some(existing) = self.named_meta.get(name) {
            return (existing.clone(), false);
        }
        let t: TableRef = Rc::new(RefCell::new(Table::new()));
        self.named_meta.insert(name.to_string(), t.clone());
        (t, true)
    }

    /// The metatable registered under `name`, if any
    pub fn get_named_metatable(&self, name: &str) -> Option<TableRef> {
        self.named_meta.get(name).cloned()
    }

    /// A non-nil metatable field of `value`, if present
    pub fn meta_field(&self, value: &Value, name: &str) -> Option<Value> {
        let meta = value.metatable()?;
        let field = meta.borrow().raw_get_str(name);
        if field.is_nil() {
            None
        } else {
            Some(field)
        }
    }

    // ========================================================================
    // Globals
    // ========================================================================

    /// The globals table
    pub fn globals(&self) -> TableRef {
        self.globals.clone()
    }

    /// Metatable-aware read of a global; pushes the result(s).
    ///
    /// Goes through the same lookup path as script code, so an `__index`
    /// hook on the globals table observes unresolved names.
    pub fn get_global(&mut self, name: &str) -> VmResult<usize> {
        self.push(Value::Table(self.globals.clone()))?;
        self.push_str(name)?;
        self.get_table()
    }

    /// Primitive write of a global; pops the value
    pub fn set_global(&mut self, name: &str) -> VmResult<()> {
        let value = self
            .pop()
            .ok_or_else(|| VmError::msg("set_global with empty stack"))?;
        self.globals.borrow_mut().raw_set_str(name, value);
        Ok(())
    }

    // ========================================================================
    // Chunks
    // ========================================================================

    /// Push a script function from compiled bytes under a chunk name
    pub fn load_chunk(&mut self, bytes: &[u8], name: &str) -> VmResult<()> {
        self.push(Value::Function(Rc::new(Function::Script {
            chunk: Rc::new(Chunk::new(name, bytes.to_vec())),
        })))
    }

    /// Stream the compiled form of the function at the top of the stack.
    ///
    /// Fails when the top is not a script function (native functions have no
    /// compiled form) or when the sink aborts. The value stays on the stack.
    pub fn dump_function(&mut self, sink: &mut dyn ChunkSink) -> VmResult<()> {
        let chunk = match self.peek(0) {
            Some(Value::Function(f)) => match &**f {
                Function::Script { chunk } => chunk.clone(),
                Function::Native { .. } => {
                    return Err(VmError::msg("unable to dump a native function"))
                }
            },
            Some(other) => {
                return Err(VmError::msg(format!(
                    "unable to dump a {} value",
                    other.type_name()
                )))
            }
            None => return Err(VmError::msg("dump with empty stack")),
        };
        for slice in chunk.bytes().chunks(DUMP_SLICE.max(1)) {
            if !sink.write(slice) {
                return Err(VmError::msg("chunk writer aborted the dump"));
            }
        }
        Ok(())
    }

    // ========================================================================
    // Metamethod-aware operations
    // ========================================================================

    /// Index operation: pops `key` and `object`, pushes the result(s).
    ///
    /// A raw hit on a table short-circuits; otherwise the `__index`
    /// metamethod runs and every value it pushes becomes a result.
    pub fn get_table(&mut self) -> VmResult<usize> {
        let key = self
            .pop()
            .ok_or_else(|| VmError::msg("get_table with empty stack"))?;
        let object = self
            .pop()
            .ok_or_else(|| VmError::msg("get_table with empty stack"))?;
        self.index_value(object, key)
    }

    fn index_value(&mut self, object: Value, key: Value) -> VmResult<usize> {
        let mut target = object;
        for _ in 0..MAX_META_CHAIN {
            match &target {
                Value::Table(t) => {
                    let hit = t.borrow().raw_get(&key);
                    if !hit.is_nil() {
                        self.push(hit)?;
                        return Ok(1);
                    }
                    match self.meta_field(&target, "__index") {
                        None => {
                            self.push_nil()?;
                            return Ok(1);
                        }
                        Some(handler @ Value::Function(_)) => {
                            self.push(handler)?;
                            self.push(target)?;
                            self.push(key)?;
                            return self.call(2);
                        }
                        Some(Value::Table(next)) => {
                            target = Value::Table(next);
                        }
                        Some(_) => {
                            return Err(VmError::msg("'__index' must be a function or table"))
                        }
                    }
                }
                Value::UserData(_) => match self.meta_field(&target, "__index") {
                    Some(handler @ Value::Function(_)) => {
                        self.push(handler)?;
                        self.push(target)?;
                        self.push(key)?;
                        return self.call(2);
                    }
                    Some(Value::Table(next)) => {
                        target = Value::Table(next);
                    }
                    _ => return Err(VmError::msg("attempt to index a userdata value")),
                },
                other => {
                    return Err(VmError::msg(format!(
                        "attempt to index a {} value",
                        other.type_name()
                    )))
                }
            }
        }
        Err(VmError::msg("'__index' chain too long; possible loop"))
    }

    /// New-index operation: pops `value`, `key` and `object`.
    pub fn set_table(&mut self) -> VmResult<()> {
        let value = self
            .pop()
            .ok_or_else(|| VmError::msg("set_table with empty stack"))?;
        let key = self
            .pop()
            .ok_or_else(|| VmError::msg("set_table with empty stack"))?;
        let object = self
            .pop()
            .ok_or_else(|| VmError::msg("set_table with empty stack"))?;
        let mut target = object;
        for _ in 0..MAX_META_CHAIN {
            match &target {
                Value::Table(t) => {
                    let existing = !t.borrow().raw_get(&key).is_nil();
                    if existing || self.meta_field(&target, "__newindex").is_none() {
                        return t.borrow_mut().raw_set(key, value);
                    }
                    match self.meta_field(&target, "__newindex") {
                        Some(handler @ Value::Function(_)) => {
                            let base = self.top();
                            self.push(handler)?;
                            self.push(target)?;
                            self.push(key)?;
                            self.push(value)?;
                            self.call(3)?;
                            self.truncate(base);
                            return Ok(());
                        }
                        Some(Value::Table(next)) => {
                            target = Value::Table(next);
                        }
                        _ => return Err(VmError::msg("'__newindex' must be a function or table")),
                    }
                }
                Value::UserData(_) => match self.meta_field(&target, "__newindex") {
                    Some(handler @ Value::Function(_)) => {
                        let base = self.top();
                        self.push(handler)?;
                        self.push(target)?;
                        self.push(key)?;
                        self.push(value)?;
                        self.call(3)?;
                        self.truncate(base);
                        return Ok(());
                    }
                    Some(Value::Table(next)) => {
                        target = Value::Table(next);
                    }
                    _ => return Err(VmError::msg("attempt to index a userdata value")),
                },
                other => {
                    return Err(VmError::msg(format!(
                        "attempt to index a {} value",
                        other.type_name()
                    )))
                }
            }
        }
        Err(VmError::msg("'__newindex' chain too long; possible loop"))
    }

    /// Call the value under the top `nargs` arguments; returns how many
    /// results it produced (left on the stack in place of callee and args).
    pub fn call(&mut self, nargs: usize) -> VmResult<usize> {
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(VmError::msg("call depth limit reached"));
        }
        let callee_slot = self
            .stack
            .len()
            .checked_sub(nargs + 1)
            .ok_or_else(|| VmError::msg("call with too few stack values"))?;
        let callee = self.stack[callee_slot].clone();
        match callee {
            Value::Function(f) => match &*f {
                Function::Native { func, upvalues } => {
                    self.frames.push(Frame {
                        base: callee_slot + 1,
                        nargs,
                        upvalues: upvalues.clone(),
                    });
                    let outcome = func(self);
                    self.frames.pop();
                    match outcome {
                        Ok(count) => {
                            let results_start = self
                                .stack
                                .len()
                                .checked_sub(count)
                                .filter(|&s| s > callee_slot)
                                .ok_or_else(|| {
                                    VmError::msg("native function returned more results than it pushed")
                                })?;
                            let results: Vec<Value> =
                                self.stack.drain(results_start..).collect();
                            self.stack.truncate(callee_slot);
                            for r in results {
                                self.push(r)?;
                            }
                            Ok(count)
                        }
                        Err(e) => {
                            self.stack.truncate(callee_slot);
                            Err(e)
                        }
                    }
                }
                Function::Script { .. } => Err(VmError::msg(
                    "cannot execute a compiled chunk without an interpreter attached",
                )),
            },
            other => match self.meta_field(&other, "__call") {
                Some(handler) => {
                    if self.stack.len() >= self.options.max_stack {
                        return Err(VmError::msg("stack overflow"));
                    }
                    self.stack.insert(callee_slot, handler);
                    self.call(nargs + 1)
                }
                None => Err(VmError::msg(format!(
                    "attempt to call a {} value",
                    other.type_name()
                ))),
            },
        }
    }

    /// Protected call: on failure the stack is restored to its depth below
    /// the callee and the error is returned for inspection.
    pub fn pcall(&mut self, nargs: usize) -> VmResult<usize> {
        let base = self
            .stack
            .len()
            .checked_sub(nargs + 1)
            .ok_or_else(|| VmError::msg("pcall with too few stack values"))?;
        match self.call(nargs) {
            Ok(count) => Ok(count),
            Err(e) => {
                self.stack.truncate(base);
                Err(e)
            }
        }
    }

    /// Equality with `__eq` fallback.
    ///
    /// Metamethods are consulted only when both operands are tables or both
    /// are userdata and primitive identity already failed.
    pub fn values_equal(&mut self, i1: isize, i2: isize) -> VmResult<bool> {
        let a = self.value_at(i1)?;
        let b = self.value_at(i2)?;
        if a.raw_equals(&b) {
            return Ok(true);
        }
        let comparable = matches!(
            (&a, &b),
            (Value::Table(_), Value::Table(_)) | (Value::UserData(_), Value::UserData(_))
        );
        if !comparable {
            return Ok(false);
        }
        let handler = self
            .meta_field(&a, "__eq")
            .or_else(|| self.meta_field(&b, "__eq"));
        match handler {
            None => Ok(false),
            Some(h) => {
                let base = self.top();
                self.push(h)?;
                self.push(a)?;
                self.push(b)?;
                let count = self.call(2)?;
                let verdict = if count == 0 {
                    false
                } else {
                    self.at(self.top() - count).map(Value::is_truthy).unwrap_or(false)
                };
                self.truncate(base);
                Ok(verdict)
            }
        }
    }

    /// String conversion with `__tostring` fallback.
    ///
    /// Returns the rendered string without pushing it.
    pub fn tostring(&mut self, i: isize) -> VmResult<Rc<str>> {
        let value = self.value_at(i)?;
        if let Some(handler) = self.meta_field(&value, "__tostring") {
            let base = self.top();
            self.push(handler)?;
            self.push(value)?;
            let count = self.call(1)?;
            let rendered = if count == 0 {
                None
            } else {
                self.at(self.top() - count).cloned()
            };
            self.truncate(base);
            return match rendered {
                Some(Value::Str(s)) => Ok(s),
                _ => Err(VmError::msg("'__tostring' must return a string")),
            };
        }
        Ok(match value {
            Value::Str(s) => s,
            Value::Nil => Rc::from("nil"),
            Value::Boolean(b) => Rc::from(if b { "true" } else { "false" }),
            Value::Number(n) => Rc::from(fmt_number(n).as_str()),
            Value::Table(t) => {
                let id = t.borrow().id();
                Rc::from(format!("table: 0x{:08x}", id).as_str())
            }
            Value::Function(f) => Rc::from(format!("function: {:p}", Rc::as_ptr(&f)).as_str()),
            Value::UserData(u) => {
                let id = u.borrow().id();
                Rc::from(format!("userdata: 0x{:08x}", id).as_str())
            }
        })
    }

    /// Length operation; pushes the result(s) and returns their count.
    ///
    /// Strings report byte length, tables their sequence length; userdata
    /// delegates to `__len` and keeps the handler's result count.
    pub fn length(&mut self, i: isize) -> VmResult<usize> {
        let value = self.value_at(i)?;
        match &value {
            Value::Str(s) => {
                self.push_number(s.len() as f64)?;
                Ok(1)
            }
            Value::Table(t) => {
                let n = t.borrow().seq_len();
                self.push_number(n as f64)?;
                Ok(1)
            }
            Value::UserData(_) => match self.meta_field(&value, "__len") {
                Some(handler) => {
                    self.push(handler)?;
                    self.push(value)?;
                    self.call(1)
                }
                None => Err(VmError::msg("attempt to get length of a userdata value")),
            },
            other => Err(VmError::msg(format!(
                "attempt to get length of a {} value",
                other.type_name()
            ))),
        }
    }

    /// Concatenation of the top two values with `__concat` fallback.
    ///
    /// Pops both operands and pushes one result.
    pub fn concat2(&mut self) -> VmResult<()> {
        let b = self
            .pop()
            .ok_or_else(|| VmError::msg("concat with empty stack"))?;
        let a = self
            .pop()
            .ok_or_else(|| VmError::msg("concat with empty stack"))?;
        let plain = |v: &Value| matches!(v, Value::Str(_) | Value::Number(_));
        if plain(&a) && plain(&b) {
            let render = |v: &Value| match v {
                Value::Str(s) => s.to_string(),
                Value::Number(n) => fmt_number(*n),
                _ => unreachable!(),
            };
            return self.push_str(format!("{}{}", render(&a), render(&b)));
        }
        let handler = self
            .meta_field(&a, "__concat")
            .or_else(|| self.meta_field(&b, "__concat"));
        match handler {
            Some(h) => {
                let base = self.top();
                self.push(h)?;
                self.push(a)?;
                self.push(b)?;
                let count = self.call(2)?;
                let result = if count == 0 {
                    Value::Nil
                } else {
                    self.at(self.top() - count).cloned().unwrap_or(Value::Nil)
                };
                self.truncate(base);
                self.push(result)
            }
            None => {
                let offender = if plain(&a) { &b } else { &a };
                Err(VmError::msg(format!(
                    "attempt to concatenate a {} value",
                    offender.type_name()
                )))
            }
        }
    }

    // ========================================================================
    // Embedder extensions
    // ========================================================================

    /// Attach embedder state to this VM, replacing any previous value of the
    /// same type
    pub fn set_extension<T: Any>(&mut self, value: T) {
        self.extensions.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Read back embedder state by type
    pub fn extension<T: Any + Clone>(&self) -> Option<T> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|b| b.downcast_ref::<T>())
            .cloned()
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
