//! Insertion-ordered tables
//!
//! Tables are the VM's only aggregate. Keys may be any non-nil, non-NaN
//! value; string and number keys compare by content, reference keys by
//! identity. Iteration observes insertion order, which keeps every
//! structural traversal over a table (copying, dumping) deterministic.

use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::error::{VmError, VmResult};
use crate::value::{next_heap_id, TableRef, Value};

/// Hashable projection of a table key
#[derive(PartialEq, Eq, Hash)]
enum TableKey {
    Boolean(bool),
    /// Normalized f64 bits (-0.0 folded into 0.0)
    Number(u64),
    Str(Rc<str>),
    /// Pointer identity of a table, function or userdata
    Ref(usize),
}

fn table_key(key: &Value) -> VmResult<TableKey> {
    match key {
        Value::Nil => Err(VmError::msg("table index is nil")),
        Value::Boolean(b) => Ok(TableKey::Boolean(*b)),
        Value::Number(n) => {
            if n.is_nan() {
                return Err(VmError::msg("table index is NaN"));
            }
            let bits = if *n == 0.0 { 0 } else { n.to_bits() };
            Ok(TableKey::Number(bits))
        }
        Value::Str(s) => Ok(TableKey::Str(s.clone())),
        Value::Table(t) => Ok(TableKey::Ref(Rc::as_ptr(t) as usize)),
        Value::Function(f) => Ok(TableKey::Ref(Rc::as_ptr(f) as *const u8 as usize)),
        Value::UserData(u) => Ok(TableKey::Ref(Rc::as_ptr(u) as *const u8 as usize)),
    }
}

/// A mutable, insertion-ordered mapping with an optional metatable
pub struct Table {
    entries: Vec<(Value, Value)>,
    index: FxHashMap<TableKey, usize>,
    metatable: Option<TableRef>,
    id: u64,
}

impl Table {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: FxHashMap::default(),
            metatable: None,
            id: next_heap_id(),
        }
    }

    /// Diagnostic id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of live entries
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Primitive read: the value stored under `key`, or nil.
    /// Never consults the metatable.
    pub fn raw_get(&self, key: &Value) -> Value {
        match table_key(key) {
            Ok(k) => match self.index.get(&k) {
                Some(&pos) => self.entries[pos].1.clone(),
                None => Value::Nil,
            },
            Err(_) => Value::Nil,
        }
    }

    /// Primitive read with a string key
    pub fn raw_get_str(&self, key: &str) -> Value {
        self.raw_get(&Value::str(key))
    }

    /// Primitive write. Assigning nil removes the key. Never consults the
    /// metatable. Fails on nil or NaN keys.
    pub fn raw_set(&mut self, key: Value, value: Value) -> VmResult<()> {
        let k = table_key(&key)?;
        self.set_with_key(k, key, value);
        Ok(())
    }

    /// Primitive write with a string key (string keys are always valid)
    pub fn raw_set_str(&mut self, key: &str, value: Value) {
        let key = Value::str(key);
        let k = match table_key(&key) {
            Ok(k) => k,
            Err(_) => unreachable!("string keys are always valid"),
        };
        self.set_with_key(k, key, value);
    }

    fn set_with_key(&mut self, k: TableKey, key: Value, value: Value) {
        if value.is_nil() {
            if let Some(pos) = self.index.remove(&k) {
                self.entries.remove(pos);
                for slot in self.index.values_mut() {
                    if *slot > pos {
                        *slot -= 1;
                    }
                }
            }
            return;
        }
        match self.index.get(&k) {
            Some(&pos) => self.entries[pos].1 = value,
            None => {
                self.index.insert(k, self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    /// Sequence length: the count of consecutive integer keys from 1
    pub fn seq_len(&self) -> usize {
        let mut n = 0usize;
        loop {
            let probe = Value::Number((n + 1) as f64);
            if self.raw_get(&probe).is_nil() {
                return n;
            }
            n += 1;
        }
    }

    /// Append to the sequence part (`t[#t + 1] = value`)
    pub fn seq_push(&mut self, value: Value) -> VmResult<()> {
        let slot = self.seq_len() + 1;
        self.raw_set(Value::Number(slot as f64), value)
    }

    /// Read from the sequence part (1-based)
    pub fn seq_get(&self, i: usize) -> Value {
        self.raw_get(&Value::Number(i as f64))
    }

    /// Snapshot of all entries in insertion order
    pub fn pairs(&self) -> Vec<(Value, Value)> {
        self.entries.clone()
    }

    /// The metatable, if any
    pub fn metatable(&self) -> Option<TableRef> {
        self.metatable.clone()
    }

    /// Replace the metatable
    pub fn set_metatable(&mut self, metatable: Option<TableRef>) {
        self.metatable = metatable;
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_raw_get_set() {
        let mut t = Table::new();
        t.raw_set_str("a", Value::Number(1.0));
        t.raw_set_str("b", Value::Number(2.0));
        assert!(t.raw_get_str("a").raw_equals(&Value::Number(1.0)));
        assert!(t.raw_get_str("missing").is_nil());
        t.raw_set_str("a", Value::Number(3.0));
        assert!(t.raw_get_str("a").raw_equals(&Value::Number(3.0)));
        assert_eq!(t.entry_count(), 2);
    }

    #[test]
    fn test_nil_assignment_removes() {
        let mut t = Table::new();
        t.raw_set_str("x", Value::Number(1.0));
        t.raw_set_str("y", Value::Number(2.0));
        t.raw_set_str("x", Value::Nil);
        assert!(t.raw_get_str("x").is_nil());
        assert!(t.raw_get_str("y").raw_equals(&Value::Number(2.0)));
        assert_eq!(t.entry_count(), 1);
    }

    #[test]
    fn test_invalid_keys() {
        let mut t = Table::new();
        assert!(t.raw_set(Value::Nil, Value::Number(1.0)).is_err());
        assert!(t
            .raw_set(Value::Number(f64::NAN), Value::Number(1.0))
            .is_err());
    }

    #[test]
    fn test_reference_keys_use_identity() {
        let mut t = Table::new();
        let k1 = Value::Table(Rc::new(RefCell::new(Table::new())));
        let k2 = Value::Table(Rc::new(RefCell::new(Table::new())));
        t.raw_set(k1.clone(), Value::Number(1.0)).unwrap();
        t.raw_set(k2.clone(), Value::Number(2.0)).unwrap();
        assert!(t.raw_get(&k1).raw_equals(&Value::Number(1.0)));
        assert!(t.raw_get(&k2).raw_equals(&Value::Number(2.0)));
    }

    #[test]
    fn test_seq_operations() {
        let mut t = Table::new();
        assert_eq!(t.seq_len(), 0);
        t.seq_push(Value::str("first")).unwrap();
        t.seq_push(Value::str("second")).unwrap();
        assert_eq!(t.seq_len(), 2);
        assert!(t.seq_get(1).raw_equals(&Value::str("first")));
        assert!(t.seq_get(3).is_nil());
    }

    #[test]
    fn test_pairs_insertion_order() {
        let mut t = Table::new();
        t.raw_set_str("z", Value::Number(1.0));
        t.raw_set_str("a", Value::Number(2.0));
        t.raw_set_str("m", Value::Number(3.0));
        let keys: Vec<String> = t
            .pairs()
            .iter()
            .map(|(k, _)| match k {
                Value::Str(s) => s.to_string(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_number_key_normalization() {
        let mut t = Table::new();
        t.raw_set(Value::Number(0.0), Value::str("zero")).unwrap();
        assert!(t.raw_get(&Value::Number(-0.0)).raw_equals(&Value::str("zero")));
    }
}
