//! Open-addressing hash table keyed by interned string.
//!
//! Used both as the VM's globals table and as the heap's string-intern set.
//! Collisions resolve by linear probing; deletions leave a tombstone so
//! probe chains started before the deletion still terminate correctly.

use std::rc::Rc;

use crate::object::ObjString;
use crate::value::Value;

const INITIAL_CAPACITY: usize = 8;
const LOAD_FACTOR_MAX: f64 = 0.75;

#[derive(Clone)]
struct Entry {
    key: Option<Rc<ObjString>>,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Entry {
            key: None,
            value: Value::Nil,
        }
    }

    /// A tombstone is a dead entry: no key, but a `true` sentinel in place
    /// of `Nil` so probing can tell it apart from a slot that was never used.
    fn is_tombstone(&self) -> bool {
        self.key.is_none() && matches!(self.value, Value::Bool(true))
    }
}

pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Table {
            count: 0,
            entries: Vec::new(),
        }
    }

    /// Live entries plus tombstones -- the quantity the load factor is
    /// measured against.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn find_entry_index(entries: &[Entry], capacity: usize, key: &Rc<ObjString>) -> usize {
        let mut index = key.hash() as usize % capacity;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match &entry.key {
                Some(k) if Rc::ptr_eq(k, key) => return index,
                Some(_) => {}
                None if entry.is_tombstone() => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                None => return tombstone.unwrap_or(index),
            }
            index = (index + 1) % capacity;
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let mut grown = vec![Entry::empty(); capacity];
        let mut live = 0;
        for entry in self.entries.drain(..) {
            if let Some(key) = entry.key {
                let index = Self::find_entry_index(&grown, capacity, &key);
                grown[index] = Entry {
                    key: Some(key),
                    value: entry.value,
                };
                live += 1;
            }
        }
        self.entries = grown;
        self.count = live;
    }

    /// Inserts or overwrites `key`. Returns `true` if `key` was not already present.
    pub fn set(&mut self, key: Rc<ObjString>, value: Value) -> bool {
        if (self.count + 1) as f64 > self.capacity() as f64 * LOAD_FACTOR_MAX {
            let new_capacity = if self.capacity() == 0 {
                INITIAL_CAPACITY
            } else {
                self.capacity() * 2
            };
            self.adjust_capacity(new_capacity);
        }
        let index = Self::find_entry_index(&self.entries, self.capacity(), &key);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_none();
        if is_new_key && !entry.is_tombstone() {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        is_new_key
    }

    pub fn get(&self, key: &Rc<ObjString>) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Self::find_entry_index(&self.entries, self.capacity(), key);
        let entry = &self.entries[index];
        entry.key.as_ref().map(|_| entry.value.clone())
    }

    /// Replaces a live entry with a tombstone. Does not decrement `count` --
    /// the tombstone still occupies a slot in the probe chain.
    pub fn delete(&mut self, key: &Rc<ObjString>) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_entry_index(&self.entries, self.capacity(), key);
        if self.entries[index].key.is_none() {
            return false;
        }
        self.entries[index] = Entry {
            key: None,
            value: Value::Bool(true),
        };
        true
    }

    pub fn add_all(&mut self, from: &Table) {
        for entry in &from.entries {
            if let Some(key) = &entry.key {
                self.set(key.clone(), entry.value.clone());
            }
        }
    }

    /// Finds an already-interned string by content without requiring the
    /// caller to have allocated an `ObjString` first.
    pub fn find_string(&self, s: &str, hash: u32) -> Option<Rc<ObjString>> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.capacity();
        let mut index = hash as usize % capacity;
        loop {
            let entry = &self.entries[index];
            match &entry.key {
                Some(k) if k.hash() == hash && k.as_str() == s => return Some(k.clone()),
                Some(_) => {}
                None if entry.is_tombstone() => {}
                None => return None,
            }
            index = (index + 1) % capacity;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::fnv1a_hash;

    fn key(s: &str) -> Rc<ObjString> {
        Rc::new(ObjString {
            bytes: s.to_string(),
            hash: fnv1a_hash(s.as_bytes()),
        })
    }

    #[test]
    fn set_then_get_roundtrips() {
        let mut table = Table::new();
        let k = key("answer");
        assert!(table.set(k.clone(), Value::Number(42.0)));
        assert_eq!(table.get(&k), Some(Value::Number(42.0)));
    }

    #[test]
    fn set_existing_key_returns_false_and_overwrites() {
        let mut table = Table::new();
        let k = key("x");
        assert!(table.set(k.clone(), Value::Number(1.0)));
        assert!(!table.set(k.clone(), Value::Number(2.0)));
        assert_eq!(table.get(&k), Some(Value::Number(2.0)));
    }

    #[test]
    fn delete_leaves_tombstone_and_preserves_probe_chain() {
        let mut table = Table::new();
        let a = key("a");
        let b = key("b");
        table.set(a.clone(), Value::Number(1.0));
        table.set(b.clone(), Value::Number(2.0));
        assert!(table.delete(&a));
        // `b` must still be reachable even if it probed past `a`'s slot.
        assert_eq!(table.get(&b), Some(Value::Number(2.0)));
        assert_eq!(table.get(&a), None);
    }

    #[test]
    fn get_on_missing_key_is_none() {
        let table = Table::new();
        assert_eq!(table.get(&key("missing")), None);
    }

    #[test]
    fn grows_before_exceeding_load_factor() {
        let mut table = Table::new();
        let keys: Vec<_> = (0..100).map(|i| key(&format!("k{i}"))).collect();
        for (i, k) in keys.iter().enumerate() {
            table.set(k.clone(), Value::Number(i as f64));
        }
        assert!(table.count() as f64 <= table.capacity() as f64 * LOAD_FACTOR_MAX);
        for (i, k) in keys.iter().enumerate() {
            assert_eq!(table.get(k), Some(Value::Number(i as f64)));
        }
    }

    #[test]
    fn find_string_locates_interned_bytes_without_an_existing_handle() {
        let mut table = Table::new();
        let k = key("hello");
        table.set(k.clone(), Value::Nil);
        let hash = fnv1a_hash(b"hello");
        let found = table.find_string("hello", hash).expect("should find");
        assert!(Rc::ptr_eq(&found, &k));
        assert!(table.find_string("goodbye", fnv1a_hash(b"goodbye")).is_none());
    }

    #[test]
    fn add_all_copies_every_live_entry() {
        let mut from = Table::new();
        let a = key("a");
        let b = key("b");
        from.set(a.clone(), Value::Number(1.0));
        from.set(b.clone(), Value::Number(2.0));
        let mut to = Table::new();
        to.add_all(&from);
        assert_eq!(to.get(&a), Some(Value::Number(1.0)));
        assert_eq!(to.get(&b), Some(Value::Number(2.0)));
    }
}
