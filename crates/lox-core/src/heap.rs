//! Owns every heap-allocated object for the life of a VM, and the
//! string-intern table that guarantees at most one live object per distinct
//! byte sequence.
//!
//! Objects are owned by a flat `Vec` rather than an intrusive linked list:
//! registration is a `Vec::push` (still O(1) amortized) and freeing the
//! whole generation is dropping the `Vec`, in one pass, when the `Heap`
//! itself is dropped. Traversal order over the object list is never
//! observed by anything in this system.

use std::rc::Rc;

use crate::object::{ObjString, fnv1a_hash};
use crate::table::Table;
use crate::value::Value;

pub struct Heap {
    strings: Table,
    objects: Vec<Rc<ObjString>>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            strings: Table::new(),
            objects: Vec::new(),
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Intern a string the caller still owns a copy of (e.g. a literal's
    /// lexeme, borrowed from source). Returns the canonical object for these
    /// bytes, allocating one only if nothing has interned them yet.
    pub fn copy_string(&mut self, s: &str) -> Rc<ObjString> {
        let hash = fnv1a_hash(s.as_bytes());
        if let Some(existing) = self.strings.find_string(s, hash) {
            return existing;
        }
        self.allocate(s.to_string(), hash)
    }

    /// Intern a string the caller no longer needs (e.g. the freshly built
    /// result of concatenation). If these bytes are already interned, the
    /// new buffer is simply dropped in favor of the existing object.
    pub fn take_string(&mut self, s: String) -> Rc<ObjString> {
        let hash = fnv1a_hash(s.as_bytes());
        if let Some(existing) = self.strings.find_string(&s, hash) {
            return existing;
        }
        self.allocate(s, hash)
    }

    fn allocate(&mut self, bytes: String, hash: u32) -> Rc<ObjString> {
        let obj = Rc::new(ObjString { bytes, hash });
        self.objects.push(obj.clone());
        self.strings.set(obj.clone(), Value::Nil);
        obj
    }
}
