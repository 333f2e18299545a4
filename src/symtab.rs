//! Class-partitioned symbol table.
//!
//! Two key modes live under one API: class 0 keys are bare 64-bit integers,
//! classes >= 1 are strings. Classes partition the namespace, so the same
//! string can be stored under different classes without collision; the
//! route table uses this to keep endpoint names and managed-element ids in
//! one table. Values are stored by clone (in practice `Arc` handles), so
//! lookups hand back an owned handle rather than a borrow.

use std::collections::HashMap;

/// Symbol table with numeric (class 0) and string (class >= 1) key spaces.
#[derive(Default)]
pub struct SymTab<V> {
    numeric: HashMap<u64, V>,
    named: HashMap<(u32, String), V>,
}

impl<V: Clone> SymTab<V> {
    pub fn new() -> Self {
        Self { numeric: HashMap::new(), named: HashMap::new() }
    }

    /// Insert or replace under a string key. A class of 0 is coerced to 1;
    /// class 0 is reserved for numeric keys. Returns true when the key was
    /// not previously present.
    pub fn put(&mut self, name: &str, class: u32, value: V) -> bool {
        let class = if class == 0 { 1 } else { class };
        self.named.insert((class, name.to_string()), value).is_none()
    }

    /// Fetch a value stored under a string key.
    pub fn get(&self, name: &str, class: u32) -> Option<V> {
        self.named.get(&(class, name.to_string())).cloned()
    }

    /// Remove a string-keyed value; silently does nothing if absent.
    pub fn del(&mut self, name: &str, class: u32) {
        self.named.remove(&(class, name.to_string()));
    }

    /// Insert or replace under a numeric key. Returns true when new.
    pub fn map(&mut self, key: u64, value: V) -> bool {
        self.numeric.insert(key, value).is_none()
    }

    /// Fetch a value stored under a numeric key.
    pub fn pull(&self, key: u64) -> Option<V> {
        self.numeric.get(&key).cloned()
    }

    /// Remove a numeric-keyed value.
    pub fn ndel(&mut self, key: u64) {
        self.numeric.remove(&key);
    }

    /// Drive `f` for every entry of one string class.
    pub fn foreach_class<F: FnMut(&str, &V)>(&self, class: u32, mut f: F) {
        for ((c, name), value) in &self.named {
            if *c == class {
                f(name, value);
            }
        }
    }

    /// Drive `f` for every numeric-keyed entry.
    pub fn foreach_numeric<F: FnMut(u64, &V)>(&self, mut f: F) {
        for (key, value) in &self.numeric {
            f(*key, value);
        }
    }

    /// Total number of entries across both key spaces.
    pub fn len(&self) -> usize {
        self.numeric.len() + self.named.len()
    }

    pub fn is_empty(&self) -> bool {
        self.numeric.is_empty() && self.named.is_empty()
    }
}

impl<V: Clone> Clone for SymTab<V> {
    fn clone(&self) -> Self {
        Self { numeric: self.numeric.clone(), named: self.named.clone() }
    }
}
