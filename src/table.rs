//! A hand-rolled open-addressed, linear-probing hash table keyed by interned
//! string identity. `std::collections::HashMap` is not a substitute here:
//! the interner needs `remove_weak`, a sweep-time pass with no equivalent in
//! any standard collection, so the whole table is written by hand to keep
//! that operation (and `find_string`, the one content-based string compare
//! in the system) next to the structure they operate on.

use crate::gc::GcRef;
use crate::object::Obj;
use crate::value::Value;

const MAX_LOAD_FACTOR: f64 = 0.75;
const MIN_CAPACITY: usize = 8;

#[derive(Clone, Copy)]
enum Slot {
    Empty,
    Tombstone,
    Occupied(GcRef<Obj>, Value),
}

pub struct Table {
    entries: Vec<Slot>,
    count: usize, // occupied + tombstones
}

impl Table {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|s| matches!(s, Slot::Occupied(..)))
            .count()
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn find_slot(entries: &[Slot], capacity: usize, key: GcRef<Obj>) -> usize {
        let mut index = (key.hash as usize) % capacity;
        let mut first_tombstone: Option<usize> = None;
        loop {
            match entries[index] {
                Slot::Empty => return first_tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                Slot::Occupied(k, _) => {
                    if k == key {
                        return index;
                    }
                }
            }
            index = (index + 1) % capacity;
        }
    }

    fn grow(&mut self, new_capacity: usize) {
        let mut new_entries = vec![Slot::Empty; 0];
        new_entries.resize_with(new_capacity, || Slot::Empty);

        let mut live = 0;
        for slot in self.entries.drain(..) {
            if let Slot::Occupied(key, value) = slot {
                let index = Self::find_slot(&new_entries, new_capacity, key);
                new_entries[index] = Slot::Occupied(key, value);
                live += 1;
            }
        }

        self.entries = new_entries;
        self.count = live;
    }

    /// Inserts `key -> value`, returning whether `key` was not already
    /// present. A new key landing on a tombstone does not increment `count`
    /// — the tombstone already counted against the table.
    pub fn insert(&mut self, key: GcRef<Obj>, value: Value) -> bool {
        if self.entries.is_empty()
            || (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD_FACTOR
        {
            let new_capacity = if self.capacity() < MIN_CAPACITY {
                MIN_CAPACITY
            } else {
                self.capacity() * 2
            };
            self.grow(new_capacity);
        }

        let capacity = self.capacity();
        let index = Self::find_slot(&self.entries, capacity, key);
        let is_new = !matches!(self.entries[index], Slot::Occupied(..));
        let was_tombstone = matches!(self.entries[index], Slot::Tombstone);
        self.entries[index] = Slot::Occupied(key, value);
        if is_new && !was_tombstone {
            self.count += 1;
        }
        is_new
    }

    pub fn get(&self, key: GcRef<Obj>) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.capacity();
        match self.entries[Self::find_slot(&self.entries, capacity, key)] {
            Slot::Occupied(_, value) => Some(value),
            _ => None,
        }
    }

    pub fn delete(&mut self, key: GcRef<Obj>) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let capacity = self.capacity();
        let index = Self::find_slot(&self.entries, capacity, key);
        if matches!(self.entries[index], Slot::Occupied(..)) {
            self.entries[index] = Slot::Tombstone;
            true
        } else {
            false
        }
    }

    pub fn copy_all_into(&self, dst: &mut Table) {
        for slot in &self.entries {
            if let Slot::Occupied(key, value) = slot {
                dst.insert(*key, *value);
            }
        }
    }

    /// The one place strings are compared by content rather than identity:
    /// used by the interner to deduplicate a freshly-scanned literal against
    /// an already-canonical string object.
    pub fn find_string(&self, s: &str) -> Option<GcRef<Obj>> {
        if self.entries.is_empty() {
            return None;
        }
        let hash = fnv1a(s);
        let capacity = self.capacity();
        let mut index = (hash as usize) % capacity;
        loop {
            match self.entries[index] {
                Slot::Empty => return None,
                Slot::Occupied(key, _) => {
                    if key.hash == hash {
                        if let crate::object::ObjKind::Str(existing) = &key.kind {
                            if existing == s {
                                return Some(key);
                            }
                        }
                    }
                }
                Slot::Tombstone => {}
            }
            index = (index + 1) % capacity;
        }
    }

    /// Before sweep: drop every entry whose key is not marked. This is what
    /// gives the interner its weak-key behavior — a string surviving only
    /// because it is the key of an interner entry is not "reachable" for GC
    /// purposes.
    pub fn remove_weak(&mut self) {
        for slot in &mut self.entries {
            if let Slot::Occupied(key, _) = slot {
                if !key.marked.get() {
                    *slot = Slot::Tombstone;
                }
            }
        }
    }

    pub fn iter_entries(&self) -> impl Iterator<Item = (GcRef<Obj>, Value)> + '_ {
        self.entries.iter().filter_map(|s| match s {
            Slot::Occupied(k, v) => Some((*k, *v)),
            _ => None,
        })
    }
}

/// FNV-1a, the same string hash clox uses: cheap, good enough distribution
/// for an identifier/literal table.
pub fn fnv1a(s: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in s.as_bytes() {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::{GcRoots, Heap};
    use crate::object::ObjKind;

    struct NoRoots;
    impl GcRoots for NoRoots {
        fn mark_extra_roots(&self, _heap: &mut Heap) {}
    }

    #[test]
    fn insert_get_delete_roundtrip() {
        let mut heap = Heap::new();
        let roots = NoRoots;
        let key = heap.intern("count", &roots);

        let mut table = Table::new();
        assert!(table.insert(key, Value::Number(1.0)));
        assert!(!table.insert(key, Value::Number(2.0)));
        assert_eq!(table.get(key), Some(Value::Number(2.0)));
        assert!(table.delete(key));
        assert_eq!(table.get(key), None);
        assert!(!table.delete(key));
    }

    #[test]
    fn grows_past_load_factor() {
        let mut heap = Heap::new();
        let roots = NoRoots;
        let mut table = Table::new();
        for i in 0..64 {
            let key = heap.intern(&format!("k{i}"), &roots);
            table.insert(key, Value::Number(i as f64));
        }
        for i in 0..64 {
            let key = heap.intern(&format!("k{i}"), &roots);
            assert_eq!(table.get(key), Some(Value::Number(i as f64)));
        }
    }

    #[test]
    fn find_string_dedupes_by_content() {
        let mut heap = Heap::new();
        let roots = NoRoots;
        let a = heap.intern("hello", &roots);
        let b = heap.intern("hello", &roots);
        assert_eq!(a, b);
        if let ObjKind::Str(s) = &a.kind {
            assert_eq!(s, "hello");
        } else {
            panic!("expected string object");
        }
    }
}
