//! Open-addressed hash table mapping interned strings to values.
//!
//! Used for the VM's global-variable table, every class's method table, and
//! every instance's field table — all three are exactly "interned string
//! key -> Value" and share this single implementation, the way the original
//! `Table` type is reused across all three call sites.

use crate::object::ObjRef;
use crate::value::Value;

#[derive(Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    value: Slot,
}

#[derive(Clone, Copy)]
enum Slot {
    Empty,
    Tombstone,
    Value(Value),
}

const MAX_LOAD: f64 = 0.75;

pub struct Table {
    entries: Vec<Entry>,
    count: usize,
}

impl Table {
    pub fn new() -> Table {
        Table { entries: Vec::new(), count: 0 }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Inserts, returning `true` if this created a new key (clox's
    /// `tableSet` return contract, used by `DEFINE_GLOBAL` to detect
    /// redefinition and by `SET_GLOBAL` to detect an undefined name).
    pub fn set(&mut self, key: ObjRef, value: Value) -> bool {
        if self.entries.is_empty() || (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD {
            self.grow();
        }
        let index = self.find_slot(key);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_none();
        if is_new_key && matches!(entry.value, Slot::Empty) {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = Slot::Value(value);
        is_new_key
    }

    pub fn get(&self, key: ObjRef) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let index = self.find_slot(key);
        match &self.entries[index] {
            Entry { key: Some(_), value: Slot::Value(v) } => Some(*v),
            _ => None,
        }
    }

    /// Deletes by planting a tombstone (`key = None, value = Tombstone`),
    /// which keeps later entries' probe sequences intact.
    pub fn delete(&mut self, key: ObjRef) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = self.find_slot(key);
        match &self.entries[index] {
            Entry { key: Some(_), .. } => {
                self.entries[index] = Entry { key: None, value: Slot::Tombstone };
                true
            }
            _ => false,
        }
    }

    /// Probes by byte content rather than identity, the single exception to
    /// this table otherwise comparing keys by pointer — this is what lets
    /// the interner turn a freshly scanned byte sequence into the canonical
    /// `ObjRef` for that string, or decide none exists yet.
    pub fn find_interned_string(&self, bytes: &str, hash: u32) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.capacity();
        let mut index = (hash as usize) & (capacity - 1);
        loop {
            match &self.entries[index] {
                Entry { key: None, value: Slot::Empty } => return None,
                Entry { key: Some(k), .. } => {
                    let s = k.get().as_string().expect("table keys are always strings");
                    if s.hash == hash && s.value == bytes {
                        return Some(*k);
                    }
                }
                _ => {}
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    pub fn for_each(&self, mut f: impl FnMut(ObjRef, Value)) {
        for entry in &self.entries {
            if let Entry { key: Some(k), value: Slot::Value(v) } = entry {
                f(*k, *v);
            }
        }
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn find_slot(&self, key: ObjRef) -> usize {
        let capacity = self.capacity();
        let hash = key.get().as_string().expect("table keys are always strings").hash;
        let mut index = (hash as usize) & (capacity - 1);
        let mut tombstone: Option<usize> = None;
        loop {
            match &self.entries[index] {
                Entry { key: None, value: Slot::Empty } => {
                    return tombstone.unwrap_or(index);
                }
                Entry { key: None, value: Slot::Tombstone } => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Entry { key: Some(k), .. } if k.0 == key.0 => return index,
                _ => {}
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    fn grow(&mut self) {
        let new_capacity = if self.entries.is_empty() { 8 } else { self.entries.len() * 2 };
        let old_entries = std::mem::replace(
            &mut self.entries,
            vec![Entry { key: None, value: Slot::Empty }; new_capacity],
        );
        self.count = 0;
        for entry in old_entries {
            if let Entry { key: Some(k), value: Slot::Value(v) } = entry {
                let index = self.find_slot(k);
                self.entries[index] = Entry { key: Some(k), value: Slot::Value(v) };
                self.count += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{LoxString, Obj, ObjKind};

    fn intern(s: &str) -> ObjRef {
        let obj = Box::new(Obj::new(ObjKind::String(LoxString::new(s.to_string()))));
        ObjRef(Box::into_raw(obj))
    }

    #[test]
    fn test_set_get() {
        let mut table = Table::new();
        let key = intern("foo");
        assert!(table.set(key, Value::Number(1.0)));
        assert_eq!(table.get(key), Some(Value::Number(1.0)));
    }

    #[test]
    fn test_redefine_returns_false() {
        let mut table = Table::new();
        let key = intern("foo");
        assert!(table.set(key, Value::Number(1.0)));
        assert!(!table.set(key, Value::Number(2.0)));
        assert_eq!(table.get(key), Some(Value::Number(2.0)));
    }

    #[test]
    fn test_delete_then_get() {
        let mut table = Table::new();
        let key = intern("foo");
        table.set(key, Value::Nil);
        assert!(table.delete(key));
        assert_eq!(table.get(key), None);
    }

    #[test]
    fn test_find_interned_string() {
        let mut table = Table::new();
        let key = intern("hello");
        let hash = key.get().as_string().unwrap().hash;
        table.set(key, Value::Nil);
        assert!(table.find_interned_string("hello", hash).is_some());
        assert!(table.find_interned_string("goodbye", hash).is_none());
    }

    #[test]
    fn test_grows_past_load_factor() {
        let mut table = Table::new();
        for i in 0..100 {
            let key = intern(&format!("key{}", i));
            table.set(key, Value::Number(i as f64));
        }
        assert_eq!(table.len(), 100);
        for i in 0..100 {
            let key = intern(&format!("key{}", i));
            assert_eq!(table.get(key), Some(Value::Number(i as f64)));
        }
    }
}
