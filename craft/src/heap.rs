//! The mark-sweep garbage collector.
//!
//! The heap owns every allocated [`Obj`] in a `Vec<Box<Obj>>`. Marking sets a
//! `Cell<bool>` on the object header; sweeping is `Vec::retain`, so an
//! unmarked object's `Box` — and everything it owns — is dropped by Rust
//! itself rather than freed by hand. This trades the original's intrusive
//! `next`-linked object list (which the mutator must never alias) for an
//! ordinary owning collection, at the cost of needing a raw pointer
//! ([`ObjRef`]) wherever an object is *referenced* rather than *owned*.

use crate::object::{Obj, ObjKind, ObjRef};
use crate::table::Table;
use crate::trace_gc;
use crate::value::Value;

/// Collect once every this many bytes of growth, matching the original's
/// initial threshold before the first doubling.
const GC_HEAP_GROW_FACTOR: usize = 2;
const INITIAL_NEXT_GC: usize = 1024 * 1024;

pub struct Heap {
    objects: Vec<Box<Obj>>,
    gray_stack: Vec<ObjRef>,
    strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
    pub stress_test: bool,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            objects: Vec::new(),
            gray_stack: Vec::new(),
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
            stress_test: cfg!(feature = "gc_stress_test"),
        }
    }

    pub fn should_collect(&self) -> bool {
        self.stress_test || self.bytes_allocated > self.next_gc
    }

    /// Runs a collection first if the heap is over threshold (or in stress
    /// mode). Call sites that allocate call this first so the root set they
    /// pass in is marked before the object they're about to create could
    /// possibly be mistaken for garbage.
    pub fn maybe_collect(&mut self, mark_roots: impl FnOnce(&mut Heap)) {
        if self.should_collect() {
            self.collect_garbage(mark_roots);
        }
    }

    /// Allocates a new object on the heap, returning a raw reference to it.
    /// The caller is responsible for keeping the object reachable from a GC
    /// root (typically by immediately pushing it onto the VM stack) until
    /// it is linked into a longer-lived structure.
    pub fn alloc(&mut self, kind: ObjKind) -> ObjRef {
        self.bytes_allocated += approximate_size(&kind);
        let mut boxed = Box::new(Obj::new(kind));
        let ptr = ObjRef(boxed.as_mut() as *mut Obj);
        self.objects.push(boxed);
        trace_gc!("alloc {:p} ({})", ptr.0, ptr.get().type_name());
        ptr
    }

    /// Interns a string: if an equal string already exists, returns it
    /// instead of allocating. The only table lookup in the VM that compares
    /// by byte content rather than pointer identity.
    pub fn intern_string(&mut self, s: &str) -> ObjRef {
        let hash = crate::object::fnv1a_hash(s.as_bytes());
        if let Some(existing) = self.strings.find_interned_string(s, hash) {
            return existing;
        }
        let obj = self.alloc(ObjKind::String(crate::object::LoxString::new(s.to_string())));
        self.strings.set(obj, Value::Obj(obj));
        obj
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(obj) = value {
            self.mark_object(obj);
        }
    }

    pub fn mark_object(&mut self, obj: ObjRef) {
        if obj.get().marked.get() {
            return;
        }
        trace_gc!("mark {:p} ({})", obj.0, obj.get().type_name());
        obj.get().marked.set(true);
        self.gray_stack.push(obj);
    }

    /// Runs a full collection cycle: the caller supplies a closure that
    /// marks every root (VM stack, call frames, open upvalues, globals, the
    /// interned `"init"` string, and any compiler currently mid-compile).
    pub fn collect_garbage(&mut self, mark_roots: impl FnOnce(&mut Heap)) {
        trace_gc!("-- gc begin");
        mark_roots(self);
        self.trace_references();
        self.sweep_strings();
        let before = self.bytes_allocated;
        self.sweep();
        self.next_gc = self.bytes_allocated.max(INITIAL_NEXT_GC) * GC_HEAP_GROW_FACTOR;
        trace_gc!("-- gc end, collected {} bytes, next at {}", before - self.bytes_allocated, self.next_gc);
    }

    fn trace_references(&mut self) {
        while let Some(obj) = self.gray_stack.pop() {
            self.blacken(obj);
        }
    }

    fn blacken(&mut self, obj: ObjRef) {
        trace_gc!("blacken {:p} ({})", obj.0, obj.get().type_name());
        match &obj.get().kind {
            ObjKind::String(_) | ObjKind::Native(_) => {}
            ObjKind::Function(f) => {
                for value in &f.chunk.constants {
                    self.mark_value(*value);
                }
            }
            ObjKind::Closure(c) => {
                self.mark_object(c.function);
                for upvalue in &c.upvalues {
                    self.mark_object(*upvalue);
                }
            }
            ObjKind::Upvalue(u) => {
                if let crate::object::Upvalue::Closed(v) = u {
                    self.mark_value(*v);
                }
            }
            ObjKind::Class(c) => {
                let mut entries = Vec::new();
                c.methods.borrow().for_each(|k, v| entries.push((k, v)));
                for (k, v) in entries {
                    self.mark_object(k);
                    self.mark_value(v);
                }
            }
            ObjKind::Instance(i) => {
                self.mark_object(i.class);
                let mut entries = Vec::new();
                i.fields.borrow().for_each(|k, v| entries.push((k, v)));
                for (k, v) in entries {
                    self.mark_object(k);
                    self.mark_value(v);
                }
            }
            ObjKind::BoundMethod(b) => {
                self.mark_value(b.receiver);
                self.mark_object(b.method);
            }
        }
    }

    /// Weak-reference sweep: any interned string not reached by the trace
    /// phase above is removed from the intern table before the object
    /// itself is freed, so the table never holds a dangling key.
    fn sweep_strings(&mut self) {
        let mut dead = Vec::new();
        self.strings.for_each(|k, _| {
            if !k.get().marked.get() {
                dead.push(k);
            }
        });
        for k in dead {
            self.strings.delete(k);
        }
    }

    fn sweep(&mut self) {
        let mut freed = 0usize;
        self.objects.retain(|obj| {
            if obj.marked.get() {
                obj.marked.set(false);
                true
            } else {
                freed += approximate_size(&obj.kind);
                trace_gc!("free {:p} ({})", obj.as_ref() as *const Obj, obj.type_name());
                false
            }
        });
        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed);
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

/// A coarse per-object size estimate used purely to drive the GC threshold
/// heuristic — it need not be exact, only roughly proportional to the real
/// footprint.
fn approximate_size(kind: &ObjKind) -> usize {
    use std::mem::size_of;
    match kind {
        ObjKind::String(s) => size_of::<crate::object::LoxString>() + s.value.len(),
        ObjKind::Function(_) => size_of::<crate::object::Function>(),
        ObjKind::Native(_) => size_of::<crate::object::NativeFunction>(),
        ObjKind::Closure(c) => size_of::<crate::object::Closure>() + c.upvalues.len() * size_of::<ObjRef>(),
        ObjKind::Upvalue(_) => size_of::<crate::object::Upvalue>(),
        ObjKind::Class(_) => size_of::<crate::object::Class>(),
        ObjKind::Instance(_) => size_of::<crate::object::Instance>(),
        ObjKind::BoundMethod(_) => size_of::<crate::object::BoundMethod>(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_dedup() {
        let mut heap = Heap::new();
        let a = heap.intern_string("hello");
        let b = heap.intern_string("hello");
        assert_eq!(a.0, b.0);
    }

    #[test]
    fn test_unreferenced_object_is_collected() {
        let mut heap = Heap::new();
        heap.intern_string("temporary");
        assert_eq!(heap.object_count(), 1);
        heap.collect_garbage(|_| {});
        assert_eq!(heap.object_count(), 0);
    }

    #[test]
    fn test_rooted_object_survives() {
        let mut heap = Heap::new();
        let s = heap.intern_string("keepme");
        heap.collect_garbage(|heap| heap.mark_object(s));
        assert_eq!(heap.object_count(), 1);
    }
}
