//! The memory manager: a precise mark-sweep tracing collector plus a string
//! interner, grounded in the shape of the clox allocator (`reallocate`,
//! `bytes_allocated`, a grow-by-two threshold) but expressed with Rust's own
//! ownership primitives instead of a bump allocator.
//!
//! Every heap object is individually boxed and leaked into a raw pointer
//! (`GcRef<Obj>`); the `Heap` keeps a flat list of every live pointer instead
//! of an embedded `next` field, since an intrusive list would fight the
//! borrow checker for no benefit once the flat list already enumerates every
//! live object for sweep.

use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ptr::NonNull;

use crate::object::{Obj, ObjKind};
use crate::table::Table;
use crate::value::Value;

const GC_GROW_FACTOR: usize = 2;
const INITIAL_GC_THRESHOLD: usize = 1024 * 1024;

/// A non-owning, `Copy`-able handle to a heap object. Equality is identity
/// (pointer) equality, which is exactly what object values need, and
/// `String`s are additionally interned so that content equality implies
/// pointer equality for them too.
pub struct GcRef<T> {
    ptr: NonNull<T>,
}

impl<T> GcRef<T> {
    fn new(ptr: *mut T) -> Self {
        Self {
            ptr: NonNull::new(ptr).expect("allocation must not be null"),
        }
    }

    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }
}

impl<T> Clone for GcRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for GcRef<T> {}

impl<T> PartialEq for GcRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}
impl<T> Eq for GcRef<T> {}

impl<T> Hash for GcRef<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ptr.as_ptr().hash(state);
    }
}

impl<T> std::ops::Deref for GcRef<T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safe as long as the collector never frees an object still
        // reachable from a live `GcRef`.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> fmt::Debug for GcRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GcRef({:p})", self.ptr.as_ptr())
    }
}

/// A GC root source external to the heap's own tables: anything else the
/// collector must treat as reachable. Implemented by whatever owns the
/// value stack and call frames (or, during compilation, the in-progress
/// function chunks) so the GC module never needs to depend on them.
pub trait GcRoots {
    fn mark_extra_roots(&self, heap: &mut Heap);
}

pub struct Heap {
    objects: Vec<GcRef<Obj>>,
    bytes_allocated: usize,
    next_gc: usize,
    pub strings: Table,
    gray_stack: Vec<GcRef<Obj>>,
    pub stress_gc: bool,
    pub log_gc: bool,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_GC_THRESHOLD,
            strings: Table::new(),
            gray_stack: Vec::new(),
            stress_gc: false,
            log_gc: false,
        }
    }

    fn track(&mut self, kind: ObjKind) -> GcRef<Obj> {
        let size = std::mem::size_of::<Obj>();
        self.bytes_allocated += size;
        let boxed = Box::new(Obj::new(kind));
        let ptr = GcRef::new(Box::into_raw(boxed));
        self.objects.push(ptr);
        ptr
    }

    /// Allocates `kind` as a fresh heap object, running a collection first
    /// if the allocation would push past the GC threshold (or stress mode
    /// is on). `roots` supplies everything collectable that isn't reachable
    /// purely from the heap's own `strings` table.
    pub fn alloc(&mut self, kind: ObjKind, roots: &dyn GcRoots) -> GcRef<Obj> {
        if self.stress_gc || self.bytes_allocated > self.next_gc {
            self.collect_garbage(roots);
        }
        self.track(kind)
    }

    /// Interns a string, returning the canonical object for its contents.
    /// This is the one path in the system that compares strings by content
    /// (via `Table::find_string`); every other comparison is pointer
    /// equality.
    pub fn intern(&mut self, s: &str, roots: &dyn GcRoots) -> GcRef<Obj> {
        if let Some(existing) = self.strings.find_string(s) {
            return existing;
        }
        if self.stress_gc || self.bytes_allocated > self.next_gc {
            self.collect_garbage(roots);
        }
        let obj = self.track(ObjKind::Str(s.to_owned()));
        self.strings.insert(obj, Value::Bool(true));
        obj
    }

    pub fn collect_garbage(&mut self, roots: &dyn GcRoots) {
        if self.log_gc {
            eprintln!("-- gc begin");
        }

        roots.mark_extra_roots(self);
        self.trace_references();
        self.strings.remove_weak();
        self.sweep();

        self.next_gc = self.bytes_allocated * GC_GROW_FACTOR;

        if self.log_gc {
            eprintln!("-- gc end");
        }
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(obj) = value {
            self.mark_object(obj);
        }
    }

    pub fn mark_object(&mut self, obj: GcRef<Obj>) {
        if obj.marked.get() {
            return;
        }
        obj.marked.set(true);
        self.gray_stack.push(obj);
    }

    fn trace_references(&mut self) {
        while let Some(obj) = self.gray_stack.pop() {
            self.blacken_object(obj);
        }
    }

    fn blacken_object(&mut self, obj: GcRef<Obj>) {
        match &obj.kind {
            ObjKind::Str(_) | ObjKind::Native(_) => {}
            ObjKind::Function(f) => {
                if let Some(name) = f.name {
                    self.mark_object(name);
                }
                let constants: Vec<Value> = f.chunk.constants().to_vec();
                for c in constants {
                    self.mark_value(c);
                }
            }
            ObjKind::Closure(c) => {
                self.mark_object(c.function);
                for up in c.upvalues.iter() {
                    self.mark_object(*up);
                }
            }
            ObjKind::Upvalue(cell) => {
                if let crate::object::UpvalueState::Closed(v) = &*cell.borrow() {
                    self.mark_value(*v);
                }
            }
            ObjKind::Class(cell) => {
                let class = cell.borrow();
                self.mark_object(class.name);
                let methods: Vec<(GcRef<Obj>, Value)> = class.methods.iter_entries().collect();
                drop(class);
                for (k, v) in methods {
                    self.mark_object(k);
                    self.mark_value(v);
                }
            }
            ObjKind::Instance(cell) => {
                let inst = cell.borrow();
                self.mark_object(inst.class);
                let fields: Vec<(GcRef<Obj>, Value)> = inst.fields.iter_entries().collect();
                drop(inst);
                for (k, v) in fields {
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

    /// Number of heap objects still tracked for sweep. Test-only window into
    /// collector state; nothing in the interpreter itself needs object counts.
    #[cfg(test)]
    pub fn objects_len(&self) -> usize {
        self.objects.len()
    }

    fn sweep(&mut self) {
        let mut still_live = Vec::with_capacity(self.objects.len());
        let mut freed: HashSet<*mut Obj> = HashSet::new();

        for obj in self.objects.drain(..) {
            if obj.marked.get() {
                obj.marked.set(false);
                still_live.push(obj);
            } else {
                let ptr = obj.as_ptr();
                if freed.insert(ptr) {
                    // SAFETY: nothing still reachable holds this pointer —
                    // sweep only runs after every root has been traced.
                    unsafe {
                        drop(Box::from_raw(ptr));
                    }
                }
            }
        }

        self.objects = still_live;
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        for obj in self.objects.drain(..) {
            unsafe {
                drop(Box::from_raw(obj.as_ptr()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::vm::Vm;

    struct NoRoots;
    impl GcRoots for NoRoots {
        fn mark_extra_roots(&self, _heap: &mut Heap) {}
    }

    #[test]
    fn unreachable_object_is_freed_on_collect() {
        let mut heap = Heap::new();
        let roots = NoRoots;
        heap.alloc(ObjKind::Str("throwaway".to_string()), &roots);
        assert_eq!(heap.objects_len(), 1);
        heap.collect_garbage(&roots);
        assert_eq!(heap.objects_len(), 0);
    }

    #[test]
    fn root_reachable_object_survives_collect() {
        let mut heap = Heap::new();
        let mut vm = Vm::new(&mut heap);
        let function = compile("var kept = \"alive\"; print kept;", &mut heap, &vm).unwrap();
        let mut stdout = Vec::new();
        vm.interpret(function, &mut heap, &mut stdout).unwrap();
        heap.stress_gc = true;
        // Forcing a collection after the script has already run must not
        // disturb the still-reachable global `kept`.
        heap.collect_garbage(&vm);
        let another = heap.intern("alive", &vm);
        assert_eq!(String::from_utf8(stdout).unwrap(), "alive\n");
        assert_eq!(another.as_str(), "alive");
    }

    #[test]
    fn interner_entry_for_unreachable_string_is_dropped_as_a_weak_key() {
        let mut heap = Heap::new();
        let roots = NoRoots;
        let first = heap.intern("ephemeral", &roots);
        assert!(heap.strings.get(first).is_some());
        heap.collect_garbage(&roots);
        assert_eq!(heap.strings.len(), 0);
    }

    #[test]
    fn stress_gc_does_not_change_program_output() {
        let source = "fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(10);";

        let mut heap = Heap::new();
        let mut vm = Vm::new(&mut heap);
        let function = compile(source, &mut heap, &vm).unwrap();
        let mut stdout = Vec::new();
        vm.interpret(function, &mut heap, &mut stdout).unwrap();
        let normal_out = String::from_utf8(stdout).unwrap();

        let mut heap = Heap::new();
        heap.stress_gc = true;
        let mut vm = Vm::new(&mut heap);
        let function = compile(source, &mut heap, &vm).unwrap();
        let mut stdout = Vec::new();
        vm.interpret(function, &mut heap, &mut stdout).unwrap();
        let stress_out = String::from_utf8(stdout).unwrap();

        assert_eq!(normal_out, stress_out);
        assert_eq!(normal_out, "55\n");
    }

    /// A collection forced on every allocation made *while compiling* must
    /// still see the VM's roots — in particular `vm.init_string`, which
    /// `call_value`'s `Class` arm dereferences at runtime to look up `init`.
    /// Before `compile` threaded the VM's roots through, this scenario
    /// collected `init_string`'s backing object away during compilation and
    /// then used-after-freed it on the `B().greet()` call.
    #[test]
    fn stress_gc_survives_compiling_a_class_hierarchy() {
        let source = "class A { greet() { print \"A\"; } } \
                       class B < A { greet() { super.greet(); print \"B\"; } } \
                       B().greet();";
        let mut heap = Heap::new();
        heap.stress_gc = true;
        let mut vm = Vm::new(&mut heap);
        let function = compile(source, &mut heap, &vm).unwrap();
        let mut stdout = Vec::new();
        vm.interpret(function, &mut heap, &mut stdout).unwrap();
        assert_eq!(String::from_utf8(stdout).unwrap(), "A\nB\n");
    }
}
