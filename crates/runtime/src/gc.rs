//! The heap and its mark-and-sweep collector.
//!
//! Objects live in a slab of slots; a `GcRef` is a slot index and object
//! identity is the index. Freed slots go on a free list and are reused by
//! later allocations. The collector is precise: the VM marks its roots,
//! `collect` traces the object graph through an explicit gray stack, the
//! intern pool drops entries whose string was not reached, and the sweep
//! frees everything unmarked (running userdata finalizers).
//!
//! The heap never collects on its own. The VM checks [`Heap::should_collect`]
//! at allocation sites where its roots are consistent, marks, and calls
//! [`Heap::collect`]; any code path holding freshly allocated objects that
//! are not yet reachable must root them on the value stack first or bump
//! [`Heap::disable`].

use crate::object::{ObjBody, ObjStr, ObjUpvalue};
use crate::table::InternPool;
use crate::value::{hash_bytes, GcRef, Value};

/// Default first-collection threshold, in accounted bytes.
pub const DEFAULT_FIRST_GC: usize = 1024 * 1024;

/// Default growth factor applied to the threshold after each collection.
pub const DEFAULT_HEAP_GROW_RATE: usize = 2;

#[derive(Debug, Default)]
struct Slot {
    marked: bool,
    class: Option<GcRef>,
    size: usize,
    body: Option<ObjBody>,
}

/// Counters exposed for tuning and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct GcStats {
    pub collections: u64,
    pub objects_freed: u64,
    pub bytes_freed: u64,
}

#[derive(Debug)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    gray: Vec<GcRef>,
    /// Accounted bytes currently allocated.
    pub allocated: usize,
    /// Next collection triggers when `allocated` exceeds this.
    pub next_gc: usize,
    pub heap_grow_rate: usize,
    /// Collect on every allocation opportunity; for shaking out missing
    /// roots in tests.
    pub stress: bool,
    disable_depth: u32,
    pub pool: InternPool,
    pub stats: GcStats,
}

impl Heap {
    pub fn new(first_gc: usize, heap_grow_rate: usize) -> Heap {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            gray: Vec::new(),
            allocated: 0,
            next_gc: first_gc,
            heap_grow_rate,
            stress: false,
            disable_depth: 0,
            pool: InternPool::new(),
            stats: GcStats::default(),
        }
    }

    /// Number of live objects.
    pub fn live_objects(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Suppress collection while multi-step construction is in flight.
    /// Nests.
    pub fn disable(&mut self) {
        self.disable_depth += 1;
    }

    pub fn enable(&mut self) {
        debug_assert!(self.disable_depth > 0);
        self.disable_depth = self.disable_depth.saturating_sub(1);
    }

    pub fn should_collect(&self) -> bool {
        if self.disable_depth > 0 {
            return false;
        }
        self.stress || self.allocated > self.next_gc
    }

    /// Allocate a new object. The caller roots it (usually by pushing it
    /// on the value stack) before anything else can allocate.
    pub fn alloc(&mut self, class: Option<GcRef>, body: ObjBody) -> GcRef {
        let size = body.approx_size();
        self.allocated += size;
        let slot = Slot { marked: false, class, size, body: Some(body) };
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = slot;
                GcRef(idx)
            }
            None => {
                self.slots.push(slot);
                GcRef((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Record growth of a container owned by an object, keeping the
    /// allocation counter honest between collections.
    pub fn account_growth(&mut self, bytes: usize) {
        self.allocated += bytes;
    }

    // ---- access ----

    pub fn get(&self, r: GcRef) -> &ObjBody {
        self.slots[r.index()].body.as_ref().expect("access to freed object")
    }

    pub fn get_mut(&mut self, r: GcRef) -> &mut ObjBody {
        self.slots[r.index()].body.as_mut().expect("access to freed object")
    }

    pub fn is_live(&self, r: GcRef) -> bool {
        self.slots.get(r.index()).is_some_and(|s| s.body.is_some())
    }

    /// The header class pointer; `None` only before bootstrap patching
    /// (or for the root class sentinel).
    pub fn class_of(&self, r: GcRef) -> Option<GcRef> {
        self.slots[r.index()].class
    }

    pub fn set_class(&mut self, r: GcRef, class: GcRef) {
        self.slots[r.index()].class = Some(class);
    }

    /// Assign classes to objects allocated before their class existed
    /// (bootstrap patching). Objects that already have a class keep it.
    pub fn patch_unclassed(&mut self, f: impl Fn(&ObjBody) -> Option<GcRef>) {
        for slot in &mut self.slots {
            if slot.class.is_none() {
                if let Some(body) = &slot.body {
                    slot.class = f(body);
                }
            }
        }
    }

    // ---- strings ----

    /// Look up or create an interned string. Equal byte sequences always
    /// return the same object.
    pub fn intern(&mut self, text: &str) -> GcRef {
        let hash = hash_bytes(text.as_bytes());
        let (pool, slots) = (&self.pool, &self.slots);
        let found = pool.get_interned(hash, text.as_bytes(), |r| {
            match slots[r.index()].body.as_ref() {
                Some(ObjBody::Str(s)) => s.bytes.as_bytes(),
                _ => &[],
            }
        });
        if let Some(r) = found {
            return r;
        }
        let r = self.alloc(
            None,
            ObjBody::Str(ObjStr { bytes: text.to_string(), hash, interned: true }),
        );
        self.pool.insert(hash, r);
        r
    }

    /// Create a non-interned string (string builders, formatting).
    /// Content-equal copies are distinct objects.
    pub fn new_string(&mut self, text: String) -> GcRef {
        let hash = hash_bytes(text.as_bytes());
        self.alloc(None, ObjBody::Str(ObjStr { bytes: text, hash, interned: false }))
    }

    pub fn str_bytes(&self, r: GcRef) -> &str {
        match self.get(r) {
            ObjBody::Str(s) => &s.bytes,
            other => panic!("expected string, found {}", other.type_name()),
        }
    }

    pub fn str_hash(&self, r: GcRef) -> u32 {
        match self.get(r) {
            ObjBody::Str(s) => s.hash,
            other => panic!("expected string, found {}", other.type_name()),
        }
    }

    // Typed accessors. A kind mismatch is an interpreter bug, not a user
    // error, hence the panics.

    pub fn func(&self, r: GcRef) -> &crate::object::ObjFunc {
        match self.get(r) {
            ObjBody::Func(f) => f,
            other => panic!("expected function, found {}", other.type_name()),
        }
    }

    pub fn func_mut(&mut self, r: GcRef) -> &mut crate::object::ObjFunc {
        match self.get_mut(r) {
            ObjBody::Func(f) => f,
            other => panic!("expected function, found {}", other.type_name()),
        }
    }

    pub fn module(&self, r: GcRef) -> &crate::object::ObjModule {
        match self.get(r) {
            ObjBody::Module(m) => m,
            other => panic!("expected module, found {}", other.type_name()),
        }
    }

    pub fn module_mut(&mut self, r: GcRef) -> &mut crate::object::ObjModule {
        match self.get_mut(r) {
            ObjBody::Module(m) => m,
            other => panic!("expected module, found {}", other.type_name()),
        }
    }

    pub fn class(&self, r: GcRef) -> &crate::object::ObjClass {
        match self.get(r) {
            ObjBody::Class(c) => c,
            other => panic!("expected class, found {}", other.type_name()),
        }
    }

    pub fn class_mut(&mut self, r: GcRef) -> &mut crate::object::ObjClass {
        match self.get_mut(r) {
            ObjBody::Class(c) => c,
            other => panic!("expected class, found {}", other.type_name()),
        }
    }

    pub fn closure(&self, r: GcRef) -> &crate::object::ObjClosure {
        match self.get(r) {
            ObjBody::Closure(c) => c,
            other => panic!("expected closure, found {}", other.type_name()),
        }
    }

    pub fn instance(&self, r: GcRef) -> &crate::object::ObjInstance {
        match self.get(r) {
            ObjBody::Instance(i) => i,
            other => panic!("expected instance, found {}", other.type_name()),
        }
    }

    pub fn instance_mut(&mut self, r: GcRef) -> &mut crate::object::ObjInstance {
        match self.get_mut(r) {
            ObjBody::Instance(i) => i,
            other => panic!("expected instance, found {}", other.type_name()),
        }
    }

    pub fn upvalue(&self, r: GcRef) -> &ObjUpvalue {
        match self.get(r) {
            ObjBody::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.type_name()),
        }
    }

    pub fn upvalue_mut(&mut self, r: GcRef) -> &mut ObjUpvalue {
        match self.get_mut(r) {
            ObjBody::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.type_name()),
        }
    }

    pub fn generator_mut(&mut self, r: GcRef) -> &mut crate::object::ObjGenerator {
        match self.get_mut(r) {
            ObjBody::Generator(g) => g,
            other => panic!("expected generator, found {}", other.type_name()),
        }
    }

    // ---- mark phase ----

    /// Root an object: mark it and queue it for tracing.
    pub fn mark(&mut self, r: GcRef) {
        let slot = &mut self.slots[r.index()];
        if slot.body.is_none() || slot.marked {
            return;
        }
        slot.marked = true;
        self.gray.push(r);
    }

    pub fn mark_value(&mut self, v: Value) {
        if let Value::Obj(r) = v {
            self.mark(r);
        }
    }

    fn is_marked(&self, r: GcRef) -> bool {
        self.slots[r.index()].marked
    }

    /// Drain the gray stack, tracing each object's outgoing references.
    fn trace(&mut self) {
        let mut refs: Vec<Value> = Vec::with_capacity(32);
        while let Some(r) = self.gray.pop() {
            refs.clear();
            let slot = &self.slots[r.index()];
            if let Some(class) = slot.class {
                refs.push(Value::Obj(class));
            }
            collect_refs(slot.body.as_ref().expect("gray object freed"), &mut refs);
            for &v in &refs {
                self.mark_value(v);
            }
        }
    }

    /// Run a full collection. The caller has already marked every root.
    pub fn collect(&mut self) {
        self.trace();

        // Weak pass: forget interned strings nobody reached.
        let slots = &self.slots;
        self.pool.retain_reached(|r| slots[r.index()].marked);

        // Sweep.
        let mut freed = 0u64;
        let mut bytes = 0u64;
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.body.is_none() {
                continue;
            }
            if slot.marked {
                slot.marked = false;
                continue;
            }
            if let Some(ObjBody::Userdata(u)) = &mut slot.body {
                if let Some(fin) = u.finalizer.take() {
                    fin(&mut u.data);
                }
            }
            self.allocated = self.allocated.saturating_sub(slot.size);
            bytes += slot.size as u64;
            slot.body = None;
            slot.class = None;
            slot.size = 0;
            self.free.push(idx as u32);
            freed += 1;
        }

        self.next_gc = (self.allocated * self.heap_grow_rate).max(DEFAULT_FIRST_GC / 4);
        self.stats.collections += 1;
        self.stats.objects_freed += freed;
        self.stats.bytes_freed += bytes;
    }
}

/// Outgoing references per object kind. The header class is handled by the
/// caller.
fn collect_refs(body: &ObjBody, out: &mut Vec<Value>) {
    match body {
        ObjBody::Str(_) | ObjBody::Userdata(_) => {}
        ObjBody::Module(m) => {
            out.push(Value::Obj(m.name));
            out.extend(m.globals.iter().copied());
            out.extend(m.global_names.iter().map(|(k, _)| Value::Obj(k)));
        }
        ObjBody::Func(f) => {
            out.push(Value::Obj(f.module));
            out.extend(f.consts.iter().copied());
            out.extend(f.defaults.iter().copied());
            if let Some(sup) = f.super_class {
                out.push(Value::Obj(sup));
            }
        }
        ObjBody::Native(n) => {
            out.push(Value::Obj(n.module));
            out.extend(n.defaults.iter().copied());
        }
        ObjBody::Closure(c) => {
            out.push(Value::Obj(c.func));
            out.extend(c.upvalues.iter().map(|&u| Value::Obj(u)));
        }
        ObjBody::Upvalue(u) => {
            if let ObjUpvalue::Closed(v) = u {
                out.push(*v);
            }
        }
        ObjBody::Class(c) => {
            out.push(Value::Obj(c.name));
            if let Some(sup) = c.super_class {
                out.push(Value::Obj(sup));
            }
            for (&name, &method) in &c.methods {
                out.push(Value::Obj(name));
                out.push(method);
            }
            out.extend(c.fields.iter().map(|(k, _)| Value::Obj(k)));
        }
        ObjBody::Instance(i) => out.extend(i.fields.iter().copied()),
        ObjBody::List(l) => out.extend(l.iter().copied()),
        ObjBody::Tuple(t) => out.extend(t.iter().copied()),
        ObjBody::Table(t) => {
            for (_, k, v) in t.iter() {
                out.push(k);
                out.push(v);
            }
        }
        ObjBody::BoundMethod(b) => {
            out.push(b.receiver);
            out.push(Value::Obj(b.method));
        }
        ObjBody::StackTrace(_) => {}
        ObjBody::Generator(g) => {
            out.push(Value::Obj(g.closure));
            out.extend(g.stack.iter().copied());
            out.push(g.last_yield);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_heap() -> Heap {
        Heap::new(DEFAULT_FIRST_GC, DEFAULT_HEAP_GROW_RATE)
    }

    #[test]
    fn test_intern_uniqueness() {
        let mut heap = test_heap();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b, "equal bytes must intern to the same object");
        assert_ne!(a, c);
        assert_eq!(heap.str_bytes(a), "hello");
    }

    #[test]
    fn test_non_interned_strings_are_distinct() {
        let mut heap = test_heap();
        let a = heap.new_string("x".to_string());
        let b = heap.new_string("x".to_string());
        assert_ne!(a, b);
    }

    #[test]
    fn test_collect_frees_unreached() {
        let mut heap = test_heap();
        let kept = heap.intern("kept");
        let _lost = heap.new_string("lost".to_string());
        let before = heap.live_objects();

        heap.mark(kept);
        heap.collect();

        assert_eq!(heap.live_objects(), before - 1);
        assert!(heap.is_live(kept));
        assert_eq!(heap.str_bytes(kept), "kept");
    }

    #[test]
    fn test_weak_intern_pool_drops_dead_keys() {
        let mut heap = test_heap();
        let kept = heap.intern("kept");
        let _dead = heap.intern("dead");
        assert_eq!(heap.pool.len(), 2);

        heap.mark(kept);
        heap.collect();

        assert_eq!(heap.pool.len(), 1);
        // A fresh intern of dead bytes allocates anew rather than
        // resurrecting a freed slot's identity.
        let reborn = heap.intern("dead");
        assert!(heap.is_live(reborn));
        assert_eq!(heap.str_bytes(reborn), "dead");
    }

    #[test]
    fn test_trace_through_list() {
        let mut heap = test_heap();
        let inner = heap.new_string("payload".to_string());
        let list = heap.alloc(None, ObjBody::List(vec![Value::Obj(inner)]));

        heap.mark(list);
        heap.collect();

        assert!(heap.is_live(inner), "list contents must survive through the list root");
        assert!(heap.is_live(list));
    }

    #[test]
    fn test_cycles_are_collected() {
        let mut heap = test_heap();
        let a = heap.alloc(None, ObjBody::List(Vec::new()));
        let b = heap.alloc(None, ObjBody::List(vec![Value::Obj(a)]));
        if let ObjBody::List(l) = heap.get_mut(a) {
            l.push(Value::Obj(b));
        }
        let before = heap.live_objects();

        heap.collect();

        assert_eq!(heap.live_objects(), before - 2, "unrooted cycle must be freed");
    }

    #[test]
    fn test_slot_reuse_after_sweep() {
        let mut heap = test_heap();
        let dead = heap.new_string("dead".to_string());
        heap.collect();
        assert!(!heap.is_live(dead));
        let fresh = heap.new_string("fresh".to_string());
        // The freed slot is recycled.
        assert_eq!(fresh.index(), dead.index());
    }

    #[test]
    fn test_userdata_finalizer_runs_on_sweep() {
        use crate::object::ObjUserdata;
        fn wipe(data: &mut [u8]) {
            for b in data.iter_mut() {
                *b = 0xAA;
            }
        }
        let mut heap = test_heap();
        let _ud = heap.alloc(
            None,
            ObjBody::Userdata(ObjUserdata { data: vec![1, 2, 3], finalizer: Some(wipe) }),
        );
        let freed_before = heap.stats.objects_freed;
        heap.collect();
        assert_eq!(heap.stats.objects_freed, freed_before + 1);
    }

    #[test]
    fn test_disable_suppresses_should_collect() {
        let mut heap = test_heap();
        heap.stress = true;
        assert!(heap.should_collect());
        heap.disable();
        assert!(!heap.should_collect());
        heap.disable();
        heap.enable();
        assert!(!heap.should_collect());
        heap.enable();
        assert!(heap.should_collect());
    }

    #[test]
    fn test_allocation_accounting() {
        let mut heap = test_heap();
        assert_eq!(heap.allocated, 0);
        heap.new_string("some bytes here".to_string());
        assert!(heap.allocated > 0);
        let before = heap.allocated;
        heap.collect();
        assert!(heap.allocated < before);
    }

    #[test]
    fn test_class_header_traced() {
        let mut heap = test_heap();
        let class_like = heap.alloc(None, ObjBody::List(Vec::new()));
        let obj = heap.alloc(Some(class_like), ObjBody::List(Vec::new()));
        heap.mark(obj);
        heap.collect();
        assert!(heap.is_live(class_like), "header class must be reached");
    }
}
