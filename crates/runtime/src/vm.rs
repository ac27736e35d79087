//! The bytecode interpreter.
//!
//! One `Vm` owns the heap, the value stack, the frame stack and the module
//! registry. Execution is a single dispatch loop over the current frame's
//! bytecode; nested activations (natives calling back in, operator
//! overloads, generator resumes) run the same loop reentrantly with an
//! entry depth that tells it where to stop.
//!
//! Exceptions travel as `Raised` values through `Result`; the loop funnels
//! them into `unwind`, which walks frames newest-first looking for a
//! handler and otherwise pops the frame, closes its upvalues and discards
//! its stack window.

use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use brio_core::limits::MAX_HANDLERS;
use brio_core::{Const, FuncProto, Opcode};

use crate::error::{default_error_callback, ErrorCallback, ErrorKind};
use crate::gc::{Heap, DEFAULT_FIRST_GC, DEFAULT_HEAP_GROW_RATE};
use crate::import::ImportHook;
use crate::object::{
    Cache, GenState, Handler, HandlerKind, NativeFn, ObjBody, ObjBoundMethod, ObjClass,
    ObjClosure, ObjFunc, ObjGenerator, ObjInstance, ObjNative, ObjStackTrace, ObjUpvalue, Raised,
    TraceRecord,
};
use crate::value::{hash_num, GcRef, Value};

/// Embedder-visible tunables. Plain data; callbacks are installed with
/// the `set_*` methods on [`Vm`].
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Value-stack slots reserved up front.
    pub init_stack: usize,
    /// Frame-stack entries reserved up front.
    pub init_frames: usize,
    /// Value-stack slot limit.
    pub max_stack: usize,
    /// Frame-stack limit; direct recursion deeper than this raises
    /// `StackOverflowException`.
    pub max_frames: usize,
    /// Limit on reentrant interpreter activations (native calls, operator
    /// overloads, generator resumes); beyond it raises
    /// `RecursionException`.
    pub max_reentrancy: usize,
    /// First collection threshold in accounted bytes.
    pub first_gc: usize,
    /// Threshold growth factor after each collection.
    pub heap_grow_rate: usize,
    /// Collect at every allocation point (for tests).
    pub stress_gc: bool,
    /// Module search prefixes.
    pub import_paths: Vec<PathBuf>,
    /// Arguments exposed as `sys.argv`.
    pub argv: Vec<String>,
}

impl Default for VmOptions {
    fn default() -> VmOptions {
        VmOptions {
            init_stack: 256,
            init_frames: 64,
            max_stack: 1 << 17,
            max_frames: 1000,
            max_reentrancy: 1000,
            first_gc: DEFAULT_FIRST_GC,
            heap_grow_rate: DEFAULT_HEAP_GROW_RATE,
            stress_gc: false,
            import_paths: Vec::new(),
            argv: Vec::new(),
        }
    }
}

/// Symbol-cache hit counters, exposed when tuning the inline caches.
#[derive(Debug, Default, Clone, Copy)]
pub struct VmStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Handles to the built-in classes. `object` and `class_cls` exist from
/// construction; the rest are filled in when the core module has run.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Builtins {
    pub object: GcRef,
    pub class_cls: GcRef,
    pub number: Option<GcRef>,
    pub boolean: Option<GcRef>,
    pub null_cls: Option<GcRef>,
    pub string: Option<GcRef>,
    pub function: Option<GcRef>,
    pub module_cls: Option<GcRef>,
    pub list: Option<GcRef>,
    pub tuple: Option<GcRef>,
    pub table: Option<GcRef>,
    pub stacktrace: Option<GcRef>,
    pub generator: Option<GcRef>,
    pub exception: Option<GcRef>,
}

/// Interned names the interpreter looks up on hot paths.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SpecialNames {
    pub add: GcRef,
    pub radd: GcRef,
    pub sub: GcRef,
    pub rsub: GcRef,
    pub mul: GcRef,
    pub rmul: GcRef,
    pub div: GcRef,
    pub rdiv: GcRef,
    pub modulo: GcRef,
    pub rmod: GcRef,
    pub pow: GcRef,
    pub rpow: GcRef,
    pub neg: GcRef,
    pub eq: GcRef,
    pub lt: GcRef,
    pub le: GcRef,
    pub gt: GcRef,
    pub ge: GcRef,
    pub hash: GcRef,
    pub iter: GcRef,
    pub next: GcRef,
    pub get: GcRef,
    pub set: GcRef,
    pub str_: GcRef,
    pub ctor: GcRef,
    pub err: GcRef,
    pub stacktrace: GcRef,
}

impl SpecialNames {
    fn intern_all(heap: &mut Heap) -> SpecialNames {
        SpecialNames {
            add: heap.intern("__add__"),
            radd: heap.intern("__radd__"),
            sub: heap.intern("__sub__"),
            rsub: heap.intern("__rsub__"),
            mul: heap.intern("__mul__"),
            rmul: heap.intern("__rmul__"),
            div: heap.intern("__div__"),
            rdiv: heap.intern("__rdiv__"),
            modulo: heap.intern("__mod__"),
            rmod: heap.intern("__rmod__"),
            pow: heap.intern("__pow__"),
            rpow: heap.intern("__rpow__"),
            neg: heap.intern("__neg__"),
            eq: heap.intern("__eq__"),
            lt: heap.intern("__lt__"),
            le: heap.intern("__le__"),
            gt: heap.intern("__gt__"),
            ge: heap.intern("__ge__"),
            hash: heap.intern("__hash__"),
            iter: heap.intern("__iter__"),
            next: heap.intern("__next__"),
            get: heap.intern("__get__"),
            set: heap.intern("__set__"),
            str_: heap.intern("__str__"),
            ctor: heap.intern(brio_core::limits::CTOR_NAME),
            err: heap.intern("err"),
            stacktrace: heap.intern("stacktrace"),
        }
    }

    fn each(&self, mut f: impl FnMut(GcRef)) {
        for r in [
            self.add, self.radd, self.sub, self.rsub, self.mul, self.rmul, self.div, self.rdiv,
            self.modulo, self.rmod, self.pow, self.rpow, self.neg, self.eq, self.lt, self.le,
            self.gt, self.ge, self.hash, self.iter, self.next, self.get, self.set, self.str_,
            self.ctor, self.err, self.stacktrace,
        ] {
            f(r);
        }
    }
}

/// One active call.
#[derive(Debug)]
pub(crate) struct Frame {
    /// The running `ObjFunc`.
    pub func: GcRef,
    pub closure: Option<GcRef>,
    /// Shared with the function object so instruction fetch does not
    /// touch the heap.
    pub proto: Rc<FuncProto>,
    pub ip: usize,
    /// Stack index of slot 0 (the callee/receiver).
    pub base: usize,
    pub handlers: Vec<Handler>,
    pub generator: Option<GcRef>,
}

pub struct Vm {
    pub heap: Heap,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<Frame>,
    /// Open upvalues sorted by descending stack slot, so frame teardown
    /// closes a prefix.
    open_upvalues: Vec<GcRef>,
    /// Interned dotted name -> module object.
    pub(crate) modules: HashMap<GcRef, GcRef>,
    pub(crate) builtins: Builtins,
    pub(crate) names: SpecialNames,
    pub(crate) empty_tuple: GcRef,
    pub(crate) core_module: Option<GcRef>,
    /// Exception that escaped the last failed evaluation.
    pub(crate) current_exception: Option<Value>,
    /// Module pushed by the most recent import instruction, read by
    /// `IMPORT_NAME`.
    pub(crate) last_import: Value,
    eval_break: Arc<AtomicBool>,
    pub options: VmOptions,
    pub(crate) error_cb: ErrorCallback,
    pub(crate) import_hook: Option<ImportHook>,
    /// Opaque embedder pointer, carried but never dereferenced.
    host_data: *mut std::ffi::c_void,
    reentrancy: usize,
    pub stats: VmStats,
}

impl Vm {
    /// Create a VM and run the core bootstrap.
    pub fn new(options: VmOptions) -> Vm {
        let mut heap = Heap::new(options.first_gc, options.heap_grow_rate);
        heap.stress = options.stress_gc;
        // Bootstrap happens under a disabled collector: the object graph
        // is inconsistent until the core module has run.
        heap.disable();

        let names = SpecialNames::intern_all(&mut heap);
        let (object, class_cls) = crate::bootstrap::genesis(&mut heap);
        let empty_tuple = heap.alloc(None, ObjBody::Tuple(Vec::new().into_boxed_slice()));

        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(options.init_stack),
            frames: Vec::with_capacity(options.init_frames),
            open_upvalues: Vec::new(),
            modules: HashMap::new(),
            builtins: Builtins {
                object,
                class_cls,
                number: None,
                boolean: None,
                null_cls: None,
                string: None,
                function: None,
                module_cls: None,
                list: None,
                tuple: None,
                table: None,
                stacktrace: None,
                generator: None,
                exception: None,
            },
            names,
            empty_tuple,
            core_module: None,
            current_exception: None,
            last_import: Value::Null,
            eval_break: Arc::new(AtomicBool::new(false)),
            options,
            error_cb: default_error_callback(),
            import_hook: None,
            host_data: std::ptr::null_mut(),
            reentrancy: 0,
            stats: VmStats::default(),
        };
        crate::bootstrap::boot(&mut vm);
        vm.heap.enable();
        vm
    }

    /// Flag polled between opcodes; setting it from a signal handler
    /// raises `ProgramInterrupted` at the next opcode boundary.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.eval_break)
    }

    pub fn set_error_callback(&mut self, cb: ErrorCallback) {
        self.error_cb = cb;
    }

    pub fn set_import_hook(&mut self, hook: ImportHook) {
        self.import_hook = Some(hook);
    }

    /// Attach an opaque pointer for natives and callbacks to retrieve.
    pub fn set_host_data(&mut self, data: *mut std::ffi::c_void) {
        self.host_data = data;
    }

    pub fn host_data(&self) -> *mut std::ffi::c_void {
        self.host_data
    }

    /// The exception that escaped the last failed evaluation, if any.
    pub fn current_exception(&self) -> Option<Value> {
        self.current_exception
    }

    // ------------------------------------------------------------ stack --

    pub(crate) fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    pub(crate) fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    pub(crate) fn peek(&self, depth: usize) -> Value {
        self.stack[self.stack.len() - 1 - depth]
    }

    pub(crate) fn sp(&self) -> usize {
        self.stack.len()
    }

    // --------------------------------------------------------------- gc --

    /// Collect if the heap asks for it. Every caller must have all its
    /// intermediate values rooted (on the stack or in a reachable object).
    pub(crate) fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    /// Mark every root and run a full collection.
    pub fn collect_garbage(&mut self) {
        for &v in &self.stack {
            self.heap.mark_value(v);
        }
        for frame in &self.frames {
            self.heap.mark(frame.func);
            if let Some(c) = frame.closure {
                self.heap.mark(c);
            }
            if let Some(g) = frame.generator {
                self.heap.mark(g);
            }
        }
        for &u in &self.open_upvalues {
            self.heap.mark(u);
        }
        for (&name, &module) in &self.modules {
            self.heap.mark(name);
            self.heap.mark(module);
        }
        let b = self.builtins;
        self.heap.mark(b.object);
        self.heap.mark(b.class_cls);
        for c in [
            b.number, b.boolean, b.null_cls, b.string, b.function, b.module_cls, b.list, b.tuple,
            b.table, b.stacktrace, b.generator, b.exception,
        ]
        .into_iter()
        .flatten()
        {
            self.heap.mark(c);
        }
        let names = self.names;
        names.each(|r| self.heap.mark(r));
        self.heap.mark(self.empty_tuple);
        if let Some(m) = self.core_module {
            self.heap.mark(m);
        }
        if let Some(e) = self.current_exception {
            self.heap.mark_value(e);
        }
        self.heap.mark_value(self.last_import);
        self.heap.collect();
    }

    /// Allocate with a collection check first; the body's references must
    /// already be rooted.
    pub(crate) fn alloc(&mut self, class: Option<GcRef>, body: ObjBody) -> GcRef {
        self.maybe_collect();
        self.heap.alloc(class, body)
    }

    // ---------------------------------------------------------- classes --

    /// The class of any value. Primitives map to the core classes;
    /// `None` only during bootstrap.
    pub(crate) fn class_of(&self, v: Value) -> Option<GcRef> {
        match v {
            Value::Num(_) => self.builtins.number,
            Value::Bool(_) => self.builtins.boolean,
            Value::Null | Value::Handle(_) => self.builtins.null_cls,
            Value::Obj(r) => self.heap.class_of(r),
        }
    }

    pub(crate) fn is_instance(&self, v: Value, class: GcRef) -> bool {
        let mut cur = self.class_of(v);
        while let Some(c) = cur {
            if c == class {
                return true;
            }
            cur = self.heap.class(c).super_class;
        }
        false
    }

    pub(crate) fn lookup_method(&self, class: GcRef, name: GcRef) -> Option<Value> {
        self.heap.class(class).methods.get(&name).copied()
    }

    pub(crate) fn method_on(&self, v: Value, name: GcRef) -> Option<Value> {
        self.class_of(v).and_then(|c| self.lookup_method(c, name))
    }

    pub(crate) fn type_name_of(&self, v: Value) -> &'static str {
        match v {
            Value::Num(_) => "Number",
            Value::Bool(_) => "Boolean",
            Value::Null => "Null",
            Value::Handle(_) => "Handle",
            Value::Obj(r) => self.heap.get(r).type_name(),
        }
    }

    // ------------------------------------------------------- exceptions --

    /// Build an exception instance of a core class. Falls back to a bare
    /// string value if the class hierarchy is not available yet.
    pub(crate) fn make_exc(&mut self, class_name: &str, msg: &str) -> Value {
        self.heap.disable();
        let built = (|| {
            let cls = self.core_global_named(class_name)?.as_obj()?;
            if !matches!(self.heap.get(cls), ObjBody::Class(_)) {
                return None;
            }
            let inst = self.heap.alloc(Some(cls), ObjBody::Instance(ObjInstance { fields: Vec::new() }));
            let msg_ref = self.heap.new_string(msg.to_string());
            self.set_field_raw(inst, self.names.err, Value::Obj(msg_ref));
            Some(Value::Obj(inst))
        })();
        self.heap.enable();
        built.unwrap_or_else(|| Value::Obj(self.heap.new_string(msg.to_string())))
    }

    pub(crate) fn type_exc(&mut self, msg: impl AsRef<str>) -> Raised {
        Raised(self.make_exc("TypeException", msg.as_ref()))
    }

    pub(crate) fn name_exc(&mut self, msg: impl AsRef<str>) -> Raised {
        Raised(self.make_exc("NameException", msg.as_ref()))
    }

    pub(crate) fn index_exc(&mut self, msg: impl AsRef<str>) -> Raised {
        Raised(self.make_exc("IndexOutOfBoundException", msg.as_ref()))
    }

    pub(crate) fn arg_exc(&mut self, msg: impl AsRef<str>) -> Raised {
        Raised(self.make_exc("InvalidArgException", msg.as_ref()))
    }

    pub(crate) fn import_exc(&mut self, msg: impl AsRef<str>) -> Raised {
        Raised(self.make_exc("ImportException", msg.as_ref()))
    }

    pub(crate) fn stop_iteration_exc(&mut self) -> Raised {
        Raised(self.make_exc("StopIteration", "iteration ended"))
    }

    fn stack_overflow_exc(&mut self) -> Raised {
        Raised(self.make_exc("StackOverflowException", "stack overflow"))
    }

    fn recursion_exc(&mut self) -> Raised {
        Raised(self.make_exc("RecursionException", "max reentrant call depth exceeded"))
    }

    // ---------------------------------------------------------- globals --

    /// Look up a core-module global by Rust-side name, without interning.
    pub(crate) fn core_global_named(&self, name: &str) -> Option<Value> {
        let core = self.core_module?;
        let m = self.heap.module(core);
        for (key, slot) in m.global_names.iter() {
            if self.heap.str_bytes(key) == name {
                return Some(m.globals[slot as usize]);
            }
        }
        None
    }

    pub(crate) fn module_global(&self, module: GcRef, name: GcRef) -> Option<(u32, Value)> {
        let hash = self.heap.str_hash(name);
        let m = self.heap.module(module);
        let slot = m.global_names.get(name, hash)?;
        Some((slot as u32, m.globals[slot as usize]))
    }

    pub(crate) fn define_global(&mut self, module: GcRef, name: GcRef, v: Value) {
        let hash = self.heap.str_hash(name);
        let m = self.heap.module_mut(module);
        match m.global_names.get(name, hash) {
            Some(slot) => m.globals[slot as usize] = v,
            None => {
                let slot = m.globals.len() as i32;
                m.globals.push(v);
                m.global_names.put(name, hash, slot);
            }
        }
    }

    // ----------------------------------------------------------- fields --

    /// Write a field through the class field index, growing the index and
    /// the instance storage on first use of the name.
    pub(crate) fn set_field_raw(&mut self, inst: GcRef, name: GcRef, v: Value) {
        let class = self.heap.class_of(inst).expect("instance without class");
        let hash = self.heap.str_hash(name);
        let offset = {
            let c = self.heap.class_mut(class);
            match c.fields.get(name, hash) {
                Some(off) => off as usize,
                None => {
                    let off = c.field_count;
                    c.field_count += 1;
                    c.fields.put(name, hash, off as i32);
                    off as usize
                }
            }
        };
        let i = self.heap.instance_mut(inst);
        if i.fields.len() <= offset {
            i.fields.resize(offset + 1, Value::Null);
        }
        i.fields[offset] = v;
    }

    pub(crate) fn get_field_raw(&self, inst: GcRef, name: GcRef) -> Option<Value> {
        let class = self.heap.class_of(inst)?;
        let hash = self.heap.str_hash(name);
        let offset = self.heap.class(class).fields.get(name, hash)? as usize;
        Some(self.heap.instance(inst).fields.get(offset).copied().unwrap_or(Value::Null))
    }

    // ---------------------------------------------------------- calling --

    /// Call `callee` (already on the stack at `callee_pos`, its arguments
    /// above it). Either pushes a frame or completes inline leaving the
    /// result where the callee was.
    pub(crate) fn call_value_at(&mut self, callee_pos: usize, argc: usize) -> Result<CallFlow, Raised> {
        let callee = self.stack[callee_pos];
        let Some(r) = callee.as_obj() else {
            let t = self.type_name_of(callee);
            return Err(self.type_exc(format!("{} is not callable", t)));
        };
        match self.heap.get(r) {
            ObjBody::Closure(_) => self.call_closure(r, callee_pos, argc),
            ObjBody::Native(_) => {
                self.call_native(r, callee_pos, argc)?;
                Ok(CallFlow::Done)
            }
            ObjBody::Class(_) => self.call_class(r, callee_pos, argc),
            ObjBody::BoundMethod(bm) => {
                let (receiver, method) = (bm.receiver, bm.method);
                self.stack[callee_pos] = receiver;
                self.call_method_obj(method, callee_pos, argc)
            }
            other => {
                let t = other.type_name();
                Err(self.type_exc(format!("{} is not callable", t)))
            }
        }
    }

    /// Dispatch a method object (closure or native) on the window whose
    /// slot 0 holds the receiver.
    pub(crate) fn call_method_obj(
        &mut self,
        method: GcRef,
        base: usize,
        argc: usize,
    ) -> Result<CallFlow, Raised> {
        match self.heap.get(method) {
            ObjBody::Closure(_) => self.call_closure(method, base, argc),
            ObjBody::Native(_) => {
                self.call_native(method, base, argc)?;
                Ok(CallFlow::Done)
            }
            other => {
                let t = other.type_name();
                Err(self.type_exc(format!("{} is not callable", t)))
            }
        }
    }

    fn call_closure(&mut self, closure: GcRef, base: usize, argc: usize) -> Result<CallFlow, Raised> {
        let func_ref = self.heap.closure(closure).func;
        let (proto, defaults) = {
            let f = self.heap.func(func_ref);
            (Rc::clone(&f.proto), f.defaults.clone())
        };
        let name = proto.name.clone().unwrap_or_else(|| "<anonymous>".to_string());
        self.fix_args(base, argc, proto.arity as usize, proto.vararg, &defaults, &name)?;

        if proto.is_generator {
            // Calling a generator function does not run it: capture the
            // fixed-up window as the initial frame image.
            self.maybe_collect();
            let window = self.stack.split_off(base);
            let gen = self.heap.alloc(
                self.builtins.generator,
                ObjBody::Generator(ObjGenerator {
                    state: GenState::Started,
                    closure,
                    ip: 0,
                    stack: window,
                    handlers: Vec::new(),
                    last_yield: Value::Null,
                }),
            );
            self.push(Value::Obj(gen));
            return Ok(CallFlow::Done);
        }

        if self.frames.len() >= self.options.max_frames {
            return Err(self.stack_overflow_exc());
        }
        if base + proto.max_stack as usize + 8 > self.options.max_stack {
            return Err(self.stack_overflow_exc());
        }
        self.frames.push(Frame {
            func: func_ref,
            closure: Some(closure),
            proto,
            ip: 0,
            base,
            handlers: Vec::new(),
            generator: None,
        });
        Ok(CallFlow::Frame)
    }

    fn call_native(&mut self, native: GcRef, base: usize, argc: usize) -> Result<(), Raised> {
        let (func, arity, vararg, defaults, name) = {
            let n = match self.heap.get(native) {
                ObjBody::Native(n) => n,
                other => {
                    let t = other.type_name();
                    return Err(self.type_exc(format!("{} is not callable", t)));
                }
            };
            (n.func, n.arity as usize, n.vararg, n.defaults.clone(), n.name.clone())
        };
        let func = match func {
            Some(f) => f,
            None => self.resolve_native(native)?,
        };
        self.fix_args(base, argc, arity, vararg, &defaults, &name)?;
        let fixed_argc = arity + usize::from(vararg);

        if self.reentrancy >= self.options.max_reentrancy {
            return Err(self.recursion_exc());
        }
        self.reentrancy += 1;
        let result = func(self, base, fixed_argc);
        self.reentrancy -= 1;
        let v = result?;
        self.stack.truncate(base);
        self.push(v);
        Ok(())
    }

    /// Resolve a `native` declaration against its module's registry under
    /// its mangled name ("Class.method" or a bare function name).
    fn resolve_native(&mut self, native: GcRef) -> Result<NativeFn, Raised> {
        let (module, name) = {
            let n = match self.heap.get(native) {
                ObjBody::Native(n) => n,
                _ => unreachable!("resolve_native on non-native"),
            };
            (n.module, n.name.clone())
        };
        let registry = self.heap.module(module).registry.clone();
        let resolved = registry.and_then(|reg| match name.split_once('.') {
            Some((class, method)) => reg.lookup(Some(class), method),
            None => reg.lookup(None, &name),
        });
        match resolved {
            Some(f) => {
                if let ObjBody::Native(n) = self.heap.get_mut(native) {
                    n.func = Some(f);
                }
                Ok(f)
            }
            None => {
                let mname = self.heap.str_bytes(self.heap.module(module).name).to_string();
                Err(self.name_exc(format!(
                    "no native implementation for '{}' in module '{}'",
                    name, mname
                )))
            }
        }
    }

    fn call_class(&mut self, class: GcRef, base: usize, argc: usize) -> Result<CallFlow, Raised> {
        self.maybe_collect();
        let inst = self.heap.alloc(Some(class), ObjBody::Instance(ObjInstance { fields: Vec::new() }));
        let ctor = self.lookup_method(class, self.names.ctor);
        // The receiver replaces the class in slot 0; the class stays
        // reachable through the instance header.
        self.stack[base] = Value::Obj(inst);
        match ctor {
            Some(m) => {
                let mr = m.as_obj().expect("method is an object");
                self.call_method_obj(mr, base, argc)
            }
            None => {
                if argc != 0 {
                    let cname = self.heap.str_bytes(self.heap.class(class).name).to_string();
                    return Err(self.type_exc(format!(
                        "{}() takes no arguments without a constructor",
                        cname
                    )));
                }
                Ok(CallFlow::Done)
            }
        }
    }

    /// Method invocation by name on the receiver at `base`.
    fn invoke_at(&mut self, name: GcRef, base: usize, argc: usize) -> Result<CallFlow, Raised> {
        let receiver = self.stack[base];
        if let Value::Obj(r) = receiver {
            match self.heap.get(r) {
                ObjBody::Instance(_) => {
                    // Fields shadow methods: a field holding a callable is
                    // called as a plain value, without the receiver.
                    if let Some(fv) = self.get_field_raw(r, name) {
                        self.stack[base] = fv;
                        return self.call_value_at(base, argc);
                    }
                    let class = self.heap.class_of(r).expect("instance without class");
                    if let Some(m) = self.lookup_method(class, name) {
                        let mr = m.as_obj().expect("method is an object");
                        return self.call_method_obj(mr, base, argc);
                    }
                    let n = self.heap.str_bytes(name).to_string();
                    let t = self.type_name_of(receiver);
                    return Err(self.name_exc(format!("no method '{}' on {}", n, t)));
                }
                ObjBody::Module(_) => {
                    if let Some((_, v)) = self.module_global(r, name) {
                        self.stack[base] = v;
                        return self.call_value_at(base, argc);
                    }
                    let n = self.heap.str_bytes(name).to_string();
                    return Err(self.name_exc(format!("module has no member '{}'", n)));
                }
                _ => {}
            }
        }
        match self.method_on(receiver, name) {
            Some(m) => {
                let mr = m.as_obj().expect("method is an object");
                self.call_method_obj(mr, base, argc)
            }
            None => {
                let n = self.heap.str_bytes(name).to_string();
                let t = self.type_name_of(receiver);
                Err(self.type_exc(format!("no method '{}' on {}", n, t)))
            }
        }
    }

    fn super_invoke_at(&mut self, name: GcRef, base: usize, argc: usize) -> Result<CallFlow, Raised> {
        let func = self.frames.last().expect("active frame").func;
        let sup = match self.heap.func(func).super_class {
            Some(s) => s,
            None => return Err(self.type_exc("'super' outside of a subclass method")),
        };
        match self.lookup_method(sup, name) {
            Some(m) => {
                let mr = m.as_obj().expect("method is an object");
                self.call_method_obj(mr, base, argc)
            }
            None => {
                let n = self.heap.str_bytes(name).to_string();
                Err(self.name_exc(format!("no method '{}' on superclass", n)))
            }
        }
    }

    /// Fill defaults, check arity, and collect vararg extras into a tuple
    /// so the window holds exactly the declared parameter slots.
    fn fix_args(
        &mut self,
        base: usize,
        argc: usize,
        arity: usize,
        vararg: bool,
        defaults: &[Value],
        name: &str,
    ) -> Result<(), Raised> {
        let required = arity.saturating_sub(defaults.len());
        if argc < required {
            return Err(self.type_exc(format!(
                "{}() expects at least {} arguments, got {}",
                name, required, argc
            )));
        }
        if argc > arity && !vararg {
            return Err(self.type_exc(format!(
                "{}() expects at most {} arguments, got {}",
                name, arity, argc
            )));
        }
        if argc < arity {
            for i in argc..arity {
                let v = defaults[i - (arity - defaults.len())];
                self.push(v);
            }
        }
        if vararg {
            let extra_start = base + 1 + arity;
            self.maybe_collect();
            let extras: Vec<Value> = if self.stack.len() > extra_start {
                self.stack.split_off(extra_start)
            } else {
                Vec::new()
            };
            let tuple = if extras.is_empty() {
                self.empty_tuple
            } else {
                self.heap.alloc(self.builtins.tuple, ObjBody::Tuple(extras.into_boxed_slice()))
            };
            self.push(Value::Obj(tuple));
        }
        Ok(())
    }

    /// Call a callable value with explicit arguments and run it to
    /// completion, returning the result. This is the reentrant entry used
    /// by natives, operator dispatch and the embedding API.
    pub fn call_function(&mut self, callee: Value, args: &[Value]) -> Result<Value, Raised> {
        let base = self.sp();
        self.push(callee);
        for &a in args {
            self.push(a);
        }
        let entry = self.frames.len();
        let flow = self.call_value_at(base, args.len())?;
        self.finish_reentrant(flow, entry)
    }

    /// Call a method value with an explicit receiver, reentrantly.
    pub(crate) fn call_with_receiver(
        &mut self,
        method: Value,
        receiver: Value,
        args: &[Value],
    ) -> Result<Value, Raised> {
        let base = self.sp();
        self.push(receiver);
        for &a in args {
            self.push(a);
        }
        let entry = self.frames.len();
        let mr = match method.as_obj() {
            Some(r) => r,
            None => {
                let t = self.type_name_of(method);
                return Err(self.type_exc(format!("{} is not callable", t)));
            }
        };
        let flow = self.call_method_obj(mr, base, args.len())?;
        self.finish_reentrant(flow, entry)
    }

    /// Invoke a method by name on a receiver, reentrantly.
    pub fn invoke_method(
        &mut self,
        receiver: Value,
        name: GcRef,
        args: &[Value],
    ) -> Result<Value, Raised> {
        let base = self.sp();
        self.push(receiver);
        for &a in args {
            self.push(a);
        }
        let entry = self.frames.len();
        let flow = self.invoke_at(name, base, args.len())?;
        self.finish_reentrant(flow, entry)
    }

    fn finish_reentrant(&mut self, flow: CallFlow, entry: usize) -> Result<Value, Raised> {
        match flow {
            CallFlow::Done => Ok(self.pop()),
            CallFlow::Frame => {
                if self.reentrancy >= self.options.max_reentrancy {
                    // Unwind the frame we just pushed before raising.
                    let frame = self.frames.pop().expect("frame just pushed");
                    self.stack.truncate(frame.base);
                    return Err(self.recursion_exc());
                }
                self.reentrancy += 1;
                let r = self.run(entry);
                self.reentrancy -= 1;
                r?;
                Ok(self.pop())
            }
        }
    }

    // ------------------------------------------------------- generators --

    /// Resume a suspended generator, delivering `send` as the value of the
    /// pending `yield`. Returns the next yielded value or the generator's
    /// return value; inspect the state afterwards to tell which.
    pub(crate) fn resume_generator(&mut self, g: GcRef, send: Value) -> Result<Value, Raised> {
        let state = self.heap.generator_mut(g).state;
        match state {
            GenState::Done => return Err(self.stop_iteration_exc()),
            GenState::Running => {
                return Err(self.type_exc("generator is already running"));
            }
            GenState::Started | GenState::Suspended => {}
        }
        if self.frames.len() >= self.options.max_frames {
            return Err(self.stack_overflow_exc());
        }

        let base = self.sp();
        let (closure, ip, window, handlers) = {
            let gen = self.heap.generator_mut(g);
            gen.state = GenState::Running;
            (
                gen.closure,
                gen.ip,
                std::mem::take(&mut gen.stack),
                std::mem::take(&mut gen.handlers),
            )
        };
        self.stack.extend(window);
        if state == GenState::Suspended {
            // The sent value lands on top of the restored stack: it is
            // what the suspended `yield` expression evaluates to.
            self.push(send);
        }
        let func_ref = self.heap.closure(closure).func;
        let proto = Rc::clone(&self.heap.func(func_ref).proto);
        let handlers = handlers
            .into_iter()
            .map(|h| Handler { sp: h.sp + base, ..h })
            .collect();
        self.frames.push(Frame {
            func: func_ref,
            closure: Some(closure),
            proto,
            ip,
            base,
            handlers,
            generator: Some(g),
        });

        let entry = self.frames.len() - 1;
        if self.reentrancy >= self.options.max_reentrancy {
            let frame = self.frames.pop().expect("frame just pushed");
            self.stack.truncate(frame.base);
            self.heap.generator_mut(g).state = GenState::Done;
            return Err(self.recursion_exc());
        }
        self.reentrancy += 1;
        let r = self.run(entry);
        self.reentrancy -= 1;
        r?;
        Ok(self.pop())
    }

    // ---------------------------------------------------------- upvalues --

    fn capture_upvalue(&mut self, slot: usize) -> GcRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, &u) in self.open_upvalues.iter().enumerate() {
            let s = match self.heap.upvalue(u) {
                ObjUpvalue::Open(s) => *s,
                ObjUpvalue::Closed(_) => unreachable!("closed upvalue in open list"),
            };
            if s == slot {
                return u;
            }
            if s < slot {
                insert_at = i;
                break;
            }
        }
        let u = self.alloc(None, ObjBody::Upvalue(ObjUpvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, u);
        u
    }

    /// Close every open upvalue whose slot is at or above `from`: a prefix
    /// of the descending-sorted list.
    fn close_upvalues(&mut self, from: usize) {
        let mut n = 0;
        for &u in &self.open_upvalues {
            let s = match self.heap.upvalue(u) {
                ObjUpvalue::Open(s) => *s,
                ObjUpvalue::Closed(_) => unreachable!("closed upvalue in open list"),
            };
            if s < from {
                break;
            }
            n += 1;
        }
        for u in self.open_upvalues.drain(..n) {
            let v = match self.heap.upvalue(u) {
                ObjUpvalue::Open(s) => self.stack[*s],
                ObjUpvalue::Closed(_) => unreachable!(),
            };
            *self.heap.upvalue_mut(u) = ObjUpvalue::Closed(v);
        }
    }

    // -------------------------------------------------------- operators --

    fn dispatch_binary(
        &mut self,
        a: Value,
        b: Value,
        name: GcRef,
        rname: GcRef,
        opsym: &str,
    ) -> Result<Value, Raised> {
        if let Some(m) = self.method_on(a, name) {
            return self.call_with_receiver(m, a, &[b]);
        }
        if let Some(m) = self.method_on(b, rname) {
            return self.call_with_receiver(m, b, &[a]);
        }
        let (ta, tb) = (self.type_name_of(a), self.type_name_of(b));
        Err(self.type_exc(format!("unsupported operands for '{}': {} and {}", opsym, ta, tb)))
    }

    /// Structural equality with `__eq__` dispatch for heap values.
    pub(crate) fn values_equal(&mut self, a: Value, b: Value) -> Result<bool, Raised> {
        if !a.is_obj() && !b.is_obj() {
            return Ok(a.raw_eq(b));
        }
        let (recv, other) = if a.is_obj() { (a, b) } else { (b, a) };
        match self.method_on(recv, self.names.eq) {
            Some(m) => {
                let r = self.call_with_receiver(m, recv, &[other])?;
                Ok(r.is_truthy())
            }
            None => Ok(a.raw_eq(b)),
        }
    }

    /// Hash for table keys. NaN is rejected; `-0.0` hashes as `0.0`;
    /// strings hash by content; tuples structurally; anything else
    /// dispatches `__hash__` (identity by default via `Object`).
    pub(crate) fn hash_value(&mut self, v: Value) -> Result<u32, Raised> {
        match v {
            Value::Null => Ok(0x9E37_79B9),
            Value::Bool(b) => Ok(if b { 0x0051_2DE3 } else { 0x0077_60D1 }),
            Value::Num(n) => {
                if n.is_nan() {
                    return Err(self.type_exc("NaN cannot be used as a table key"));
                }
                Ok(hash_num(n))
            }
            Value::Handle(p) => Ok(hash_num(p as usize as f64)),
            Value::Obj(r) => match self.heap.get(r) {
                ObjBody::Str(s) => Ok(s.hash),
                ObjBody::Tuple(t) => {
                    let items: Vec<Value> = t.to_vec();
                    let mut h: u32 = 2166136261;
                    for item in items {
                        let ih = self.hash_value(item)?;
                        h = (h ^ ih).wrapping_mul(16777619);
                    }
                    Ok(h)
                }
                _ => match self.method_on(v, self.names.hash) {
                    Some(m) => {
                        let r = self.call_with_receiver(m, v, &[])?;
                        match r {
                            Value::Num(n) => Ok(hash_num(n)),
                            other => {
                                let t = self.type_name_of(other);
                                Err(self.type_exc(format!("__hash__ must return a number, got {}", t)))
                            }
                        }
                    }
                    None => {
                        let t = self.type_name_of(v);
                        Err(self.type_exc(format!("unhashable type {}", t)))
                    }
                },
            },
        }
    }

    // ----------------------------------------------------------- tables --

    pub(crate) fn table_find(
        &mut self,
        table: GcRef,
        key: Value,
    ) -> Result<Option<usize>, Raised> {
        let hash = self.hash_value(key)?;
        let candidates = match self.heap.get(table) {
            ObjBody::Table(t) => {
                if t.capacity() == 0 {
                    return Ok(None);
                }
                t.probe(hash).candidates
            }
            other => {
                let t = other.type_name();
                return Err(self.type_exc(format!("expected Table, got {}", t)));
            }
        };
        for (idx, k) in candidates {
            if self.values_equal(key, k)? {
                return Ok(Some(idx));
            }
        }
        Ok(None)
    }

    pub(crate) fn table_get(&mut self, table: GcRef, key: Value) -> Result<Value, Raised> {
        match self.table_find(table, key)? {
            Some(idx) => match self.heap.get(table) {
                ObjBody::Table(t) => Ok(t.value_at(idx)),
                _ => unreachable!(),
            },
            None => Ok(Value::Null),
        }
    }

    pub(crate) fn table_set(&mut self, table: GcRef, key: Value, value: Value) -> Result<(), Raised> {
        let hash = self.hash_value(key)?;
        if let ObjBody::Table(t) = self.heap.get_mut(table) {
            t.ensure_capacity();
        }
        let candidates = match self.heap.get(table) {
            ObjBody::Table(t) => t.probe(hash),
            _ => {
                let t = self.type_name_of(Value::Obj(table));
                return Err(self.type_exc(format!("expected Table, got {}", t)));
            }
        };
        for (idx, k) in candidates.candidates {
            if self.values_equal(key, k)? {
                if let ObjBody::Table(t) = self.heap.get_mut(table) {
                    t.set_value_at(idx, value);
                }
                return Ok(());
            }
        }
        let insert_slot = candidates.insert_slot;
        if let ObjBody::Table(t) = self.heap.get_mut(table) {
            t.insert_at(insert_slot, hash, key, value);
        }
        self.heap.account_growth(3 * std::mem::size_of::<Value>());
        Ok(())
    }

    /// Copy every entry of `src` into `dst`, overwriting equal keys.
    /// Entry-by-entry through `table_set`, since key equality can dispatch.
    pub(crate) fn table_merge(&mut self, dst: GcRef, src: GcRef) -> Result<(), Raised> {
        let entries: Vec<(Value, Value)> = match self.heap.get(src) {
            ObjBody::Table(t) => t.iter().map(|(_, k, v)| (k, v)).collect(),
            other => {
                let t = other.type_name();
                return Err(self.type_exc(format!("expected Table, got {}", t)));
            }
        };
        for (k, v) in entries {
            self.table_set(dst, k, v)?;
        }
        Ok(())
    }

    pub(crate) fn table_delete(&mut self, table: GcRef, key: Value) -> Result<bool, Raised> {
        match self.table_find(table, key)? {
            Some(idx) => {
                if let ObjBody::Table(t) = self.heap.get_mut(table) {
                    t.remove_at(idx);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ------------------------------------------------------- evaluation --

    /// Compile and run `source` as the `__main__` module.
    pub fn evaluate(&mut self, path: &str, source: &str) -> Result<(), ErrorKind> {
        self.evaluate_module("__main__", path, source)
    }

    /// Compile and run `source` as a named module.
    pub fn evaluate_module(&mut self, name: &str, path: &str, source: &str) -> Result<(), ErrorKind> {
        let proto = match crate::import::compile_source(self, name, path, source) {
            Ok(p) => p,
            Err(kind) => return Err(kind),
        };
        self.run_proto_as_module(name, path, &proto)
    }

    /// Deserialize and run compiled bytecode as a named module.
    pub fn evaluate_bytecode(&mut self, name: &str, path: &str, bytes: &[u8]) -> Result<(), ErrorKind> {
        let proto = match brio_core::deserialize(bytes) {
            Ok(p) => p,
            Err(e) => {
                let kind = if e.is_version() { ErrorKind::Version } else { ErrorKind::Deserialize };
                (self.error_cb)(kind, Some(path), 0, &e.to_string());
                return Err(kind);
            }
        };
        self.run_proto_as_module(name, path, &proto)
    }

    pub(crate) fn run_proto_as_module(
        &mut self,
        name: &str,
        path: &str,
        proto: &FuncProto,
    ) -> Result<(), ErrorKind> {
        let module = crate::import::create_module(self, name, path);
        match self.run_module_body(module, proto) {
            Ok(_) => Ok(()),
            Err(Raised(exc)) => {
                self.current_exception = Some(exc);
                let rendered = self.render_exception(exc);
                (self.error_cb)(ErrorKind::Runtime, Some(path), 0, &rendered);
                Err(ErrorKind::Runtime)
            }
        }
    }

    /// Instantiate `proto` into `module` and run it to completion.
    pub(crate) fn run_module_body(
        &mut self,
        module: GcRef,
        proto: &FuncProto,
    ) -> Result<Value, Raised> {
        let func = self.instantiate_function(proto, module);
        let closure = {
            self.heap.disable();
            let c = self.heap.alloc(
                self.builtins.function,
                ObjBody::Closure(ObjClosure { func, upvalues: Vec::new() }),
            );
            self.heap.enable();
            c
        };
        self.call_function(Value::Obj(closure), &[])
    }

    /// Turn a compiled prototype into a live function object: constants
    /// instantiated (strings interned, nested functions and natives
    /// created), caches allocated.
    pub(crate) fn instantiate_function(&mut self, proto: &FuncProto, module: GcRef) -> GcRef {
        self.heap.disable();
        let r = self.instantiate_inner(proto, module);
        self.heap.enable();
        r
    }

    fn instantiate_inner(&mut self, proto: &FuncProto, module: GcRef) -> GcRef {
        let mut consts = Vec::with_capacity(proto.code.consts.len());
        for c in &proto.code.consts {
            consts.push(self.instantiate_const(c, module));
        }
        let defaults: Vec<Value> =
            proto.defaults.iter().map(|c| self.instantiate_const(c, module)).collect();
        let caches = vec![Cache::Empty; proto.cache_count as usize];
        self.heap.alloc(
            self.builtins.function,
            ObjBody::Func(ObjFunc {
                proto: Rc::new(proto.clone()),
                module,
                consts,
                defaults,
                caches,
                super_class: None,
            }),
        )
    }

    fn instantiate_const(&mut self, c: &Const, module: GcRef) -> Value {
        match c {
            Const::Null | Const::Handle => Value::Null,
            Const::Bool(b) => Value::Bool(*b),
            Const::Num(n) => Value::Num(*n),
            Const::Str(s) => Value::Obj(self.heap.intern(s)),
            Const::Func(p) => Value::Obj(self.instantiate_inner(p, module)),
            Const::Native(p) => {
                let defaults: Vec<Value> =
                    p.defaults.iter().map(|d| self.instantiate_const(d, module)).collect();
                Value::Obj(self.heap.alloc(
                    self.builtins.function,
                    ObjBody::Native(ObjNative {
                        name: p.name.clone(),
                        arity: p.arity,
                        vararg: p.vararg,
                        defaults,
                        module,
                        func: None,
                    }),
                ))
            }
        }
    }

    // ------------------------------------------------------ stack trace --

    /// Render an escaped exception with its stack trace, oldest frame
    /// first.
    pub fn render_exception(&mut self, exc: Value) -> String {
        let mut out = String::new();
        if let Some(st) = self.exception_trace(exc) {
            if let ObjBody::StackTrace(trace) = self.heap.get(st) {
                if !trace.records.is_empty() {
                    out.push_str("Traceback (most recent call last):\n");
                    for rec in trace.records.iter().rev() {
                        out.push_str(&format!(
                            "    [line {}] module {}, in {}\n",
                            rec.line, rec.module, rec.function
                        ));
                    }
                }
            }
        }
        out.push_str(&self.exception_message(exc));
        out
    }

    /// "ClassName: message" for an exception value.
    pub fn exception_message(&mut self, exc: Value) -> String {
        match exc {
            Value::Obj(r) if matches!(self.heap.get(r), ObjBody::Instance(_)) => {
                let cname = self
                    .heap
                    .class_of(r)
                    .map(|c| self.heap.str_bytes(self.heap.class(c).name).to_string())
                    .unwrap_or_else(|| "Exception".to_string());
                let msg = match self.get_field_raw(r, self.names.err) {
                    Some(Value::Obj(s)) if matches!(self.heap.get(s), ObjBody::Str(_)) => {
                        self.heap.str_bytes(s).to_string()
                    }
                    _ => String::new(),
                };
                if msg.is_empty() {
                    cname
                } else {
                    format!("{}: {}", cname, msg)
                }
            }
            Value::Obj(r) if matches!(self.heap.get(r), ObjBody::Str(_)) => {
                self.heap.str_bytes(r).to_string()
            }
            other => format!("exception of type {}", self.type_name_of(other)),
        }
    }

    fn exception_trace(&mut self, exc: Value) -> Option<GcRef> {
        let r = exc.as_obj()?;
        if !matches!(self.heap.get(r), ObjBody::Instance(_)) {
            return None;
        }
        match self.get_field_raw(r, self.names.stacktrace) {
            Some(Value::Obj(st)) if matches!(self.heap.get(st), ObjBody::StackTrace(_)) => Some(st),
            _ => {
                self.heap.disable();
                let st = self.heap.alloc(
                    self.builtins.stacktrace,
                    ObjBody::StackTrace(ObjStackTrace { records: Vec::new(), last_traced: -1 }),
                );
                self.set_field_raw(r, self.names.stacktrace, Value::Obj(st));
                self.heap.enable();
                Some(st)
            }
        }
    }

    /// Append a trace record for the current top frame, suppressing the
    /// duplicate when a handler re-raises at the same depth.
    fn record_frame_trace(&mut self, exc: Value) {
        let Some(st) = self.exception_trace(exc) else { return };
        let depth = self.frames.len() as i64;
        let (line, function, module_name) = {
            let frame = self.frames.last().expect("active frame");
            let line = frame.proto.code.line_at(frame.ip.saturating_sub(1));
            let function = frame
                .proto
                .name
                .clone()
                .unwrap_or_else(|| "<anonymous>".to_string());
            let module = self.heap.func(frame.func).module;
            let module_name = self.heap.str_bytes(self.heap.module(module).name).to_string();
            (line, function, module_name)
        };
        if let ObjBody::StackTrace(trace) = self.heap.get_mut(st) {
            if trace.last_traced == depth {
                return;
            }
            trace.last_traced = depth;
            trace.records.push(TraceRecord { line, module: module_name, function });
        }
    }

    // -------------------------------------------------------- unwinding --

    /// Walk frames newest-first for a handler; pop handlerless frames.
    /// `Err` means the exception escaped past `entry_depth`.
    fn unwind(&mut self, exc: Value, entry_depth: usize) -> Result<(), Raised> {
        // Non-exception values can only appear before the core classes
        // exist; let them escape with no trace.
        let traceable = exc
            .as_obj()
            .is_some_and(|r| matches!(self.heap.get(r), ObjBody::Instance(_)));
        loop {
            if traceable {
                self.record_frame_trace(exc);
            }
            let frame = self.frames.last_mut().expect("unwind without frames");
            if let Some(h) = frame.handlers.pop() {
                frame.ip = h.target;
                let sp = h.sp;
                // The discarded window may hold locals captured by
                // closures; hoist them before it goes away.
                self.close_upvalues(sp);
                match h.kind {
                    HandlerKind::Except => {
                        self.stack.truncate(sp);
                        self.push(exc);
                    }
                    HandlerKind::Ensure => {
                        self.stack.truncate(sp);
                        self.push(Value::Null);
                        self.push(exc);
                    }
                }
                return Ok(());
            }
            let frame = self.frames.pop().expect("unwind without frames");
            self.close_upvalues(frame.base);
            if let Some(g) = frame.generator {
                self.heap.generator_mut(g).state = GenState::Done;
            }
            self.stack.truncate(frame.base);
            if self.frames.len() == entry_depth {
                self.current_exception = Some(exc);
                return Err(Raised(exc));
            }
        }
    }

    /// Pop the current frame normally, placing `ret` where the callee was.
    fn do_return(&mut self, ret: Value) {
        let frame = self.frames.pop().expect("return without frame");
        self.close_upvalues(frame.base);
        if let Some(g) = frame.generator {
            self.heap.generator_mut(g).state = GenState::Done;
        }
        self.stack.truncate(frame.base);
        self.push(ret);
    }

    /// Route a return through the innermost `ensure` handler if one is
    /// active in the current frame, otherwise return normally.
    fn return_value(&mut self, ret: Value) {
        let frame = self.frames.last_mut().expect("active frame");
        if let Some(pos) = frame.handlers.iter().rposition(|h| h.kind == HandlerKind::Ensure) {
            let h = frame.handlers[pos];
            frame.handlers.truncate(pos);
            frame.ip = h.target;
            self.close_upvalues(h.sp);
            self.stack.truncate(h.sp);
            self.push(ret);
            self.push(Value::Num(1.0));
            return;
        }
        self.do_return(ret);
    }

    // --------------------------------------------------------- dispatch --

    /// Fetch helpers; out-of-range reads mean corrupt bytecode and raise.
    fn fetch_u8(&mut self) -> Result<u8, Raised> {
        let b = {
            let frame = self.frames.last_mut().expect("active frame");
            let b = frame.proto.code.bytes.get(frame.ip).copied();
            if b.is_some() {
                frame.ip += 1;
            }
            b
        };
        match b {
            Some(b) => Ok(b),
            None => Err(self.corrupt_exc()),
        }
    }

    fn fetch_u16(&mut self) -> Result<u16, Raised> {
        let a = self.fetch_u8()?;
        let b = self.fetch_u8()?;
        Ok(u16::from_be_bytes([a, b]))
    }

    fn fetch_i16(&mut self) -> Result<i16, Raised> {
        Ok(self.fetch_u16()? as i16)
    }

    fn corrupt_exc(&mut self) -> Raised {
        Raised(self.make_exc("Exception", "corrupt bytecode"))
    }

    fn frame_const(&mut self, idx: u16) -> Result<Value, Raised> {
        let func = self.frames.last().expect("active frame").func;
        let v = self.heap.func(func).consts.get(idx as usize).copied();
        match v {
            Some(v) => Ok(v),
            None => Err(self.corrupt_exc()),
        }
    }

    fn const_name(&mut self, idx: u16) -> Result<GcRef, Raised> {
        match self.frame_const(idx)? {
            Value::Obj(r) if matches!(self.heap.get(r), ObjBody::Str(_)) => Ok(r),
            _ => Err(self.corrupt_exc()),
        }
    }

    /// Run until the frame stack shrinks back to `entry_depth`.
    pub(crate) fn run(&mut self, entry_depth: usize) -> Result<(), Raised> {
        debug_assert!(self.frames.len() > entry_depth);
        loop {
            if self.eval_break.swap(false, Ordering::Relaxed) {
                let exc = self.make_exc("ProgramInterrupted", "execution interrupted");
                self.unwind(exc, entry_depth)?;
                continue;
            }
            match self.step() {
                Ok(()) => {
                    if self.frames.len() == entry_depth {
                        return Ok(());
                    }
                }
                Err(raised) => {
                    self.unwind(raised.0, entry_depth)?;
                }
            }
        }
    }

    /// Execute one instruction.
    fn step(&mut self) -> Result<(), Raised> {
        let byte = self.fetch_u8()?;
        let Some(op) = Opcode::from_byte(byte) else {
            return Err(self.corrupt_exc());
        };
        use Opcode::*;
        match op {
            // ---- arithmetic and comparison ----
            Add | Sub | Mul | Div | Mod | Pow => self.binary_arith(op),
            Gt | Ge | Lt | Le => self.binary_compare(op),
            Eq => {
                let b = self.pop();
                let a = self.pop();
                let eq = self.values_equal(a, b)?;
                self.push(Value::Bool(eq));
                Ok(())
            }
            Not => {
                let v = self.pop();
                self.push(Value::Bool(!v.is_truthy()));
                Ok(())
            }
            Neg => {
                let v = self.pop();
                match v {
                    Value::Num(n) => {
                        self.push(Value::Num(-n));
                        Ok(())
                    }
                    other => match self.method_on(other, self.names.neg) {
                        Some(m) => {
                            let r = self.call_with_receiver(m, other, &[])?;
                            self.push(r);
                            Ok(())
                        }
                        None => {
                            let t = self.type_name_of(other);
                            Err(self.type_exc(format!("cannot negate {}", t)))
                        }
                    },
                }
            }
            Is => {
                let b = self.pop();
                let a = self.pop();
                let class = match b.as_obj() {
                    Some(r) if matches!(self.heap.get(r), ObjBody::Class(_)) => r,
                    _ => {
                        let t = self.type_name_of(b);
                        return Err(self.type_exc(format!(
                            "right operand of 'is' must be a class, got {}",
                            t
                        )));
                    }
                };
                let result = self.is_instance(a, class);
                self.push(Value::Bool(result));
                Ok(())
            }

            // ---- stack management ----
            Pop => {
                self.pop();
                Ok(())
            }
            Dup => {
                let v = self.peek(0);
                self.push(v);
                Ok(())
            }
            PushNull => {
                self.push(Value::Null);
                Ok(())
            }
            GetConst => {
                let idx = self.fetch_u16()?;
                let v = self.frame_const(idx)?;
                self.push(v);
                Ok(())
            }
            Unpack => {
                let n = self.fetch_u8()? as usize;
                self.unpack(n)
            }
            NewList => {
                let list = self.alloc(self.builtins.list, ObjBody::List(Vec::new()));
                self.push(Value::Obj(list));
                Ok(())
            }
            AppendList => {
                let v = self.pop();
                let list = self.peek(0).as_obj().expect("list under append");
                if let ObjBody::List(l) = self.heap.get_mut(list) {
                    l.push(v);
                }
                self.heap.account_growth(std::mem::size_of::<Value>());
                Ok(())
            }
            NewTuple => {
                let n = self.fetch_u8()? as usize;
                if n == 0 {
                    let t = self.empty_tuple;
                    self.push(Value::Obj(t));
                    return Ok(());
                }
                self.maybe_collect();
                let items = self.stack.split_off(self.sp() - n);
                let t = self
                    .heap
                    .alloc(self.builtins.tuple, ObjBody::Tuple(items.into_boxed_slice()));
                self.push(Value::Obj(t));
                Ok(())
            }
            NewTable => {
                let t = self.alloc(self.builtins.table, ObjBody::Table(Default::default()));
                self.push(Value::Obj(t));
                Ok(())
            }

            // ---- variables ----
            GetLocal => {
                let slot = self.fetch_u8()? as usize;
                let base = self.frames.last().expect("active frame").base;
                let v = self.stack[base + slot];
                self.push(v);
                Ok(())
            }
            SetLocal => {
                let slot = self.fetch_u8()? as usize;
                let base = self.frames.last().expect("active frame").base;
                let v = self.pop();
                self.stack[base + slot] = v;
                Ok(())
            }
            GetUpvalue => {
                let idx = self.fetch_u8()? as usize;
                let closure = self
                    .frames
                    .last()
                    .expect("active frame")
                    .closure
                    .expect("upvalue access without closure");
                let u = self.heap.closure(closure).upvalues[idx];
                let v = match self.heap.upvalue(u) {
                    ObjUpvalue::Open(slot) => self.stack[*slot],
                    ObjUpvalue::Closed(v) => *v,
                };
                self.push(v);
                Ok(())
            }
            SetUpvalue => {
                let idx = self.fetch_u8()? as usize;
                let v = self.pop();
                let closure = self
                    .frames
                    .last()
                    .expect("active frame")
                    .closure
                    .expect("upvalue access without closure");
                let u = self.heap.closure(closure).upvalues[idx];
                match self.heap.upvalue(u) {
                    ObjUpvalue::Open(slot) => {
                        let slot = *slot;
                        self.stack[slot] = v;
                    }
                    ObjUpvalue::Closed(_) => *self.heap.upvalue_mut(u) = ObjUpvalue::Closed(v),
                }
                Ok(())
            }
            GetGlobal => {
                let name_idx = self.fetch_u16()?;
                let cache_idx = self.fetch_u16()?;
                let v = self.get_global_cached(name_idx, cache_idx)?;
                self.push(v);
                Ok(())
            }
            SetGlobal => {
                let name_idx = self.fetch_u16()?;
                let cache_idx = self.fetch_u16()?;
                let v = self.pop();
                self.set_global_cached(name_idx, cache_idx, v)
            }
            DefineGlobal => {
                let name_idx = self.fetch_u16()?;
                let name = self.const_name(name_idx)?;
                let module = {
                    let func = self.frames.last().expect("active frame").func;
                    self.heap.func(func).module
                };
                let v = self.pop();
                self.define_global(module, name, v);
                Ok(())
            }

            // ---- fields and subscripts ----
            GetField => {
                let name_idx = self.fetch_u16()?;
                let cache_idx = self.fetch_u16()?;
                self.get_field_op(name_idx, cache_idx)
            }
            SetField => {
                let name_idx = self.fetch_u16()?;
                let cache_idx = self.fetch_u16()?;
                self.set_field_op(name_idx, cache_idx)
            }
            SubscrGet => {
                let key = self.pop();
                let obj = self.pop();
                let v = self.subscript_get(obj, key)?;
                self.push(v);
                Ok(())
            }
            SubscrSet => {
                let v = self.pop();
                let key = self.pop();
                let obj = self.pop();
                self.subscript_set(obj, key, v)
            }

            // ---- calls ----
            Call => {
                let argc = self.fetch_u8()? as usize;
                let pos = self.sp() - argc - 1;
                self.call_value_at(pos, argc).map(|_| ())
            }
            Call0 | Call1 | Call2 | Call3 | Call4 | Call5 | Call6 | Call7 | Call8 | Call9
            | Call10 => {
                let argc = op.inline_argc().expect("inline call opcode") as usize;
                let pos = self.sp() - argc - 1;
                self.call_value_at(pos, argc).map(|_| ())
            }
            Invoke => {
                let name_idx = self.fetch_u16()?;
                let argc = self.fetch_u8()? as usize;
                let name = self.const_name(name_idx)?;
                let pos = self.sp() - argc - 1;
                self.invoke_at(name, pos, argc).map(|_| ())
            }
            Invoke0 | Invoke1 | Invoke2 | Invoke3 | Invoke4 | Invoke5 | Invoke6 | Invoke7
            | Invoke8 | Invoke9 | Invoke10 => {
                let name_idx = self.fetch_u16()?;
                let argc = op.inline_argc().expect("inline invoke opcode") as usize;
                let name = self.const_name(name_idx)?;
                let pos = self.sp() - argc - 1;
                self.invoke_at(name, pos, argc).map(|_| ())
            }
            Super => {
                let name_idx = self.fetch_u16()?;
                let argc = self.fetch_u8()? as usize;
                let name = self.const_name(name_idx)?;
                let pos = self.sp() - argc - 1;
                self.super_invoke_at(name, pos, argc).map(|_| ())
            }
            Super0 | Super1 | Super2 | Super3 | Super4 | Super5 | Super6 | Super7 | Super8
            | Super9 | Super10 => {
                let name_idx = self.fetch_u16()?;
                let argc = op.inline_argc().expect("inline super opcode") as usize;
                let name = self.const_name(name_idx)?;
                let pos = self.sp() - argc - 1;
                self.super_invoke_at(name, pos, argc).map(|_| ())
            }

            // ---- control flow ----
            Jump => {
                let disp = self.fetch_i16()?;
                self.jump(disp);
                Ok(())
            }
            JumpT => {
                let disp = self.fetch_i16()?;
                if self.pop().is_truthy() {
                    self.jump(disp);
                }
                Ok(())
            }
            JumpF => {
                let disp = self.fetch_i16()?;
                if !self.pop().is_truthy() {
                    self.jump(disp);
                }
                Ok(())
            }
            Return => {
                let ret = self.pop();
                self.return_value(ret);
                Ok(())
            }
            Yield => {
                let val = self.pop();
                self.yield_value(val)
            }

            // ---- closures ----
            Closure => {
                let cidx = self.fetch_u16()?;
                self.make_closure(cidx)
            }
            CloseUpvalue => {
                let top = self.sp() - 1;
                self.close_upvalues(top);
                self.pop();
                Ok(())
            }

            // ---- exceptions ----
            SetupExcept | SetupEnsure => {
                let target = self.fetch_u16()? as usize;
                let sp = self.sp();
                let frame = self.frames.last_mut().expect("active frame");
                if frame.handlers.len() >= MAX_HANDLERS {
                    return Err(self.corrupt_exc());
                }
                let kind = if op == SetupExcept { HandlerKind::Except } else { HandlerKind::Ensure };
                frame.handlers.push(Handler { kind, target, sp });
                Ok(())
            }
            PopHandler => {
                let frame = self.frames.last_mut().expect("active frame");
                frame.handlers.pop();
                Ok(())
            }
            Raise => {
                let exc = self.pop();
                self.raise_value(exc)
            }
            EnsureEnd => {
                let cause = self.pop();
                let value = self.pop();
                match cause {
                    Value::Null => Ok(()),
                    Value::Num(_) => {
                        self.return_value(value);
                        Ok(())
                    }
                    exc => Err(Raised(exc)),
                }
            }

            // ---- imports ----
            Import | ImportAs => {
                let name_idx = self.fetch_u16()?;
                let name = self.const_name(name_idx)?;
                let name_str = self.heap.str_bytes(name).to_string();
                let module = crate::import::import_module(self, &name_str)?;
                self.last_import = module;
                self.push(module);
                Ok(())
            }
            ImportFrom => {
                let name_idx = self.fetch_u16()?;
                let name = self.const_name(name_idx)?;
                let name_str = self.heap.str_bytes(name).to_string();
                let module = crate::import::import_module(self, &name_str)?;
                self.last_import = module;
                Ok(())
            }
            ImportName => {
                let module_idx = self.fetch_u16()?;
                let name_idx = self.fetch_u16()?;
                let module_name = self.const_name(module_idx)?;
                let name = self.const_name(name_idx)?;
                let module = match self.modules.get(&module_name) {
                    Some(&m) => m,
                    None => {
                        let n = self.heap.str_bytes(module_name).to_string();
                        return Err(self.import_exc(format!("module '{}' is not loaded", n)));
                    }
                };
                match self.module_global(module, name) {
                    Some((_, v)) => {
                        self.push(v);
                        Ok(())
                    }
                    None => {
                        let n = self.heap.str_bytes(name).to_string();
                        let m = self.heap.str_bytes(module_name).to_string();
                        Err(self.import_exc(format!("cannot import '{}' from '{}'", n, m)))
                    }
                }
            }

            // ---- classes and methods ----
            DefMethod => {
                let name_idx = self.fetch_u16()?;
                let name = self.const_name(name_idx)?;
                let method = self.pop();
                let class = self.peek(0).as_obj().expect("class under method");
                let sup = self.heap.class(class).super_class;
                if let Some(mr) = method.as_obj() {
                    if matches!(self.heap.get(mr), ObjBody::Closure(_)) {
                        let func = self.heap.closure(mr).func;
                        self.heap.func_mut(func).super_class = sup;
                    }
                }
                self.heap.class_mut(class).methods.insert(name, method);
                Ok(())
            }
            NatMethod => {
                let name_idx = self.fetch_u16()?;
                let const_idx = self.fetch_u16()?;
                let name = self.const_name(name_idx)?;
                let native = self.frame_const(const_idx)?;
                let class = self.peek(0).as_obj().expect("class under method");
                self.heap.class_mut(class).methods.insert(name, native);
                Ok(())
            }
            NewClass => {
                let name_idx = self.fetch_u16()?;
                let name = self.const_name(name_idx)?;
                let class = self.new_class(name, self.builtins.object)?;
                self.push(Value::Obj(class));
                Ok(())
            }
            NewSubclass => {
                let name_idx = self.fetch_u16()?;
                let name = self.const_name(name_idx)?;
                let sup_val = self.pop();
                let sup = match sup_val.as_obj() {
                    Some(r) if matches!(self.heap.get(r), ObjBody::Class(_)) => r,
                    _ => {
                        let t = self.type_name_of(sup_val);
                        return Err(self.type_exc(format!("can only inherit from a class, got {}", t)));
                    }
                };
                let class = self.new_class(name, sup)?;
                self.push(Value::Obj(class));
                Ok(())
            }

            MarkBreak | MarkContinue => Err(self.corrupt_exc()),
        }
    }

    fn jump(&mut self, disp: i16) {
        let frame = self.frames.last_mut().expect("active frame");
        frame.ip = (frame.ip as i64 + disp as i64) as usize;
    }

    fn binary_arith(&mut self, op: Opcode) -> Result<(), Raised> {
        let b = self.pop();
        let a = self.pop();
        if let (Value::Num(x), Value::Num(y)) = (a, b) {
            let r = match op {
                Opcode::Add => x + y,
                Opcode::Sub => x - y,
                Opcode::Mul => x * y,
                Opcode::Div => x / y,
                Opcode::Mod => x % y,
                Opcode::Pow => x.powf(y),
                _ => unreachable!(),
            };
            self.push(Value::Num(r));
            return Ok(());
        }
        let names = self.names;
        let (name, rname, sym) = match op {
            Opcode::Add => (names.add, names.radd, "+"),
            Opcode::Sub => (names.sub, names.rsub, "-"),
            Opcode::Mul => (names.mul, names.rmul, "*"),
            Opcode::Div => (names.div, names.rdiv, "/"),
            Opcode::Mod => (names.modulo, names.rmod, "%"),
            Opcode::Pow => (names.pow, names.rpow, "^"),
            _ => unreachable!(),
        };
        let r = self.dispatch_binary(a, b, name, rname, sym)?;
        self.push(r);
        Ok(())
    }

    fn binary_compare(&mut self, op: Opcode) -> Result<(), Raised> {
        let b = self.pop();
        let a = self.pop();
        if let (Value::Num(x), Value::Num(y)) = (a, b) {
            let r = match op {
                Opcode::Gt => x > y,
                Opcode::Ge => x >= y,
                Opcode::Lt => x < y,
                Opcode::Le => x <= y,
                _ => unreachable!(),
            };
            self.push(Value::Bool(r));
            return Ok(());
        }
        let names = self.names;
        // The reversed comparison flips the operator, not the spelling:
        // `a < b` falls back to `b > a`.
        let (name, rname, sym) = match op {
            Opcode::Gt => (names.gt, names.lt, ">"),
            Opcode::Ge => (names.ge, names.le, ">="),
            Opcode::Lt => (names.lt, names.gt, "<"),
            Opcode::Le => (names.le, names.ge, "<="),
            _ => unreachable!(),
        };
        let r = self.dispatch_binary(a, b, name, rname, sym)?;
        self.push(r);
        Ok(())
    }

    fn unpack(&mut self, n: usize) -> Result<(), Raised> {
        let v = self.pop();
        let items: Vec<Value> = match v.as_obj().map(|r| self.heap.get(r)) {
            Some(ObjBody::List(l)) => l.clone(),
            Some(ObjBody::Tuple(t)) => t.to_vec(),
            _ => {
                let t = self.type_name_of(v);
                return Err(self.type_exc(format!("cannot unpack {}", t)));
            }
        };
        if items.len() != n {
            return Err(self.arg_exc(format!(
                "unpacking expects {} values, got {}",
                n,
                items.len()
            )));
        }
        for item in items {
            self.push(item);
        }
        Ok(())
    }

    fn make_closure(&mut self, cidx: u16) -> Result<(), Raised> {
        let func_val = self.frame_const(cidx)?;
        let func_ref = match func_val.as_obj() {
            Some(r) if matches!(self.heap.get(r), ObjBody::Func(_)) => r,
            _ => return Err(self.corrupt_exc()),
        };
        let n_upvals = self.heap.func(func_ref).proto.upvalues.len();
        let mut upvalues = Vec::with_capacity(n_upvals);
        for _ in 0..n_upvals {
            let is_local = self.fetch_u8()? != 0;
            let index = self.fetch_u8()? as usize;
            let frame = self.frames.last().expect("active frame");
            let base = frame.base;
            let enclosing = frame.closure;
            if is_local {
                upvalues.push(self.capture_upvalue(base + index));
            } else {
                let c = enclosing.expect("upvalue copy without enclosing closure");
                upvalues.push(self.heap.closure(c).upvalues[index]);
            }
        }
        // Captured upvalues are rooted through the open list or the
        // enclosing closure, so collection here is safe.
        let closure = self.alloc(
            self.builtins.function,
            ObjBody::Closure(ObjClosure { func: func_ref, upvalues }),
        );
        self.push(Value::Obj(closure));
        Ok(())
    }

    fn yield_value(&mut self, val: Value) -> Result<(), Raised> {
        let (base, g) = {
            let frame = self.frames.last().expect("active frame");
            match frame.generator {
                Some(g) => (frame.base, g),
                None => return Err(self.type_exc("'yield' outside of a generator")),
            }
        };
        // Locals captured by closures inside the generator are hoisted
        // now; the stack window is about to move into the buffer.
        self.close_upvalues(base);
        let frame = self.frames.pop().expect("active frame");
        let handlers: Vec<Handler> = frame
            .handlers
            .into_iter()
            .map(|h| Handler { sp: h.sp - base, ..h })
            .collect();
        let window = self.stack.split_off(base);
        {
            let gen = self.heap.generator_mut(g);
            gen.ip = frame.ip;
            gen.stack = window;
            gen.handlers = handlers;
            gen.state = GenState::Suspended;
            gen.last_yield = val;
        }
        self.push(val);
        Ok(())
    }

    fn raise_value(&mut self, exc: Value) -> Result<(), Raised> {
        // Raising a non-exception is itself a type error.
        let ok = match self.builtins.exception {
            Some(cls) => self.is_instance(exc, cls),
            None => exc.is_obj(),
        };
        if ok {
            Err(Raised(exc))
        } else {
            let t = self.type_name_of(exc);
            Err(self.type_exc(format!("can only raise Exception instances, got {}", t)))
        }
    }

    fn new_class(&mut self, name: GcRef, sup: GcRef) -> Result<GcRef, Raised> {
        let methods = self.heap.class(sup).methods.clone();
        let class = self.alloc(
            Some(self.builtins.class_cls),
            ObjBody::Class(ObjClass {
                name,
                super_class: Some(sup),
                methods,
                fields: Default::default(),
                field_count: 0,
            }),
        );
        Ok(class)
    }

    // ------------------------------------------------- global/field ops --

    fn get_global_cached(&mut self, name_idx: u16, cache_idx: u16) -> Result<Value, Raised> {
        let func = self.frames.last().expect("active frame").func;
        let (module, cached) = {
            let f = self.heap.func(func);
            (f.module, f.caches.get(cache_idx as usize).copied().unwrap_or_default())
        };
        match cached {
            Cache::Global(slot) => {
                self.stats.cache_hits += 1;
                return Ok(self.heap.module(module).globals[slot as usize]);
            }
            Cache::CoreGlobal(slot) => {
                self.stats.cache_hits += 1;
                let core = self.core_module.expect("core module after bootstrap");
                return Ok(self.heap.module(core).globals[slot as usize]);
            }
            _ => {}
        }
        self.stats.cache_misses += 1;
        let name = self.const_name(name_idx)?;
        if let Some((slot, v)) = self.module_global(module, name) {
            if let Some(c) = self.heap.func_mut(func).caches.get_mut(cache_idx as usize) {
                *c = Cache::Global(slot);
            }
            return Ok(v);
        }
        if let Some(core) = self.core_module {
            if let Some((slot, v)) = self.module_global(core, name) {
                if let Some(c) = self.heap.func_mut(func).caches.get_mut(cache_idx as usize) {
                    *c = Cache::CoreGlobal(slot);
                }
                return Ok(v);
            }
        }
        let n = self.heap.str_bytes(name).to_string();
        Err(self.name_exc(format!("name '{}' is not defined", n)))
    }

    fn set_global_cached(&mut self, name_idx: u16, cache_idx: u16, v: Value) -> Result<(), Raised> {
        let func = self.frames.last().expect("active frame").func;
        let (module, cached) = {
            let f = self.heap.func(func);
            (f.module, f.caches.get(cache_idx as usize).copied().unwrap_or_default())
        };
        if let Cache::Global(slot) = cached {
            self.stats.cache_hits += 1;
            self.heap.module_mut(module).globals[slot as usize] = v;
            return Ok(());
        }
        self.stats.cache_misses += 1;
        let name = self.const_name(name_idx)?;
        match self.module_global(module, name) {
            Some((slot, _)) => {
                if let Some(c) = self.heap.func_mut(func).caches.get_mut(cache_idx as usize) {
                    *c = Cache::Global(slot);
                }
                self.heap.module_mut(module).globals[slot as usize] = v;
                Ok(())
            }
            None => {
                let n = self.heap.str_bytes(name).to_string();
                Err(self.name_exc(format!(
                    "cannot assign to undefined global '{}' (use 'var')",
                    n
                )))
            }
        }
    }

    fn get_field_op(&mut self, name_idx: u16, cache_idx: u16) -> Result<(), Raised> {
        let obj = self.pop();
        if let Value::Obj(r) = obj {
            if matches!(self.heap.get(r), ObjBody::Instance(_)) {
                // Inline cache: class match means the offset is valid.
                let func = self.frames.last().expect("active frame").func;
                let cached = self.heap.func(func).caches.get(cache_idx as usize).copied();
                if let Some(Cache::Field { class, offset }) = cached {
                    if self.heap.class_of(r) == Some(class) {
                        self.stats.cache_hits += 1;
                        let v = self
                            .heap
                            .instance(r)
                            .fields
                            .get(offset as usize)
                            .copied()
                            .unwrap_or(Value::Null);
                        self.push(v);
                        return Ok(());
                    }
                }
                self.stats.cache_misses += 1;
                let name = self.const_name(name_idx)?;
                let class = self.heap.class_of(r).expect("instance without class");
                let hash = self.heap.str_hash(name);
                if let Some(offset) = self.heap.class(class).fields.get(name, hash) {
                    if let Some(c) = self.heap.func_mut(func).caches.get_mut(cache_idx as usize) {
                        *c = Cache::Field { class, offset: offset as u32 };
                    }
                    let v = self
                        .heap
                        .instance(r)
                        .fields
                        .get(offset as usize)
                        .copied()
                        .unwrap_or(Value::Null);
                    self.push(v);
                    return Ok(());
                }
                // Fall through to method lookup below.
            } else if matches!(self.heap.get(r), ObjBody::Module(_)) {
                let name = self.const_name(name_idx)?;
                return match self.module_global(r, name) {
                    Some((_, v)) => {
                        self.push(v);
                        Ok(())
                    }
                    None => {
                        let n = self.heap.str_bytes(name).to_string();
                        Err(self.name_exc(format!("module has no member '{}'", n)))
                    }
                };
            } else if matches!(self.heap.get(r), ObjBody::Class(_)) {
                let name = self.const_name(name_idx)?;
                return match self.lookup_method(r, name) {
                    Some(m) => {
                        self.push(m);
                        Ok(())
                    }
                    None => {
                        let n = self.heap.str_bytes(name).to_string();
                        Err(self.name_exc(format!("class has no method '{}'", n)))
                    }
                };
            }
        }
        // Bound method on the value's class.
        let name = self.const_name(name_idx)?;
        match self.method_on(obj, name) {
            Some(m) => {
                let mr = m.as_obj().expect("method is an object");
                self.push(obj); // root the receiver across the allocation
                let bm = self.alloc(
                    self.builtins.function,
                    ObjBody::BoundMethod(ObjBoundMethod { receiver: obj, method: mr }),
                );
                self.pop();
                self.push(Value::Obj(bm));
                Ok(())
            }
            None => {
                let n = self.heap.str_bytes(name).to_string();
                let t = self.type_name_of(obj);
                Err(self.name_exc(format!("{} has no field or method '{}'", t, n)))
            }
        }
    }

    fn set_field_op(&mut self, name_idx: u16, cache_idx: u16) -> Result<(), Raised> {
        let v = self.pop();
        let obj = self.pop();
        let name = self.const_name(name_idx)?;
        match obj {
            Value::Obj(r) if matches!(self.heap.get(r), ObjBody::Instance(_)) => {
                let func = self.frames.last().expect("active frame").func;
                let cached = self.heap.func(func).caches.get(cache_idx as usize).copied();
                if let Some(Cache::Field { class, offset }) = cached {
                    if self.heap.class_of(r) == Some(class) {
                        let i = self.heap.instance_mut(r);
                        if (offset as usize) < i.fields.len() {
                            self.stats.cache_hits += 1;
                            i.fields[offset as usize] = v;
                            return Ok(());
                        }
                    }
                }
                self.stats.cache_misses += 1;
                self.set_field_raw(r, name, v);
                let class = self.heap.class_of(r).expect("instance without class");
                let hash = self.heap.str_hash(name);
                if let Some(offset) = self.heap.class(class).fields.get(name, hash) {
                    if let Some(c) = self.heap.func_mut(func).caches.get_mut(cache_idx as usize) {
                        *c = Cache::Field { class, offset: offset as u32 };
                    }
                }
                Ok(())
            }
            Value::Obj(r) if matches!(self.heap.get(r), ObjBody::Module(_)) => {
                self.define_global(r, name, v);
                Ok(())
            }
            other => {
                let t = self.type_name_of(other);
                Err(self.type_exc(format!("cannot set fields on {}", t)))
            }
        }
    }

    // ------------------------------------------------------- subscripts --

    pub(crate) fn subscript_get(&mut self, obj: Value, key: Value) -> Result<Value, Raised> {
        let Some(r) = obj.as_obj() else {
            let t = self.type_name_of(obj);
            return Err(self.type_exc(format!("{} is not subscriptable", t)));
        };
        match self.heap.get(r) {
            ObjBody::List(l) => {
                let len = l.len();
                let idx = self.check_index(key, len)?;
                let l = match self.heap.get(r) {
                    ObjBody::List(l) => l,
                    _ => unreachable!(),
                };
                Ok(l[idx])
            }
            ObjBody::Tuple(t) => {
                let len = t.len();
                let idx = self.check_index(key, len)?;
                let t = match self.heap.get(r) {
                    ObjBody::Tuple(t) => t,
                    _ => unreachable!(),
                };
                Ok(t[idx])
            }
            ObjBody::Str(s) => {
                let len = s.bytes.len();
                let text = s.bytes.clone();
                let idx = self.check_index(key, len)?;
                if !text.is_char_boundary(idx) {
                    return Err(self.index_exc("index is not a character boundary"));
                }
                let ch = text[idx..].chars().next().expect("boundary checked");
                let sub = self.heap.new_string(ch.to_string());
                Ok(Value::Obj(sub))
            }
            ObjBody::Table(_) => self.table_get(r, key),
            ObjBody::Instance(_) => match self.method_on(obj, self.names.get) {
                Some(m) => self.call_with_receiver(m, obj, &[key]),
                None => {
                    let t = self.type_name_of(obj);
                    Err(self.type_exc(format!("{} does not support subscripting", t)))
                }
            },
            other => {
                let t = other.type_name();
                Err(self.type_exc(format!("{} is not subscriptable", t)))
            }
        }
    }

    pub(crate) fn subscript_set(&mut self, obj: Value, key: Value, v: Value) -> Result<(), Raised> {
        let Some(r) = obj.as_obj() else {
            let t = self.type_name_of(obj);
            return Err(self.type_exc(format!("{} is not subscriptable", t)));
        };
        match self.heap.get(r) {
            ObjBody::List(l) => {
                let len = l.len();
                let idx = self.check_index(key, len)?;
                if let ObjBody::List(l) = self.heap.get_mut(r) {
                    l[idx] = v;
                }
                Ok(())
            }
            ObjBody::Table(_) => self.table_set(r, key, v),
            ObjBody::Instance(_) => match self.method_on(obj, self.names.set) {
                Some(m) => {
                    self.call_with_receiver(m, obj, &[key, v])?;
                    Ok(())
                }
                None => {
                    let t = self.type_name_of(obj);
                    Err(self.type_exc(format!("{} does not support subscript assignment", t)))
                }
            },
            other => {
                let t = other.type_name();
                Err(self.type_exc(format!("cannot assign into {}", t)))
            }
        }
    }

    pub(crate) fn check_index(&mut self, key: Value, len: usize) -> Result<usize, Raised> {
        let n = match key {
            Value::Num(n) => n,
            other => {
                let t = self.type_name_of(other);
                return Err(self.type_exc(format!("index must be a number, got {}", t)));
            }
        };
        if n.fract() != 0.0 {
            return Err(self.arg_exc(format!("index must be an integer, got {}", n)));
        }
        if n < 0.0 || n >= len as f64 {
            return Err(self.index_exc(format!("index {} out of bounds for length {}", n, len)));
        }
        Ok(n as usize)
    }
}

/// How a call proceeded: a new frame was pushed for the dispatch loop, or
/// the call completed inline with the result on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallFlow {
    Frame,
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjBody;

    #[test]
    fn test_bootstrap_wires_every_builtin_class() {
        let vm = Vm::new(VmOptions::default());
        let b = vm.builtins;
        for (name, class) in [
            ("Number", b.number),
            ("Boolean", b.boolean),
            ("Null", b.null_cls),
            ("String", b.string),
            ("Function", b.function),
            ("Module", b.module_cls),
            ("List", b.list),
            ("Tuple", b.tuple),
            ("Table", b.table),
            ("StackTrace", b.stacktrace),
            ("Generator", b.generator),
            ("Exception", b.exception),
        ] {
            assert!(class.is_some(), "builtin class {} missing after bootstrap", name);
        }
    }

    #[test]
    fn test_class_is_its_own_class() {
        let vm = Vm::new(VmOptions::default());
        let class_cls = vm.builtins.class_cls;
        assert_eq!(vm.heap.class_of(class_cls), Some(class_cls));
        assert_eq!(vm.heap.class(class_cls).super_class, Some(vm.builtins.object));
        assert_eq!(vm.heap.class(vm.builtins.object).super_class, None);
    }

    #[test]
    fn test_primitive_class_of() {
        let vm = Vm::new(VmOptions::default());
        assert_eq!(vm.class_of(Value::Num(1.0)), vm.builtins.number);
        assert_eq!(vm.class_of(Value::Bool(true)), vm.builtins.boolean);
        assert_eq!(vm.class_of(Value::Null), vm.builtins.null_cls);
        // Handles resolve to the null class.
        assert_eq!(vm.class_of(Value::Handle(std::ptr::null_mut())), vm.builtins.null_cls);
    }

    #[test]
    fn test_bootstrap_patches_pre_existing_strings() {
        let vm = Vm::new(VmOptions::default());
        // Interned before the String class existed, patched afterwards.
        let name = vm.names.add;
        assert!(matches!(vm.heap.get(name), ObjBody::Str(_)));
        assert_eq!(vm.heap.class_of(name), vm.builtins.string);
    }

    #[test]
    fn test_exception_subclasses_chain_to_exception() {
        let mut vm = Vm::new(VmOptions::default());
        let exc = vm.make_exc("TypeException", "msg");
        let base = vm.builtins.exception.expect("Exception class");
        assert!(vm.is_instance(exc, base));
        assert!(vm.is_instance(exc, vm.builtins.object));
        assert_eq!(vm.exception_message(exc), "TypeException: msg");
    }

    #[test]
    fn test_empty_tuple_is_singleton() {
        let mut vm = Vm::new(VmOptions::default());
        vm.evaluate("<t>", "fun f(v...) return v end\nvar a = f()\nvar b = f()").unwrap();
        vm.push_module_global("__main__", "a").unwrap();
        vm.push_module_global("__main__", "b").unwrap();
        let (a, b) = (vm.get_slot(-2), vm.get_slot(-1));
        assert_eq!(a, b, "empty varargs share the empty-tuple singleton");
        assert_eq!(a, Value::Obj(vm.empty_tuple));
    }

    #[test]
    fn test_host_data_roundtrip() {
        let mut vm = Vm::new(VmOptions::default());
        assert!(vm.host_data().is_null());
        let mut payload = 7u32;
        vm.set_host_data(&mut payload as *mut u32 as *mut std::ffi::c_void);
        assert_eq!(vm.host_data() as usize, &payload as *const u32 as usize);
    }
}
