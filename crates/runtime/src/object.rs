//! Heap object variants.
//!
//! Every heap object is a header (class pointer + mark bit, kept in the
//! heap slot) plus one of these bodies. Bodies hold `Value`s and `GcRef`s
//! freely; the collector knows how to trace each kind (see `gc.rs`).

use crate::table::{FieldIndex, ValueHashTable};
use crate::value::{GcRef, Value};
use brio_core::FuncProto;
use std::collections::HashMap;
use std::rc::Rc;

/// A Rust-implemented function callable from Brio.
///
/// `base` is the stack index of the receiver/callee slot; arguments follow
/// it. The native returns its result, or the exception to raise.
pub type NativeFn = fn(&mut crate::vm::Vm, base: usize, argc: usize) -> Result<Value, Raised>;

/// An exception in flight, produced by `raise` or any failing operation.
/// The dispatch loop turns it into handler unwinding.
#[derive(Debug)]
pub struct Raised(pub Value);

/// One entry of a module's native function table.
#[derive(Clone)]
pub struct RegistryEntry {
    /// `None` for module-level functions, the class name for methods.
    pub class_name: Option<&'static str>,
    pub name: &'static str,
    pub func: NativeFn,
}

/// The table a native extension (or a built-in module) exports: the
/// implementations behind every `native` declaration in its source.
#[derive(Default)]
pub struct NativeRegistry {
    pub entries: Vec<RegistryEntry>,
}

impl NativeRegistry {
    pub fn lookup(&self, class_name: Option<&str>, name: &str) -> Option<NativeFn> {
        self.entries
            .iter()
            .find(|e| e.class_name == class_name && e.name == name)
            .map(|e| e.func)
    }
}

impl std::fmt::Debug for NativeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeRegistry({} entries)", self.entries.len())
    }
}

/// Immutable byte string with its cached hash.
#[derive(Debug)]
pub struct ObjStr {
    pub bytes: String,
    pub hash: u32,
    /// Interned strings are unique per content and compare by identity.
    pub interned: bool,
}

#[derive(Debug)]
pub struct ObjModule {
    /// Interned dotted name.
    pub name: GcRef,
    /// Absolute path of the file the module was loaded from, or a
    /// placeholder for synthetic modules.
    pub path: String,
    /// Name -> dense slot in `globals`. Slots are append-only.
    pub global_names: FieldIndex,
    pub globals: Vec<Value>,
    /// Native implementations for this module's `native` declarations.
    pub registry: Option<Rc<NativeRegistry>>,
    /// Keeps a dlopen'd extension library alive as long as the module.
    pub dylib: Option<crate::import::Dylib>,
}

/// Inline-cache slot attached to a function; the bytecode addresses these
/// by index to skip repeated name lookups.
#[derive(Debug, Clone, Copy, Default)]
pub enum Cache {
    #[default]
    Empty,
    /// Resolved slot in the function's own module.
    Global(u32),
    /// Resolved slot in the core module (builtin fallback).
    CoreGlobal(u32),
    /// Resolved field offset, valid while the receiver's class matches.
    Field { class: GcRef, offset: u32 },
}

/// An instantiated script function: the compiled prototype bound to a
/// module, with its constant pool turned into live values.
#[derive(Debug)]
pub struct ObjFunc {
    pub proto: Rc<FuncProto>,
    pub module: GcRef,
    /// Instantiated constant pool (strings interned, nested functions and
    /// natives created).
    pub consts: Vec<Value>,
    pub defaults: Vec<Value>,
    pub caches: Vec<Cache>,
    /// For methods: the defining class's superclass, resolved when the
    /// method is installed. Super calls dispatch through this.
    pub super_class: Option<GcRef>,
}

#[derive(Debug)]
pub struct ObjNative {
    pub name: String,
    pub arity: u8,
    pub vararg: bool,
    pub defaults: Vec<Value>,
    pub module: GcRef,
    /// Resolved lazily from the module's registry on first call, under
    /// the mangled `Class.method` (or bare) name.
    pub func: Option<NativeFn>,
}

#[derive(Debug)]
pub struct ObjClosure {
    pub func: GcRef,
    pub upvalues: Vec<GcRef>,
}

/// Either a live view into a stack slot or the hoisted value.
#[derive(Debug)]
pub enum ObjUpvalue {
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct ObjClass {
    pub name: GcRef,
    pub super_class: Option<GcRef>,
    /// Interned method name -> closure or native. Subclasses start from a
    /// copy of their superclass's map.
    pub methods: HashMap<GcRef, Value>,
    /// Field name -> storage offset in instances of this class.
    pub fields: FieldIndex,
    pub field_count: u32,
}

#[derive(Debug)]
pub struct ObjInstance {
    /// Indexed by the class's field offsets; grows on first write per slot.
    pub fields: Vec<Value>,
}

#[derive(Debug)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    /// Closure or native.
    pub method: GcRef,
}

#[derive(Debug, Clone)]
pub struct TraceRecord {
    pub line: u32,
    pub module: String,
    pub function: String,
}

#[derive(Debug, Default)]
pub struct ObjStackTrace {
    pub records: Vec<TraceRecord>,
    /// Depth of the last recorded frame; suppresses duplicates when a
    /// handler re-raises at the same depth.
    pub last_traced: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenState {
    Started,
    Suspended,
    Running,
    Done,
}

/// Exception handler registration, per frame.
///
/// `sp` is the operand-stack height to restore on entry. Inside a live
/// frame it is absolute; in a suspended generator it is relative to the
/// frame base.
#[derive(Debug, Clone, Copy)]
pub struct Handler {
    pub kind: HandlerKind,
    pub target: usize,
    pub sp: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Except,
    Ensure,
}

/// A suspended call: enough state to reinstall the frame on resume.
#[derive(Debug)]
pub struct ObjGenerator {
    pub state: GenState,
    pub closure: GcRef,
    /// Bytecode offset to resume at.
    pub ip: usize,
    /// The frame's stack window (locals and operands), base slot first.
    pub stack: Vec<Value>,
    /// Handler stack with base-relative `sp` values.
    pub handlers: Vec<Handler>,
    pub last_yield: Value,
}

/// Opaque host byte buffer with an optional cleanup hook the collector
/// runs when the object is freed.
pub struct ObjUserdata {
    pub data: Vec<u8>,
    pub finalizer: Option<fn(&mut [u8])>,
}

impl std::fmt::Debug for ObjUserdata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjUserdata({} bytes)", self.data.len())
    }
}

#[derive(Debug)]
pub enum ObjBody {
    Str(ObjStr),
    Module(ObjModule),
    Func(ObjFunc),
    Native(ObjNative),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    List(Vec<Value>),
    Tuple(Box<[Value]>),
    Table(ValueHashTable),
    BoundMethod(ObjBoundMethod),
    StackTrace(ObjStackTrace),
    Generator(ObjGenerator),
    Userdata(ObjUserdata),
}

impl ObjBody {
    /// Kind name for diagnostics and type errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjBody::Str(_) => "String",
            ObjBody::Module(_) => "Module",
            ObjBody::Func(_) | ObjBody::Closure(_) => "Function",
            ObjBody::Native(_) => "Native",
            ObjBody::Upvalue(_) => "Upvalue",
            ObjBody::Class(_) => "Class",
            ObjBody::Instance(_) => "Object",
            ObjBody::List(_) => "List",
            ObjBody::Tuple(_) => "Tuple",
            ObjBody::Table(_) => "Table",
            ObjBody::BoundMethod(_) => "Function",
            ObjBody::StackTrace(_) => "StackTrace",
            ObjBody::Generator(_) => "Generator",
            ObjBody::Userdata(_) => "Userdata",
        }
    }

    /// Rough byte footprint used by the allocation accounting that drives
    /// collection scheduling. Counts owned buffers, not transitive refs.
    pub fn approx_size(&self) -> usize {
        use std::mem::size_of;
        let base = size_of::<ObjBody>();
        base + match self {
            ObjBody::Str(s) => s.bytes.capacity(),
            ObjBody::Module(m) => {
                m.globals.capacity() * size_of::<Value>() + m.global_names.len() * 16
            }
            ObjBody::Func(f) => {
                f.consts.capacity() * size_of::<Value>()
                    + f.proto.code.bytes.len()
                    + f.caches.capacity() * size_of::<Cache>()
            }
            ObjBody::Native(_) => 0,
            ObjBody::Closure(c) => c.upvalues.capacity() * size_of::<GcRef>(),
            ObjBody::Upvalue(_) => 0,
            ObjBody::Class(c) => c.methods.len() * 24 + c.fields.len() * 16,
            ObjBody::Instance(i) => i.fields.capacity() * size_of::<Value>(),
            ObjBody::List(l) => l.capacity() * size_of::<Value>(),
            ObjBody::Tuple(t) => t.len() * size_of::<Value>(),
            ObjBody::Table(t) => t.capacity() * 3 * size_of::<Value>(),
            ObjBody::BoundMethod(_) => 0,
            ObjBody::StackTrace(st) => st.records.capacity() * size_of::<TraceRecord>(),
            ObjBody::Generator(g) => g.stack.capacity() * size_of::<Value>(),
            ObjBody::Userdata(u) => u.data.capacity(),
        }
    }
}
