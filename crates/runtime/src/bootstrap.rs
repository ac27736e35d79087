//! VM bootstrap: the self-referential class pair, the core module, and
//! the retroactive class patching.
//!
//! Order matters here. `Object` and `Class` must exist before any class
//! syntax can run (every class's header points at `Class`, and `Class` is
//! its own class). The core module then defines the remaining built-in
//! classes in the language itself; anything allocated before that —
//! interned names, the core module's own functions — is patched to the
//! right class afterwards.

use crate::gc::Heap;
use crate::object::{ObjBody, ObjClass, ObjNative};
use crate::value::{GcRef, Value};
use crate::vm::Vm;

/// Create the genesis pair: `Object` with no superclass, and `Class`,
/// which is its own class and inherits from `Object`.
pub(crate) fn genesis(heap: &mut Heap) -> (GcRef, GcRef) {
    let object_name = heap.intern("Object");
    let class_name = heap.intern("Class");
    let object = heap.alloc(
        None,
        ObjBody::Class(ObjClass {
            name: object_name,
            super_class: None,
            methods: Default::default(),
            fields: Default::default(),
            field_count: 0,
        }),
    );
    let class_cls = heap.alloc(
        None,
        ObjBody::Class(ObjClass {
            name: class_name,
            super_class: Some(object),
            methods: Default::default(),
            fields: Default::default(),
            field_count: 0,
        }),
    );
    heap.set_class(object, class_cls);
    heap.set_class(class_cls, class_cls);
    (object, class_cls)
}

/// Attach a native method to a class during bootstrap, before any class
/// syntax is available.
fn install_native_method(
    vm: &mut Vm,
    class: GcRef,
    module: GcRef,
    class_name: &str,
    method: &str,
    arity: u8,
) {
    let name_ref = vm.heap.intern(method);
    let native = vm.heap.alloc(
        None,
        ObjBody::Native(ObjNative {
            name: format!("{}.{}", class_name, method),
            arity,
            vararg: false,
            defaults: Vec::new(),
            module,
            func: None,
        }),
    );
    vm.heap.class_mut(class).methods.insert(name_ref, Value::Obj(native));
}

/// Run the full bootstrap: core module creation, `Object`/`Class` method
/// installation, core source evaluation, builtin wiring, class patching.
///
/// Failures here are packaging bugs (the core source is embedded), so
/// they abort.
pub(crate) fn boot(vm: &mut Vm) {
    let core = crate::import::create_module(vm, "core", "<builtin:core>");
    vm.core_module = Some(core);
    vm.heap.module_mut(core).registry = Some(crate::natives::core_registry());

    let object = vm.builtins.object;
    let class_cls = vm.builtins.class_cls;
    let object_name = vm.heap.intern("Object");
    let class_name = vm.heap.intern("Class");
    vm.define_global(core, object_name, Value::Obj(object));
    vm.define_global(core, class_name, Value::Obj(class_cls));

    install_native_method(vm, object, core, "Object", "__str__", 0);
    install_native_method(vm, object, core, "Object", "__eq__", 1);
    install_native_method(vm, object, core, "Object", "__hash__", 0);

    // Class starts from Object's methods, plus its own.
    let inherited = vm.heap.class(object).methods.clone();
    vm.heap.class_mut(class_cls).methods = inherited;
    install_native_method(vm, class_cls, core, "Class", "__str__", 0);
    install_native_method(vm, class_cls, core, "Class", "name", 0);

    let source = crate::stdlib::builtin_source("core").expect("embedded core module");
    let proto = match crate::import::compile_source(vm, "core", "<builtin:core>", source) {
        Ok(p) => p,
        Err(kind) => panic!("core bootstrap failed to compile: {}", kind),
    };
    if let Err(raised) = vm.run_module_body(core, &proto) {
        let rendered = vm.render_exception(raised.0);
        panic!("core bootstrap failed: {}", rendered);
    }

    vm.builtins.number = class_global(vm, "Number");
    vm.builtins.boolean = class_global(vm, "Boolean");
    vm.builtins.null_cls = class_global(vm, "Null");
    vm.builtins.string = class_global(vm, "String");
    vm.builtins.function = class_global(vm, "Function");
    vm.builtins.module_cls = class_global(vm, "Module");
    vm.builtins.list = class_global(vm, "List");
    vm.builtins.tuple = class_global(vm, "Tuple");
    vm.builtins.table = class_global(vm, "Table");
    vm.builtins.stacktrace = class_global(vm, "StackTrace");
    vm.builtins.generator = class_global(vm, "Generator");
    vm.builtins.exception = class_global(vm, "Exception");

    // Everything allocated before the classes existed gets its header
    // fixed up now; upvalues and userdata stay internal.
    let b = vm.builtins;
    vm.heap.patch_unclassed(|body| match body {
        ObjBody::Str(_) => b.string,
        ObjBody::Func(_) | ObjBody::Closure(_) | ObjBody::Native(_) | ObjBody::BoundMethod(_) => {
            b.function
        }
        ObjBody::Module(_) => b.module_cls,
        ObjBody::List(_) => b.list,
        ObjBody::Tuple(_) => b.tuple,
        ObjBody::Table(_) => b.table,
        ObjBody::StackTrace(_) => b.stacktrace,
        ObjBody::Generator(_) => b.generator,
        _ => None,
    });
}

fn class_global(vm: &Vm, name: &str) -> Option<GcRef> {
    let v = vm.core_global_named(name)?;
    let r = v.as_obj()?;
    matches!(vm.heap.get(r), ObjBody::Class(_)).then_some(r)
}
