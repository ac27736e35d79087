//! Module loading: the registry, the path search, and native extensions.
//!
//! Resolution order for `import name`:
//!
//! 1. the registry (idempotent re-import),
//! 2. the embedder's import hook, when installed,
//! 3. built-in modules embedded in the runtime (`core`, `sys`),
//! 4. the filesystem search over the configured import paths plus the
//!    importing module's directory, probing per prefix:
//!    `a/b/c/__package__.bric`, `a/b/c/__package__.brio`, `a/b/c.bric`,
//!    `a/b/c.brio`.
//!
//! "Not found" moves on to the next candidate; any other failure (syntax,
//! compile, deserialize, I/O mid-read) reports through the error callback
//! and raises `ImportException`. After a filesystem module loads, an
//! adjacent shared library `lib<name>.<ext>` is probed and its
//! `brio_open_<name>` entry point, when present, supplies the module's
//! native registry.

use std::ffi::CString;
use std::os::raw::c_void;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use brio_core::FuncProto;

use crate::error::ErrorKind;
use crate::object::{NativeRegistry, ObjBody, ObjModule, Raised};
use crate::value::{GcRef, Value};
use crate::vm::Vm;

/// Module content supplied by the embedder instead of the filesystem.
pub enum ImportSource {
    Source(String),
    Bytecode(Vec<u8>),
}

/// Embedder hook consulted before the default search; used for sandboxed
/// embedding.
pub type ImportHook = Box<dyn FnMut(&str) -> Option<ImportSource>>;

/// An open shared library. Kept alive by the module that loaded it.
#[derive(Debug)]
pub struct Dylib {
    handle: *mut c_void,
}

impl Dylib {
    #[cfg(unix)]
    fn open(path: &Path) -> Option<Dylib> {
        let c_path = CString::new(path.to_string_lossy().as_bytes()).ok()?;
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            None
        } else {
            Some(Dylib { handle })
        }
    }

    #[cfg(not(unix))]
    fn open(_path: &Path) -> Option<Dylib> {
        None
    }

    #[cfg(unix)]
    fn symbol(&self, name: &str) -> Option<*mut c_void> {
        let c_name = CString::new(name).ok()?;
        let sym = unsafe { libc::dlsym(self.handle, c_name.as_ptr()) };
        if sym.is_null() {
            None
        } else {
            Some(sym)
        }
    }

    #[cfg(not(unix))]
    fn symbol(&self, _name: &str) -> Option<*mut c_void> {
        None
    }
}

impl Drop for Dylib {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::dlclose(self.handle);
        }
    }
}

/// Entry point a native extension exports as `brio_open_<name>`. The
/// returned registry is boxed by the extension and ownership transfers to
/// the module.
type OpenFn = unsafe extern "C" fn() -> *mut NativeRegistry;

#[cfg(target_os = "macos")]
const DYLIB_EXT: &str = "dylib";
#[cfg(all(unix, not(target_os = "macos")))]
const DYLIB_EXT: &str = "so";
#[cfg(not(unix))]
const DYLIB_EXT: &str = "dll";

/// Compile a source buffer, reporting diagnostics through the error
/// callback. Lex/parse failures are syntax errors; everything later is a
/// compile error.
pub(crate) fn compile_source(
    vm: &mut Vm,
    name: &str,
    path: &str,
    source: &str,
) -> Result<FuncProto, ErrorKind> {
    let parser = match brio_compiler::Parser::new(source) {
        Ok(p) => p,
        Err(e) => {
            (vm.error_cb)(ErrorKind::Syntax, Some(path), e.line, &e.message);
            return Err(ErrorKind::Syntax);
        }
    };
    let stmts = match parser.parse() {
        Ok(s) => s,
        Err(errors) => {
            for e in &errors {
                (vm.error_cb)(ErrorKind::Syntax, Some(path), e.line, &e.message);
            }
            return Err(ErrorKind::Syntax);
        }
    };
    match brio_compiler::compile_module(name, &stmts) {
        Ok(proto) => Ok(proto),
        Err(errors) => {
            for e in &errors {
                (vm.error_cb)(ErrorKind::Compile, Some(path), e.line, &e.message);
            }
            Err(ErrorKind::Compile)
        }
    }
}

/// Create and register a module object, binding it as a global of its
/// parent module when the name is dotted. An already-registered name
/// returns the existing module, so repeated evaluation into `__main__`
/// (the interactive prompt) accumulates state.
pub(crate) fn create_module(vm: &mut Vm, name: &str, path: &str) -> GcRef {
    vm.heap.disable();
    let name_ref = vm.heap.intern(name);
    if let Some(&existing) = vm.modules.get(&name_ref) {
        vm.heap.enable();
        return existing;
    }
    let module = vm.heap.alloc(
        vm.builtins.module_cls,
        ObjBody::Module(ObjModule {
            name: name_ref,
            path: path.to_string(),
            global_names: Default::default(),
            globals: Vec::new(),
            registry: None,
            dylib: None,
        }),
    );
    vm.modules.insert(name_ref, module);
    if let Some((parent_name, simple)) = name.rsplit_once('.') {
        let parent_ref = vm.heap.intern(parent_name);
        if let Some(&parent) = vm.modules.get(&parent_ref) {
            let simple_ref = vm.heap.intern(simple);
            vm.define_global(parent, simple_ref, Value::Obj(module));
        }
    }
    vm.heap.enable();
    module
}

/// Load (or return) the module named `name`.
pub(crate) fn import_module(vm: &mut Vm, name: &str) -> Result<Value, Raised> {
    let name_ref = vm.heap.intern(name);
    if let Some(&m) = vm.modules.get(&name_ref) {
        return Ok(Value::Obj(m));
    }

    // Parents first, so the submodule can bind into them.
    if let Some((parent, _)) = name.rsplit_once('.') {
        import_module(vm, parent)?;
    }

    // Embedder hook.
    if let Some(mut hook) = vm.import_hook.take() {
        let provided = hook(name);
        vm.import_hook = Some(hook);
        match provided {
            Some(ImportSource::Source(text)) => {
                let path = format!("<import:{}>", name);
                let proto = compile_or_raise(vm, name, &path, &text)?;
                return run_new_module(vm, name, &path, &proto, builtin_registry(name));
            }
            Some(ImportSource::Bytecode(bytes)) => {
                let path = format!("<import:{}>", name);
                let proto = deserialize_or_raise(vm, name, &path, &bytes)?;
                return run_new_module(vm, name, &path, &proto, builtin_registry(name));
            }
            None => {}
        }
    }

    // Built-in modules shipped with the runtime.
    if let Some(text) = crate::stdlib::builtin_source(name) {
        let path = format!("<builtin:{}>", name);
        let proto = compile_or_raise(vm, name, &path, text)?;
        return run_new_module(vm, name, &path, &proto, builtin_registry(name));
    }

    // Filesystem search.
    if let Some(found) = find_module_file(vm, name) {
        let path_str = found.to_string_lossy().into_owned();
        let is_binary = found.extension().is_some_and(|e| e == "bric");
        let proto = if is_binary {
            let bytes = match std::fs::read(&found) {
                Ok(b) => b,
                Err(e) => {
                    let msg = e.to_string();
                    (vm.error_cb)(ErrorKind::Deserialize, Some(&path_str), 0, &msg);
                    return Err(vm.import_exc(format!("cannot read module '{}': {}", name, msg)));
                }
            };
            deserialize_or_raise(vm, name, &path_str, &bytes)?
        } else {
            let text = match std::fs::read_to_string(&found) {
                Ok(t) => t,
                Err(e) => {
                    let msg = e.to_string();
                    (vm.error_cb)(ErrorKind::Compile, Some(&path_str), 0, &msg);
                    return Err(vm.import_exc(format!("cannot read module '{}': {}", name, msg)));
                }
            };
            compile_or_raise(vm, name, &path_str, &text)?
        };
        let module = run_new_module(vm, name, &path_str, &proto, None)?;
        attach_native_extension(vm, name, &found);
        return Ok(module);
    }

    Err(vm.import_exc(format!("cannot find module '{}'", name)))
}

fn compile_or_raise(
    vm: &mut Vm,
    name: &str,
    path: &str,
    source: &str,
) -> Result<FuncProto, Raised> {
    compile_source(vm, name, path, source)
        .map_err(|_| vm.import_exc(format!("error compiling module '{}'", name)))
}

fn deserialize_or_raise(
    vm: &mut Vm,
    name: &str,
    path: &str,
    bytes: &[u8],
) -> Result<FuncProto, Raised> {
    match brio_core::deserialize(bytes) {
        Ok(p) => Ok(p),
        Err(e) => {
            let kind = if e.is_version() { ErrorKind::Version } else { ErrorKind::Deserialize };
            (vm.error_cb)(kind, Some(path), 0, &e.to_string());
            Err(vm.import_exc(format!("error loading module '{}': {}", name, e)))
        }
    }
}

/// Create the module, run its body, and unregister it again if the body
/// raises. Top-level side effects run exactly once per VM.
fn run_new_module(
    vm: &mut Vm,
    name: &str,
    path: &str,
    proto: &FuncProto,
    registry: Option<Rc<NativeRegistry>>,
) -> Result<Value, Raised> {
    let module = create_module(vm, name, path);
    if let Some(reg) = registry {
        vm.heap.module_mut(module).registry = Some(reg);
    }
    match vm.run_module_body(module, proto) {
        Ok(_) => Ok(Value::Obj(module)),
        Err(e) => {
            let name_ref = vm.heap.intern(name);
            vm.modules.remove(&name_ref);
            Err(e)
        }
    }
}

fn builtin_registry(name: &str) -> Option<Rc<NativeRegistry>> {
    crate::natives::registry_for(name)
}

/// Probe the search prefixes for the module file: package files first,
/// binary before source.
fn find_module_file(vm: &Vm, name: &str) -> Option<PathBuf> {
    let rel: PathBuf = name.split('.').collect();
    let mut prefixes: Vec<PathBuf> = vm.options.import_paths.clone();
    if let Some(dir) = importer_dir(vm) {
        prefixes.push(dir);
    }
    for prefix in &prefixes {
        let package = prefix.join(&rel);
        for candidate in [
            package.join("__package__.bric"),
            package.join("__package__.brio"),
            package.with_extension("bric"),
            package.with_extension("brio"),
        ] {
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Directory of the module currently executing, if it came from a file.
fn importer_dir(vm: &Vm) -> Option<PathBuf> {
    let frame = vm.frames.last()?;
    let module = vm.heap.func(frame.func).module;
    let path = &vm.heap.module(module).path;
    if path.starts_with('<') {
        return None;
    }
    Path::new(path).parent().map(|p| p.to_path_buf())
}

/// Look for `lib<simple>.<ext>` next to the module file and pull its
/// registry through the `brio_open_<simple>` entry point.
fn attach_native_extension(vm: &mut Vm, name: &str, module_path: &Path) {
    let simple = name.rsplit('.').next().unwrap_or(name);
    let dir = match module_path.parent() {
        Some(d) => d,
        None => return,
    };
    let lib_path = dir.join(format!("lib{}.{}", simple, DYLIB_EXT));
    if !lib_path.is_file() {
        return;
    }
    let Some(lib) = Dylib::open(&lib_path) else { return };
    let Some(sym) = lib.symbol(&format!("brio_open_{}", simple)) else { return };
    let open: OpenFn = unsafe { std::mem::transmute::<*mut c_void, OpenFn>(sym) };
    let raw = unsafe { open() };
    if raw.is_null() {
        return;
    }
    let registry = unsafe { Rc::from(Box::from_raw(raw)) };

    let name_ref = vm.heap.intern(name);
    if let Some(&module) = vm.modules.get(&name_ref) {
        let m = vm.heap.module_mut(module);
        m.registry = Some(registry);
        m.dylib = Some(lib);
    }
}
