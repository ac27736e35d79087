//! Module system tests: filesystem search, packages, bytecode modules,
//! submodule binding, idempotence, and the embedder import hook.

use std::cell::RefCell;
use std::fs;
use std::rc::Rc;

use brio_runtime::{ImportSource, Value, Vm, VmOptions};
use tempfile::TempDir;

fn vm_with_path(dir: &TempDir) -> Vm {
    let mut options = VmOptions::default();
    options.import_paths = vec![dir.path().to_path_buf()];
    Vm::new(options)
}

fn global_num(vm: &mut Vm, name: &str) -> f64 {
    vm.push_module_global("__main__", name).expect("global exists");
    let v = vm.get_slot(-1);
    vm.pop_slots(1);
    match v {
        Value::Num(n) => n,
        other => panic!("expected number, got {:?}", other),
    }
}

#[test]
fn test_import_source_module_from_path() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("util.brio"), "fun double(n) return n * 2 end\n").unwrap();

    let mut vm = vm_with_path(&dir);
    vm.evaluate("<test>", "import util\nvar r = util.double(21)").unwrap();
    assert_eq!(global_num(&mut vm, "r"), 42.0);
}

#[test]
fn test_import_for_names() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("m.brio"), "var x = 7\nvar y = 8\n").unwrap();

    let mut vm = vm_with_path(&dir);
    vm.evaluate("<test>", "import m for x, y\nvar r = x * 10 + y").unwrap();
    assert_eq!(global_num(&mut vm, "r"), 78.0);
}

#[test]
fn test_import_as_alias() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("verylongname.brio"), "var v = 5\n").unwrap();

    let mut vm = vm_with_path(&dir);
    vm.evaluate("<test>", "import verylongname as short\nvar r = short.v").unwrap();
    assert_eq!(global_num(&mut vm, "r"), 5.0);
}

#[test]
fn test_submodule_binds_into_parent() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("pkg")).unwrap();
    fs::write(dir.path().join("pkg/__package__.brio"), "var marker = 1\n").unwrap();
    fs::write(dir.path().join("pkg/sub.brio"), "var inner = 9\n").unwrap();

    let mut vm = vm_with_path(&dir);
    vm.evaluate("<test>", "import pkg.sub\nvar r = pkg.sub.inner + pkg.marker").unwrap();
    assert_eq!(global_num(&mut vm, "r"), 10.0);
}

#[test]
fn test_package_file_preferred_over_plain_module() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("dual")).unwrap();
    fs::write(dir.path().join("dual/__package__.brio"), "var which = \"package\"\n").unwrap();
    fs::write(dir.path().join("dual.brio"), "var which = \"plain\"\n").unwrap();

    let mut vm = vm_with_path(&dir);
    vm.evaluate("<test>", "import dual for which").unwrap();
    vm.push_module_global("__main__", "which").unwrap();
    assert_eq!(vm.get_string(-1), Some("package"));
    vm.pop_slots(1);
}

#[test]
fn test_bytecode_module_loads() {
    let dir = TempDir::new().unwrap();
    let proto = brio_compiler::compile("binmod", "fun id(x) return x end\nvar tag = 99\n").unwrap();
    fs::write(dir.path().join("binmod.bric"), brio_core::serialize(&proto)).unwrap();

    let mut vm = vm_with_path(&dir);
    vm.evaluate("<test>", "import binmod\nvar r = binmod.id(binmod.tag)").unwrap();
    assert_eq!(global_num(&mut vm, "r"), 99.0);
}

#[test]
fn test_binary_module_preferred_over_source() {
    let dir = TempDir::new().unwrap();
    let proto = brio_compiler::compile("pick", "var which = 1\n").unwrap();
    fs::write(dir.path().join("pick.bric"), brio_core::serialize(&proto)).unwrap();
    fs::write(dir.path().join("pick.brio"), "var which = 2\n").unwrap();

    let mut vm = vm_with_path(&dir);
    vm.evaluate("<test>", "import pick for which\nvar r = which").unwrap();
    assert_eq!(global_num(&mut vm, "r"), 1.0);
}

#[test]
fn test_import_is_idempotent() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("counted.brio"),
        "var loads = 0\nloads = loads + 1\n",
    )
    .unwrap();

    let mut vm = vm_with_path(&dir);
    vm.evaluate(
        "<test>",
        "import counted\nimport counted\nimport counted\nvar r = counted.loads",
    )
    .unwrap();
    // Top-level side effects execute exactly once.
    assert_eq!(global_num(&mut vm, "r"), 1.0);
}

#[test]
fn test_missing_module_raises_import_exception() {
    let dir = TempDir::new().unwrap();
    let mut vm = vm_with_path(&dir);
    vm.evaluate(
        "<test>",
        "var caught = false\ntry\n import nosuchmodule\nexcept ImportException e\n caught = true\nend",
    )
    .unwrap();
    vm.push_module_global("__main__", "caught").unwrap();
    assert_eq!(vm.get_slot(-1), Value::Bool(true));
    vm.pop_slots(1);
}

#[test]
fn test_broken_module_is_not_registered() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("broken.brio"), "raise TypeException(\"boom\")\n").unwrap();
    fs::write(dir.path().join("fixedup.brio"), "var ok = 1\n").unwrap();

    let mut vm = vm_with_path(&dir);
    vm.evaluate(
        "<test>",
        "var first = false\nvar second = false\n\
         try\n import broken\nexcept TypeException e\n first = true\nend\n\
         try\n import broken\nexcept TypeException e\n second = true\nend",
    )
    .unwrap();
    // The failed module was unregistered, so the second import retries
    // (and fails the same way) rather than yielding a half-built module.
    for name in ["first", "second"] {
        vm.push_module_global("__main__", name).unwrap();
        assert_eq!(vm.get_slot(-1), Value::Bool(true), "global {}", name);
        vm.pop_slots(1);
    }
}

#[test]
fn test_import_hook_provides_source() {
    let calls = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&calls);

    let mut vm = Vm::new(VmOptions::default());
    vm.set_import_hook(Box::new(move |name| {
        seen.borrow_mut().push(name.to_string());
        if name == "virtual" {
            Some(ImportSource::Source("var answer = 42\n".to_string()))
        } else {
            None
        }
    }));

    vm.evaluate("<test>", "import virtual\nimport virtual\nvar r = virtual.answer")
        .unwrap();
    assert_eq!(global_num(&mut vm, "r"), 42.0);
    // Registry hit on re-import: the hook ran once.
    assert_eq!(calls.borrow().len(), 1);
}

#[test]
fn test_import_hook_provides_bytecode() {
    let proto = brio_compiler::compile("precompiled", "var v = 123\n").unwrap();
    let bytes = brio_core::serialize(&proto);

    let mut vm = Vm::new(VmOptions::default());
    vm.set_import_hook(Box::new(move |name| {
        (name == "precompiled").then(|| ImportSource::Bytecode(bytes.clone()))
    }));

    vm.evaluate("<test>", "import precompiled for v\nvar r = v").unwrap();
    assert_eq!(global_num(&mut vm, "r"), 123.0);
}

#[test]
fn test_relative_import_from_script_directory() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("helper.brio"), "var h = 3\n").unwrap();
    let main_path = dir.path().join("main.brio");
    fs::write(&main_path, "import helper\nvar r = helper.h\n").unwrap();

    // No explicit import paths: resolution falls back to the importing
    // module's own directory.
    let mut vm = Vm::new(VmOptions::default());
    let source = fs::read_to_string(&main_path).unwrap();
    vm.evaluate(&main_path.to_string_lossy(), &source).unwrap();
    assert_eq!(global_num(&mut vm, "r"), 3.0);
}

#[test]
fn test_corrupt_bytecode_module_raises() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("garbage.bric"), [0xB5, b'B', b'r', b'i', b'C', 9, 0, 1]).unwrap();

    let mut vm = vm_with_path(&dir);
    vm.set_error_callback(Box::new(|_, _, _, _| {}));
    vm.evaluate(
        "<test>",
        "var caught = false\ntry\n import garbage\nexcept ImportException e\n caught = true\nend",
    )
    .unwrap();
    vm.push_module_global("__main__", "caught").unwrap();
    assert_eq!(vm.get_slot(-1), Value::Bool(true));
    vm.pop_slots(1);
}
