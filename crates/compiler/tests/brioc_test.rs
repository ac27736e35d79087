//! `brioc` CLI tests: build, check, and disasm against real files.

use std::fs;
use std::process::Command;
use tempfile::TempDir;

fn brioc() -> Command {
    Command::new(env!("CARGO_BIN_EXE_brioc"))
}

#[test]
fn test_build_produces_bytecode_file() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("prog.brio");
    fs::write(&src, "fun main_value() return 41 + 1 end\n").unwrap();

    let status = brioc().arg("build").arg(&src).status().unwrap();
    assert!(status.success());

    let out = dir.path().join("prog.bric");
    let bytes = fs::read(&out).unwrap();
    assert_eq!(&bytes[..5], &[0xB5, b'B', b'r', b'i', b'C']);
    // And it deserializes back to a function tree.
    let proto = brio_core::deserialize(&bytes).unwrap();
    assert_eq!(proto.name.as_deref(), Some("prog"));
}

#[test]
fn test_build_with_explicit_output() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("a.brio");
    let out = dir.path().join("custom.bric");
    fs::write(&src, "var x = 1\n").unwrap();

    let status = brioc().arg("build").arg(&src).arg("-o").arg(&out).status().unwrap();
    assert!(status.success());
    assert!(out.exists());
}

#[test]
fn test_check_reports_errors_with_location() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("bad.brio");
    fs::write(&src, "var = 1\n").unwrap();

    let output = brioc().arg("check").arg(&src).output().unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("bad.brio"));
    assert!(stderr.contains("line 1"));
}

#[test]
fn test_check_accepts_valid_source() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("ok.brio");
    fs::write(&src, "class C\n fun m() return 1 end\nend\n").unwrap();

    let status = brioc().arg("check").arg(&src).status().unwrap();
    assert!(status.success());
}

#[test]
fn test_disasm_lists_opcodes() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("d.brio");
    fs::write(&src, "var x = 1 + 2\nprint(x)\n").unwrap();

    let output = brioc().arg("disasm").arg(&src).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("get_const"));
    assert!(stdout.contains("define_global"));
}

#[test]
fn test_disasm_reads_compiled_files() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("r.brio");
    fs::write(&src, "fun f() return 1 end\n").unwrap();
    assert!(brioc().arg("build").arg(&src).status().unwrap().success());

    let output = brioc().arg("disasm").arg(dir.path().join("r.bric")).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("fn f"));
}
