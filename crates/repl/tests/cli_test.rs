//! End-to-end tests of the `brio` runner: source in, stdout out.

use std::fs;
use std::process::Command;
use tempfile::TempDir;

fn run_source(source: &str, args: &[&str]) -> (String, String, bool) {
    let dir = TempDir::new().unwrap();
    let script = dir.path().join("main.brio");
    fs::write(&script, source).unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_brio"))
        .arg(&script)
        .args(args)
        .output()
        .unwrap();
    (
        String::from_utf8_lossy(&output.stdout).into_owned(),
        String::from_utf8_lossy(&output.stderr).into_owned(),
        output.status.success(),
    )
}

#[test]
fn test_arithmetic_prints_seven() {
    let (stdout, _, ok) = run_source("var x = 1 + 2 * 3\nprint(x)\n", &[]);
    assert!(ok);
    assert_eq!(stdout, "7\n");
}

#[test]
fn test_fibonacci_prints_55() {
    let (stdout, _, ok) = run_source(
        "fun fib(n)\n if n < 2 then return n end\n return fib(n-1) + fib(n-2)\nend\nprint(fib(10))\n",
        &[],
    );
    assert!(ok);
    assert_eq!(stdout, "55\n");
}

#[test]
fn test_super_call_prints_two() {
    let (stdout, _, ok) = run_source(
        "class C\n fun m() return 1 end\nend\nclass D is C\n fun m() return super.m() + 1 end\nend\nprint(D().m())\n",
        &[],
    );
    assert!(ok);
    assert_eq!(stdout, "2\n");
}

#[test]
fn test_exception_handler_prints_caught() {
    let (stdout, _, ok) = run_source(
        "try\n raise TypeException(\"fail\")\nexcept TypeException e\n print(\"caught\")\nend\n",
        &[],
    );
    assert!(ok);
    assert_eq!(stdout, "caught\n");
}

#[test]
fn test_generator_loop_prints_sequence() {
    let (stdout, _, ok) = run_source(
        "var g = fun()\n yield 1\n yield 2\n yield 3\nend\nfor v in g() do\n print(v)\nend\n",
        &[],
    );
    assert!(ok);
    assert_eq!(stdout, "1\n2\n3\n");
}

#[test]
fn test_sys_argv_prints_first_argument() {
    let (stdout, _, ok) = run_source("import sys for argv\nprint(argv[0])\n", &["hello"]);
    assert!(ok);
    assert_eq!(stdout, "hello\n");
}

#[test]
fn test_uncaught_exception_fails_with_trace() {
    let (_, stderr, ok) = run_source("raise TypeException(\"kaput\")\n", &[]);
    assert!(!ok);
    assert!(stderr.contains("TypeException"));
    assert!(stderr.contains("kaput"));
}

#[test]
fn test_syntax_error_reports_line() {
    let (_, stderr, ok) = run_source("var = 3\n", &[]);
    assert!(!ok);
    assert!(stderr.contains("main.brio"));
}

#[test]
fn test_eval_flag() {
    let output = Command::new(env!("CARGO_BIN_EXE_brio"))
        .arg("-e")
        .arg("print(2 ^ 10)")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "1024\n");
}

#[test]
fn test_string_output() {
    let (stdout, _, ok) = run_source("print(\"a\" + \"b\" + \"c\")\nprint([1, 2])\n", &[]);
    assert!(ok);
    assert_eq!(stdout, "abc\n[1, 2]\n");
}

#[test]
fn test_project_config_adds_import_path() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("lib")).unwrap();
    fs::write(dir.path().join("lib/extra.brio"), "var v = 11\n").unwrap();
    fs::write(dir.path().join("brio.toml"), "[project]\nimport-paths = [\"lib\"]\n").unwrap();
    let script = dir.path().join("main.brio");
    fs::write(&script, "import extra\nprint(extra.v)\n").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_brio")).arg(&script).output().unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "11\n");
}
