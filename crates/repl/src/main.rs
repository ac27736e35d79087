//! Brio CLI: run scripts, or talk to the VM interactively.
//!
//! `brio script.brio args...` runs a source or compiled file as
//! `__main__` with `sys.argv` seeded from the remaining arguments. With no
//! script, an interactive prompt starts; expression input prints its
//! value. Ctrl-C during evaluation raises `ProgramInterrupted` inside the
//! running program instead of killing the process.

use std::path::{Path, PathBuf};
use std::process;

use brio_compiler::ast::StmtKind;
use brio_compiler::{Parser as BrioParser, ProjectConfig};
use brio_runtime::{Vm, VmOptions};
use clap::Parser as ClapParser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

#[derive(ClapParser)]
#[command(name = "brio")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Brio interpreter - run scripts or start an interactive prompt", long_about = None)]
struct Cli {
    /// Script to run (.brio source or .bric bytecode); omit to start the
    /// interactive prompt
    script: Option<PathBuf>,

    /// Arguments exposed to the script as sys.argv
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,

    /// Evaluate a source snippet and exit
    #[arg(short = 'e', long = "eval", conflicts_with = "script")]
    eval: Option<String>,

    /// Extra module search paths (before brio.toml paths)
    #[arg(short = 'I', long = "import-path", value_name = "DIR")]
    import_paths: Vec<PathBuf>,

    /// Collect garbage at every allocation (debugging aid)
    #[arg(long)]
    gc_stress: bool,
}

fn main() {
    let cli = Cli::parse();

    let mut options = VmOptions::default();
    options.argv = cli.args.clone();
    options.stress_gc = cli.gc_stress;
    options.import_paths = cli.import_paths.clone();
    if let Some(script) = &cli.script {
        match ProjectConfig::discover(script) {
            Ok(Some(config)) => options.import_paths.extend(config.project.import_paths),
            Ok(None) => {}
            Err(e) => {
                eprintln!("{}", e);
                process::exit(1);
            }
        }
    }

    let mut vm = Vm::new(options);
    install_interrupt_handler(&vm);

    if let Some(source) = cli.eval {
        if vm.evaluate("<eval>", &source).is_err() {
            process::exit(1);
        }
        return;
    }

    match cli.script {
        Some(script) => run_script(&mut vm, &script),
        None => repl(&mut vm),
    }
}

#[cfg(unix)]
fn install_interrupt_handler(vm: &Vm) {
    let flag = vm.interrupt_handle();
    if let Err(e) = signal_hook::flag::register(signal_hook::consts::SIGINT, flag) {
        eprintln!("warning: could not install interrupt handler: {}", e);
    }
}

#[cfg(not(unix))]
fn install_interrupt_handler(_vm: &Vm) {}

fn run_script(vm: &mut Vm, script: &Path) {
    let path = script.to_string_lossy().into_owned();
    let is_binary = script.extension().is_some_and(|e| e == "bric");
    let result = if is_binary {
        match std::fs::read(script) {
            Ok(bytes) => vm.evaluate_bytecode("__main__", &path, &bytes),
            Err(e) => {
                eprintln!("{}: {}", path, e);
                process::exit(1);
            }
        }
    } else {
        match std::fs::read_to_string(script) {
            Ok(source) => vm.evaluate(&path, &source),
            Err(e) => {
                eprintln!("{}: {}", path, e);
                process::exit(1);
            }
        }
    };
    if result.is_err() {
        process::exit(1);
    }
}

fn history_path() -> Option<PathBuf> {
    let dir = dirs::data_dir()?.join("brio");
    std::fs::create_dir_all(&dir).ok()?;
    Some(dir.join("history.txt"))
}

fn repl(vm: &mut Vm) {
    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("cannot start interactive prompt: {}", e);
            process::exit(1);
        }
    };
    let history = history_path();
    if let Some(h) = &history {
        let _ = editor.load_history(h);
    }
    println!("brio {} (interactive; ctrl-d to exit)", env!("CARGO_PKG_VERSION"));

    loop {
        match editor.readline("brio> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);
                let source = wrap_expression(line);
                // Errors were already reported through the VM callback.
                let _ = vm.evaluate_module("__main__", "<stdin>", &source);
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("input error: {}", e);
                break;
            }
        }
    }

    if let Some(h) = &history {
        let _ = editor.save_history(h);
    }
}

/// Interactive nicety: a lone expression prints its value.
fn wrap_expression(line: &str) -> String {
    let Ok(parser) = BrioParser::new(line) else {
        return line.to_string();
    };
    match parser.parse() {
        Ok(stmts) if stmts.len() == 1 && matches!(stmts[0].kind, StmtKind::Expr(_)) => {
            format!("print({})", line)
        }
        _ => line.to_string(),
    }
}
