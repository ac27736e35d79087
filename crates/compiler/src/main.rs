//! Brio ahead-of-time compiler CLI
//!
//! Compiles `.brio` sources to `.bric` bytecode files, checks sources
//! without producing output, and prints bytecode listings.

use brio_compiler::{compile, disassemble};
use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{generate, Shell};
use std::io;
use std::path::{Path, PathBuf};
use std::process;

#[derive(ClapParser)]
#[command(name = "brioc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Brio compiler - compile .brio sources to bytecode", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a .brio file to a .bric bytecode file
    Build {
        /// Input .brio source file
        input: PathBuf,

        /// Output path (defaults to the input with a .bric extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Parse and compile sources, reporting diagnostics only
    Check {
        /// Input .brio source files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },

    /// Print a bytecode listing for a source or compiled file
    Disasm {
        /// Input .brio or .bric file
        input: PathBuf,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Commands::Build { input, output } => {
            let output = output.unwrap_or_else(|| input.with_extension("bric"));
            run_build(&input, &output);
        }
        Commands::Check { inputs } => run_check(&inputs),
        Commands::Disasm { input } => run_disasm(&input),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "brioc", &mut io::stdout());
        }
    }
}

fn module_name_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "__main__".to_string())
}

fn compile_path(path: &Path) -> Result<brio_core::FuncProto, ()> {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}: {}", path.display(), e);
            return Err(());
        }
    };
    match compile(&module_name_of(path), &source) {
        Ok(proto) => Ok(proto),
        Err(errors) => {
            for e in &errors {
                eprintln!("{}:{}", path.display(), e);
            }
            Err(())
        }
    }
}

fn run_build(input: &Path, output: &Path) {
    let Ok(proto) = compile_path(input) else {
        process::exit(1);
    };
    let bytes = brio_core::serialize(&proto);
    if let Err(e) = std::fs::write(output, bytes) {
        eprintln!("failed to write {}: {}", output.display(), e);
        process::exit(1);
    }
}

fn run_check(inputs: &[PathBuf]) {
    let mut failed = false;
    for input in inputs {
        if compile_path(input).is_err() {
            failed = true;
        }
    }
    if failed {
        process::exit(1);
    }
}

fn run_disasm(input: &Path) {
    let is_binary = input.extension().is_some_and(|e| e == "bric");
    let proto = if is_binary {
        let bytes = match std::fs::read(input) {
            Ok(b) => b,
            Err(e) => {
                eprintln!("{}: {}", input.display(), e);
                process::exit(1);
            }
        };
        match brio_core::deserialize(&bytes) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("{}: {}", input.display(), e);
                process::exit(1);
            }
        }
    } else {
        match compile_path(input) {
            Ok(p) => p,
            Err(()) => process::exit(1),
        }
    };
    print!("{}", disassemble(&proto));
}
