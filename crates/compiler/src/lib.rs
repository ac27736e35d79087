//! Brio compiler library
//!
//! Lowers Brio source to bytecode in two stages: a recursive-descent parse
//! into an AST, then a single pass over the AST emitting a `FuncProto` tree
//! (see `brio-core`). The compiler performs no interning and touches no
//! runtime state; the runtime instantiates its output when a module loads.
//!
//! # Example
//!
//! ```rust,ignore
//! let proto = brio_compiler::compile("__main__", "print(1 + 2)")?;
//! let bytes = brio_core::serialize(&proto);
//! ```

pub mod ast;
pub mod codegen;
pub mod config;
pub mod disasm;
pub mod lexer;
pub mod parser;

pub use codegen::compile_module;
pub use config::ProjectConfig;
pub use disasm::disassemble;
pub use parser::Parser;

use brio_core::FuncProto;

/// A diagnostic produced while compiling one source buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    /// 1-indexed source line.
    pub line: u32,
    pub message: String,
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// Compile a source buffer into the root function of a module.
///
/// `name` is the dotted module name, used to label the root function in
/// stack traces. All diagnostics are collected; the proto is produced only
/// when there were none.
pub fn compile(name: &str, source: &str) -> Result<FuncProto, Vec<CompileError>> {
    let parser = Parser::new(source).map_err(|e| vec![e])?;
    let stmts = parser.parse()?;
    codegen::compile_module(name, &stmts)
}
