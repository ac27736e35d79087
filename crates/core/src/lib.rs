//! Brio core definitions
//!
//! Shared foundation for the Brio compiler and runtime:
//! - `Opcode`: the bytecode instruction set
//! - `FuncProto` / `Code` / `Const`: the compiled form of a function,
//!   plain data with no runtime state attached
//! - `serialize`: the `.bric` binary format for compiled function trees
//!
//! The compiler lowers an AST into a `FuncProto` tree; the runtime
//! instantiates that tree into heap objects when a module is loaded. Keeping
//! this crate free of runtime types means compiled output can be produced,
//! serialized, and inspected without a VM.

pub mod limits;
pub mod opcode;
pub mod proto;
pub mod serialize;

pub use opcode::Opcode;
pub use proto::{Code, Const, FuncProto, NativeProto};
pub use serialize::{deserialize, serialize, SerializeError, BYTECODE_MAJOR, BYTECODE_MINOR};
