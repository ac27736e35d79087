//! Hard limits shared by the compiler and the interpreter.
//!
//! These are encoding limits, not tunables: operand widths in the bytecode
//! fix them, and the compiler rejects programs that exceed them so the
//! interpreter never has to range-check.

/// Maximum local variables per function frame (single-byte slot operand).
pub const MAX_LOCALS: usize = 255;

/// Maximum upvalues captured by one function (single-byte index operand).
pub const MAX_UPVALUES: usize = 255;

/// Maximum exception handlers registered at once in a single frame.
/// A `try` with both `except` and `ensure` consumes two entries.
pub const MAX_HANDLERS: usize = 6;

/// Maximum inline argument count with a dedicated opcode (`Call0`..`Call10`).
/// Larger argument lists fall back to the generic operand-carrying opcodes.
pub const MAX_INLINE_ARGS: u8 = 10;

/// Name of the method treated as a class constructor.
pub const CTOR_NAME: &str = "new";
