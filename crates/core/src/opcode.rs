//! The Brio bytecode instruction set.
//!
//! Single-byte opcodes with inline operands. Operand widths are fixed per
//! opcode and described by [`Opcode::operand_len`]; the only variable-length
//! instruction is `Closure`, which is followed by one `(is_local, index)`
//! byte pair per upvalue of the target prototype.
//!
//! Jump displacements are signed 16-bit, relative to the first byte after
//! the operand. Exception handler setup carries absolute 16-bit offsets.

/// One bytecode instruction.
///
/// Grouped the way the dispatcher handles them: arithmetic/comparison,
/// stack management, variable access, fields and subscripts, calls,
/// control flow, closures, exception handling, imports, and class/method
/// definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    // Arithmetic and comparison. Inline when both operands are numbers,
    // otherwise dispatched through the overload methods (`__add__`, ...).
    Add = 0,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Pow,
    Eq,
    Not,
    Gt,
    Ge,
    Lt,
    Le,
    /// Subclass membership test: `a is B`.
    Is,

    // Stack management.
    Pop,
    Dup,
    /// Push `null`.
    PushNull,
    /// Push constant; operand: u16 constant index.
    GetConst,
    /// Materialize exactly N values from an iterable; operand: u8 count.
    Unpack,
    /// Push a fresh empty list.
    NewList,
    /// Pop a value and append it to the list beneath it.
    AppendList,
    /// Pop N values into a fixed tuple; operand: u8 count.
    NewTuple,
    /// Push a fresh empty table.
    NewTable,

    // Variable access. Global access goes through a symbol cache slot so
    // repeated lookups skip the module name lookup.
    /// Operand: u8 slot.
    GetLocal,
    /// Operand: u8 slot.
    SetLocal,
    /// Operand: u8 upvalue index.
    GetUpvalue,
    /// Operand: u8 upvalue index.
    SetUpvalue,
    /// Operand: u16 name constant, u16 cache slot.
    GetGlobal,
    /// Operand: u16 name constant, u16 cache slot.
    SetGlobal,
    /// Operand: u16 name constant.
    DefineGlobal,

    // Fields and subscripts.
    /// Operand: u16 name constant, u16 cache slot.
    GetField,
    /// Operand: u16 name constant, u16 cache slot.
    SetField,
    /// `obj[key]`; pops key and object.
    SubscrGet,
    /// `obj[key] = v`; pops value, key and object, pushes the value back.
    SubscrSet,

    // Calls. The inline variants encode the argument count in the opcode.
    /// Operand: u8 argc.
    Call,
    Call0,
    Call1,
    Call2,
    Call3,
    Call4,
    Call5,
    Call6,
    Call7,
    Call8,
    Call9,
    Call10,
    /// Method invocation by name. Operand: u16 name constant, u8 argc.
    Invoke,
    /// Operand: u16 name constant.
    Invoke0,
    Invoke1,
    Invoke2,
    Invoke3,
    Invoke4,
    Invoke5,
    Invoke6,
    Invoke7,
    Invoke8,
    Invoke9,
    Invoke10,
    /// Super-class method call, bypassing the receiver's own class.
    /// Operand: u16 name constant, u8 argc.
    Super,
    /// Operand: u16 name constant.
    Super0,
    Super1,
    Super2,
    Super3,
    Super4,
    Super5,
    Super6,
    Super7,
    Super8,
    Super9,
    Super10,

    // Control flow. Operand: i16 displacement.
    Jump,
    /// Jump if truthy.
    JumpT,
    /// Jump if falsy.
    JumpF,
    Return,
    /// Suspend the current generator frame, yielding TOS to the resumer.
    Yield,

    // Closures.
    /// Operand: u16 constant index of the function, then one
    /// `(is_local: u8, index: u8)` pair per upvalue of that function.
    Closure,
    /// Promote the open upvalue for the local about to leave scope.
    CloseUpvalue,

    // Exception handling.
    /// Operand: u16 absolute handler offset.
    SetupExcept,
    /// Operand: u16 absolute handler offset.
    SetupEnsure,
    PopHandler,
    Raise,
    /// Inspect the unwind cause left on the stack by an `ensure` entry and
    /// either continue, rethrow, or complete a pending return.
    EnsureEnd,

    // Imports. Operand: u16 dotted-name constant (IMPORT_NAME adds a second
    // u16 for the member name).
    /// Import and push the module.
    Import,
    /// Import and push the module, for an `as` alias binding.
    ImportAs,
    /// Import without pushing (used for dotted prefixes and `for` imports).
    ImportFrom,
    /// Push one member of the most recently imported module.
    /// Operand: u16 module name constant, u16 member name constant.
    ImportName,

    // Class and method definition.
    /// Pop a closure, install it as a method on the class at TOS.
    /// Operand: u16 name constant.
    DefMethod,
    /// Install a pre-built native as a method on the class at TOS.
    /// Operand: u16 name constant, u16 native constant.
    NatMethod,
    /// Push a new class. Operand: u16 name constant.
    NewClass,
    /// Pop the superclass expression, push a new subclass.
    /// Operand: u16 name constant.
    NewSubclass,

    // Loop placeholders. Emitted for `break`/`continue` and rewritten to
    // `Jump` when the enclosing loop ends; same width as `Jump`.
    /// Operand: u16 placeholder.
    MarkBreak,
    /// Operand: u16 placeholder.
    MarkContinue,
}

/// Number of opcodes; also the first invalid opcode byte.
pub const OPCODE_COUNT: u8 = Opcode::MarkContinue as u8 + 1;

impl Opcode {
    /// Decode an opcode byte. Returns `None` for bytes outside the set.
    pub fn from_byte(b: u8) -> Option<Opcode> {
        if b < OPCODE_COUNT {
            // Contiguous discriminants starting at zero.
            Some(unsafe { std::mem::transmute::<u8, Opcode>(b) })
        } else {
            None
        }
    }

    /// Fixed operand length in bytes, excluding the `Closure` upvalue pairs.
    pub fn operand_len(self) -> usize {
        use Opcode::*;
        match self {
            GetConst | DefineGlobal | Jump | JumpT | JumpF | SetupExcept | SetupEnsure | Import
            | ImportAs | ImportFrom | DefMethod | NewClass | NewSubclass | MarkBreak
            | MarkContinue | Closure => 2,
            GetLocal | SetLocal | GetUpvalue | SetUpvalue | Call | Unpack | NewTuple => 1,
            GetGlobal | SetGlobal | GetField | SetField | ImportName | NatMethod => 4,
            Invoke0 | Invoke1 | Invoke2 | Invoke3 | Invoke4 | Invoke5 | Invoke6 | Invoke7
            | Invoke8 | Invoke9 | Invoke10 | Super0 | Super1 | Super2 | Super3 | Super4
            | Super5 | Super6 | Super7 | Super8 | Super9 | Super10 => 2,
            Invoke | Super => 3,
            _ => 0,
        }
    }

    /// Argument count encoded in an inline call opcode, if any.
    pub fn inline_argc(self) -> Option<u8> {
        use Opcode::*;
        match self {
            Call0 | Invoke0 | Super0 => Some(0),
            Call1 | Invoke1 | Super1 => Some(1),
            Call2 | Invoke2 | Super2 => Some(2),
            Call3 | Invoke3 | Super3 => Some(3),
            Call4 | Invoke4 | Super4 => Some(4),
            Call5 | Invoke5 | Super5 => Some(5),
            Call6 | Invoke6 | Super6 => Some(6),
            Call7 | Invoke7 | Super7 => Some(7),
            Call8 | Invoke8 | Super8 => Some(8),
            Call9 | Invoke9 | Super9 => Some(9),
            Call10 | Invoke10 | Super10 => Some(10),
            _ => None,
        }
    }

    /// Inline call opcode for `argc` arguments, offset from `base`
    /// (`Call0`, `Invoke0` or `Super0`). Falls back to `None` past 10.
    pub fn inline_call(base: Opcode, argc: u8) -> Option<Opcode> {
        if argc > crate::limits::MAX_INLINE_ARGS {
            return None;
        }
        Opcode::from_byte(base as u8 + argc)
    }

    /// Mnemonic used by the disassembler.
    pub fn name(self) -> &'static str {
        use Opcode::*;
        match self {
            Add => "add",
            Sub => "sub",
            Mul => "mul",
            Div => "div",
            Mod => "mod",
            Neg => "neg",
            Pow => "pow",
            Eq => "eq",
            Not => "not",
            Gt => "gt",
            Ge => "ge",
            Lt => "lt",
            Le => "le",
            Is => "is",
            Pop => "pop",
            Dup => "dup",
            PushNull => "push_null",
            GetConst => "get_const",
            Unpack => "unpack",
            NewList => "new_list",
            AppendList => "append_list",
            NewTuple => "new_tuple",
            NewTable => "new_table",
            GetLocal => "get_local",
            SetLocal => "set_local",
            GetUpvalue => "get_upvalue",
            SetUpvalue => "set_upvalue",
            GetGlobal => "get_global",
            SetGlobal => "set_global",
            DefineGlobal => "define_global",
            GetField => "get_field",
            SetField => "set_field",
            SubscrGet => "subscr_get",
            SubscrSet => "subscr_set",
            Call => "call",
            Call0 => "call_0",
            Call1 => "call_1",
            Call2 => "call_2",
            Call3 => "call_3",
            Call4 => "call_4",
            Call5 => "call_5",
            Call6 => "call_6",
            Call7 => "call_7",
            Call8 => "call_8",
            Call9 => "call_9",
            Call10 => "call_10",
            Invoke => "invoke",
            Invoke0 => "invoke_0",
            Invoke1 => "invoke_1",
            Invoke2 => "invoke_2",
            Invoke3 => "invoke_3",
            Invoke4 => "invoke_4",
            Invoke5 => "invoke_5",
            Invoke6 => "invoke_6",
            Invoke7 => "invoke_7",
            Invoke8 => "invoke_8",
            Invoke9 => "invoke_9",
            Invoke10 => "invoke_10",
            Super => "super",
            Super0 => "super_0",
            Super1 => "super_1",
            Super2 => "super_2",
            Super3 => "super_3",
            Super4 => "super_4",
            Super5 => "super_5",
            Super6 => "super_6",
            Super7 => "super_7",
            Super8 => "super_8",
            Super9 => "super_9",
            Super10 => "super_10",
            Jump => "jump",
            JumpT => "jump_t",
            JumpF => "jump_f",
            Return => "return",
            Yield => "yield",
            Closure => "closure",
            CloseUpvalue => "close_upvalue",
            SetupExcept => "setup_except",
            SetupEnsure => "setup_ensure",
            PopHandler => "pop_handler",
            Raise => "raise",
            EnsureEnd => "ensure_end",
            Import => "import",
            ImportAs => "import_as",
            ImportFrom => "import_from",
            ImportName => "import_name",
            DefMethod => "def_method",
            NatMethod => "nat_method",
            NewClass => "new_class",
            NewSubclass => "new_subclass",
            MarkBreak => "mark_break",
            MarkContinue => "mark_continue",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_bytes() {
        for b in 0..OPCODE_COUNT {
            let op = Opcode::from_byte(b).expect("valid opcode byte");
            assert_eq!(op as u8, b);
        }
        assert!(Opcode::from_byte(OPCODE_COUNT).is_none());
        assert!(Opcode::from_byte(255).is_none());
    }

    #[test]
    fn test_inline_call_selection() {
        assert_eq!(Opcode::inline_call(Opcode::Call0, 0), Some(Opcode::Call0));
        assert_eq!(Opcode::inline_call(Opcode::Call0, 7), Some(Opcode::Call7));
        assert_eq!(Opcode::inline_call(Opcode::Invoke0, 10), Some(Opcode::Invoke10));
        assert_eq!(Opcode::inline_call(Opcode::Super0, 3), Some(Opcode::Super3));
        assert_eq!(Opcode::inline_call(Opcode::Call0, 11), None);
    }

    #[test]
    fn test_inline_argc_matches_selection() {
        for argc in 0..=10u8 {
            let op = Opcode::inline_call(Opcode::Invoke0, argc).unwrap();
            assert_eq!(op.inline_argc(), Some(argc));
        }
        assert_eq!(Opcode::Call.inline_argc(), None);
    }

    #[test]
    fn test_placeholder_width_matches_jump() {
        // Loop sentinel rewriting overwrites the opcode in place; widths
        // must agree or every offset after the loop would shift.
        assert_eq!(Opcode::MarkBreak.operand_len(), Opcode::Jump.operand_len());
        assert_eq!(Opcode::MarkContinue.operand_len(), Opcode::Jump.operand_len());
    }
}
