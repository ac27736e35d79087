//! Human-readable bytecode listings.
//!
//! Used by `brioc disasm` and handy in tests when a generated sequence
//! doesn't do what you expect.

use brio_core::{Const, FuncProto, Opcode};
use std::fmt::Write;

/// Render a function and every nested function it carries.
pub fn disassemble(proto: &FuncProto) -> String {
    let mut out = String::new();
    disasm_func(proto, &mut out);
    out
}

fn disasm_func(proto: &FuncProto, out: &mut String) {
    let name = proto.name.as_deref().unwrap_or("<anonymous>");
    let _ = writeln!(
        out,
        "fn {} (arity {}{}{}, {} upvalues, max stack {})",
        name,
        proto.arity,
        if proto.vararg { ", vararg" } else { "" },
        if proto.is_generator { ", generator" } else { "" },
        proto.upvalues.len(),
        proto.max_stack,
    );

    let bytes = &proto.code.bytes;
    let mut at = 0;
    while at < bytes.len() {
        let Some(op) = Opcode::from_byte(bytes[at]) else {
            let _ = writeln!(out, "{:6}  ?? {:#04x}", at, bytes[at]);
            at += 1;
            continue;
        };
        let line = proto.code.line_at(at);
        let _ = write!(out, "{:6}  [{:4}] {:16}", at, line, op.name());
        let operands = &bytes[at + 1..at + 1 + op.operand_len()];
        match op {
            Opcode::GetConst
            | Opcode::DefineGlobal
            | Opcode::Import
            | Opcode::ImportAs
            | Opcode::ImportFrom
            | Opcode::DefMethod
            | Opcode::NewClass
            | Opcode::NewSubclass
            | Opcode::Closure => {
                let idx = u16::from_be_bytes([operands[0], operands[1]]) as usize;
                let _ = write!(out, " {} ({})", idx, proto.code.consts[idx]);
            }
            Opcode::GetGlobal | Opcode::SetGlobal | Opcode::GetField | Opcode::SetField => {
                let idx = u16::from_be_bytes([operands[0], operands[1]]) as usize;
                let cache = u16::from_be_bytes([operands[2], operands[3]]);
                let _ = write!(out, " {} ({}) cache {}", idx, proto.code.consts[idx], cache);
            }
            Opcode::ImportName | Opcode::NatMethod => {
                let a = u16::from_be_bytes([operands[0], operands[1]]) as usize;
                let b = u16::from_be_bytes([operands[2], operands[3]]) as usize;
                let _ = write!(
                    out,
                    " {} ({}) {} ({})",
                    a, proto.code.consts[a], b, proto.code.consts[b]
                );
            }
            Opcode::Jump | Opcode::JumpT | Opcode::JumpF => {
                let disp = i16::from_be_bytes([operands[0], operands[1]]) as i64;
                let target = (at as i64 + 3) + disp;
                let _ = write!(out, " -> {}", target);
            }
            Opcode::SetupExcept | Opcode::SetupEnsure => {
                let target = u16::from_be_bytes([operands[0], operands[1]]);
                let _ = write!(out, " -> {}", target);
            }
            Opcode::Invoke | Opcode::Super => {
                let idx = u16::from_be_bytes([operands[0], operands[1]]) as usize;
                let _ = write!(out, " {} ({}) argc {}", idx, proto.code.consts[idx], operands[2]);
            }
            _ if op.operand_len() == 2 && op.inline_argc().is_some() => {
                // Inline invoke/super variants carry just the name.
                let idx = u16::from_be_bytes([operands[0], operands[1]]) as usize;
                let _ = write!(out, " {} ({})", idx, proto.code.consts[idx]);
            }
            _ if op.operand_len() == 1 => {
                let _ = write!(out, " {}", operands[0]);
            }
            _ if op.operand_len() == 2 => {
                let _ = write!(out, " {}", u16::from_be_bytes([operands[0], operands[1]]));
            }
            _ => {}
        }
        at += 1 + op.operand_len();
        if op == Opcode::Closure {
            let idx = u16::from_be_bytes([operands[0], operands[1]]) as usize;
            if let Const::Func(p) = &proto.code.consts[idx] {
                for _ in 0..p.upvalues.len() {
                    let is_local = bytes[at] != 0;
                    let index = bytes[at + 1];
                    let _ = write!(
                        out,
                        " ({} {})",
                        if is_local { "local" } else { "upvalue" },
                        index
                    );
                    at += 2;
                }
            }
        }
        let _ = writeln!(out);
    }

    // Nested functions follow their parent.
    for c in &proto.code.consts {
        if let Const::Func(p) = c {
            let _ = writeln!(out);
            disasm_func(p, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disassemble_simple_module() {
        let proto = crate::compile("m", "var x = 1 + 2\nprint(x)").unwrap();
        let listing = disassemble(&proto);
        assert!(listing.contains("fn m"));
        assert!(listing.contains("get_const"));
        assert!(listing.contains("define_global"));
        assert!(listing.contains("call_1"));
    }

    #[test]
    fn test_disassemble_nested_function() {
        let proto = crate::compile("m", "fun f()\n return 1\nend").unwrap();
        let listing = disassemble(&proto);
        assert!(listing.contains("fn f"));
        assert!(listing.contains("closure"));
    }

    #[test]
    fn test_disassemble_jumps_show_targets() {
        let proto = crate::compile("m", "if true then print(1) end").unwrap();
        let listing = disassemble(&proto);
        assert!(listing.contains("jump_f ->") || listing.contains("jump_f  ->") || listing.contains("->"));
    }
}
