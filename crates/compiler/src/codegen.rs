//! Single-pass bytecode generation.
//!
//! Walks the AST once, emitting into a `FuncProto` per function. Nested
//! function bodies open a child context on an explicit context stack; upvalue
//! resolution recurses up that stack by index, creating intermediate upvalue
//! entries at every level between the capture site and the captured local.
//!
//! Storage classes, resolved in order: local (reverse scan of the current
//! context's locals), upvalue (recursive scan of enclosing contexts), global
//! (by name through the owning module's field index, with a symbol-cache
//! slot allocated per access site).

use std::collections::HashMap;

use brio_core::limits::{CTOR_NAME, MAX_HANDLERS, MAX_LOCALS, MAX_UPVALUES};
use brio_core::proto::UpvalueDesc;
use brio_core::{Const, FuncProto, Opcode};

use crate::ast::{
    BinOp, ConstLit, Expr, ExprKind, FunBody, LValue, Method, NativeDecl, Param, Stmt, StmtKind,
    UnOp,
};
use crate::CompileError;

/// Compile a parsed module body into its root function.
///
/// The root function takes no arguments, runs the module top level, and
/// returns `null`.
pub fn compile_module(name: &str, stmts: &[Stmt]) -> Result<FuncProto, Vec<CompileError>> {
    let mut gen = CodeGen { ctxs: Vec::new(), errors: Vec::new() };
    gen.ctxs.push(FnCtx::new(Some(name.to_string()), FnKind::Module, &[], false));

    for stmt in stmts {
        gen.statement(stmt);
    }
    let last_line = stmts.last().map(|s| s.line).unwrap_or(1);
    gen.emit(Opcode::PushNull, last_line);
    gen.grow(1);
    gen.emit(Opcode::Return, last_line);
    gen.shrink(1);

    let ctx = gen.ctxs.pop().expect("module context");
    if gen.errors.is_empty() {
        Ok(ctx.finish())
    } else {
        Err(gen.errors)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FnKind {
    Module,
    Function,
    Method,
    Ctor,
}

struct Local {
    name: String,
    depth: u32,
    initialized: bool,
    captured: bool,
}

struct LoopCtx {
    /// Bytecode offset `continue` jumps back to.
    continue_target: usize,
    /// Offset of the first body byte; sentinel rewriting scans from here.
    body_start: usize,
    scope_depth: u32,
    /// Handler nesting at loop entry; break/continue may not cross it.
    handler_depth: usize,
}

struct FnCtx {
    proto: FuncProto,
    kind: FnKind,
    locals: Vec<Local>,
    scope_depth: u32,
    loops: Vec<LoopCtx>,
    handler_depth: usize,
    /// Operand values above the locals, for peak-usage tracking.
    stack: usize,
    peak: usize,
    str_consts: HashMap<String, u16>,
    num_consts: HashMap<u64, u16>,
}

impl FnCtx {
    fn new(name: Option<String>, kind: FnKind, params: &[Param], vararg: bool) -> FnCtx {
        let arity = params.len().saturating_sub(usize::from(vararg)) as u8;
        let mut proto = FuncProto::new(name, arity, vararg);
        proto.defaults = params
            .iter()
            .filter_map(|p| p.default.as_ref())
            .map(const_of_lit)
            .collect();

        // Slot 0 belongs to the callee; methods read it as `this`.
        let slot0 = match kind {
            FnKind::Method | FnKind::Ctor => "this",
            _ => "",
        };
        let mut locals = vec![Local {
            name: slot0.to_string(),
            depth: 0,
            initialized: true,
            captured: false,
        }];
        for p in params {
            locals.push(Local {
                name: p.name.clone(),
                depth: 0,
                initialized: true,
                captured: false,
            });
        }
        let peak = locals.len();
        FnCtx {
            proto,
            kind,
            locals,
            scope_depth: 0,
            loops: Vec::new(),
            handler_depth: 0,
            stack: 0,
            peak,
            str_consts: HashMap::new(),
            num_consts: HashMap::new(),
        }
    }

    fn finish(mut self) -> FuncProto {
        self.proto.max_stack = self.peak.min(u16::MAX as usize) as u16;
        self.proto
    }
}

fn const_of_lit(lit: &ConstLit) -> Const {
    match lit {
        ConstLit::Null => Const::Null,
        ConstLit::Bool(b) => Const::Bool(*b),
        ConstLit::Num(n) => Const::Num(*n),
        ConstLit::Str(s) => Const::Str(s.clone()),
    }
}

enum Storage {
    Local(u8),
    Upvalue(u8),
    Global,
}

pub(crate) struct CodeGen {
    ctxs: Vec<FnCtx>,
    errors: Vec<CompileError>,
}

impl CodeGen {
    fn cur(&mut self) -> &mut FnCtx {
        self.ctxs.last_mut().expect("active context")
    }

    fn error(&mut self, line: u32, message: impl Into<String>) {
        self.errors.push(CompileError { line, message: message.into() });
    }

    // ---- emission ----

    fn emit(&mut self, op: Opcode, line: u32) {
        let ctx = self.cur();
        ctx.proto.code.bytes.push(op as u8);
        ctx.proto.code.lines.push(line);
    }

    fn emit_u8(&mut self, b: u8, line: u32) {
        let ctx = self.cur();
        ctx.proto.code.bytes.push(b);
        ctx.proto.code.lines.push(line);
    }

    fn emit_u16(&mut self, v: u16, line: u32) {
        let [a, b] = v.to_be_bytes();
        self.emit_u8(a, line);
        self.emit_u8(b, line);
    }

    fn offset(&mut self) -> usize {
        self.cur().proto.code.bytes.len()
    }

    fn grow(&mut self, n: usize) {
        let ctx = self.cur();
        ctx.stack += n;
        ctx.peak = ctx.peak.max(ctx.locals.len() + ctx.stack);
    }

    fn shrink(&mut self, n: usize) {
        let ctx = self.cur();
        debug_assert!(ctx.stack >= n, "operand stack underflow in codegen");
        ctx.stack = ctx.stack.saturating_sub(n);
    }

    fn add_const(&mut self, c: Const, line: u32) -> u16 {
        let ctx = self.cur();
        match &c {
            Const::Str(s) => {
                if let Some(&idx) = ctx.str_consts.get(s) {
                    return idx;
                }
            }
            Const::Num(n) => {
                if let Some(&idx) = ctx.num_consts.get(&n.to_bits()) {
                    return idx;
                }
            }
            _ => {}
        }
        if ctx.proto.code.consts.len() >= u16::MAX as usize {
            self.error(line, "too many constants in one function");
            return 0;
        }
        let ctx = self.cur();
        let idx = ctx.proto.code.consts.len() as u16;
        match &c {
            Const::Str(s) => {
                ctx.str_consts.insert(s.clone(), idx);
            }
            Const::Num(n) => {
                ctx.num_consts.insert(n.to_bits(), idx);
            }
            _ => {}
        }
        ctx.proto.code.consts.push(c);
        idx
    }

    fn str_const(&mut self, s: &str, line: u32) -> u16 {
        self.add_const(Const::Str(s.to_string()), line)
    }

    fn cache_slot(&mut self) -> u16 {
        let ctx = self.cur();
        let slot = ctx.proto.cache_count;
        ctx.proto.cache_count = ctx.proto.cache_count.wrapping_add(1);
        slot
    }

    /// Emit a forward jump; returns the operand offset for `patch_jump`.
    fn emit_jump(&mut self, op: Opcode, line: u32) -> usize {
        self.emit(op, line);
        let at = self.offset();
        self.emit_u16(0xFFFF, line);
        at
    }

    fn patch_jump(&mut self, operand_at: usize) {
        let target = self.offset();
        self.patch_jump_to(operand_at, target);
    }

    fn patch_jump_to(&mut self, operand_at: usize, target: usize) {
        // Displacement is relative to the first byte after the operand.
        let disp = target as i64 - (operand_at as i64 + 2);
        if disp > i16::MAX as i64 || disp < i16::MIN as i64 {
            let line = self.cur().proto.code.line_at(operand_at);
            self.error(line, "jump distance exceeds 32k bytes");
            return;
        }
        let [a, b] = (disp as i16).to_be_bytes();
        let ctx = self.cur();
        ctx.proto.code.bytes[operand_at] = a;
        ctx.proto.code.bytes[operand_at + 1] = b;
    }

    /// Backward jump to a known target.
    fn emit_loop(&mut self, target: usize, line: u32) {
        self.emit(Opcode::Jump, line);
        let at = self.offset();
        self.emit_u16(0, line);
        self.patch_jump_to(at, target);
    }

    // ---- scopes and variables ----

    fn begin_scope(&mut self) {
        self.cur().scope_depth += 1;
    }

    /// Close a scope, emitting `Pop`/`CloseUpvalue` for every local that
    /// leaves it.
    fn end_scope(&mut self, line: u32) {
        self.cur().scope_depth -= 1;
        let depth = self.cur().scope_depth;
        loop {
            let op = match self.ctxs.last().expect("active context").locals.last() {
                Some(l) if l.depth > depth => {
                    if l.captured {
                        Opcode::CloseUpvalue
                    } else {
                        Opcode::Pop
                    }
                }
                _ => break,
            };
            self.cur().locals.pop();
            self.emit(op, line);
        }
    }

    /// Emit scope-exit pops down to `to_depth` without forgetting the
    /// locals; used by break/continue, which jump out of scopes the
    /// compiler is still inside.
    fn emit_scope_exit(&mut self, to_depth: u32, line: u32) {
        let ops: Vec<Opcode> = self
            .ctxs
            .last()
            .expect("active context")
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth > to_depth)
            .map(|l| if l.captured { Opcode::CloseUpvalue } else { Opcode::Pop })
            .collect();
        for op in ops {
            self.emit(op, line);
        }
    }

    /// Reserve the next stack slot as a named local. The value that the
    /// following expression leaves on the stack becomes the local's storage.
    fn declare_local(&mut self, name: &str, initialized: bool, line: u32) {
        let ctx = self.cur();
        if ctx.locals.len() > MAX_LOCALS {
            self.error(line, "too many local variables in function");
            return;
        }
        let depth = ctx.scope_depth;
        let shadows = ctx
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth == depth)
            .any(|l| l.name == name);
        if shadows {
            self.error(line, format!("variable '{}' already declared in this scope", name));
            return;
        }
        self.cur().locals.push(Local {
            name: name.to_string(),
            depth,
            initialized,
            captured: false,
        });
        let ctx = self.cur();
        ctx.peak = ctx.peak.max(ctx.locals.len() + ctx.stack);
    }

    /// Convert the N most recently pushed operand values into the storage
    /// of the N most recently declared locals.
    fn absorb_operands(&mut self, n: usize) {
        self.shrink(n);
    }

    fn mark_initialized(&mut self, n: usize) {
        let ctx = self.cur();
        let len = ctx.locals.len();
        for local in &mut ctx.locals[len - n..] {
            local.initialized = true;
        }
    }

    fn at_module_scope(&self) -> bool {
        let ctx = self.ctxs.last().expect("active context");
        ctx.kind == FnKind::Module && ctx.scope_depth == 0
    }

    fn resolve_local_in(&mut self, ctx_idx: usize, name: &str, line: u32) -> Option<u8> {
        let found = self.ctxs[ctx_idx]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| l.name == name)
            .map(|(slot, l)| (slot, l.initialized));
        let (slot, initialized) = found?;
        if !initialized {
            self.error(line, format!("cannot read local '{}' in its own initializer", name));
        }
        Some(slot as u8)
    }

    fn add_upvalue(&mut self, ctx_idx: usize, index: u8, is_local: bool, line: u32) -> u8 {
        let ctx = &mut self.ctxs[ctx_idx];
        for (i, up) in ctx.proto.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u8;
            }
        }
        if ctx.proto.upvalues.len() >= MAX_UPVALUES {
            self.error(line, "too many captured variables in function");
            return 0;
        }
        let ctx = &mut self.ctxs[ctx_idx];
        ctx.proto.upvalues.push(UpvalueDesc { is_local, index });
        (ctx.proto.upvalues.len() - 1) as u8
    }

    fn resolve_upvalue(&mut self, ctx_idx: usize, name: &str, line: u32) -> Option<u8> {
        if ctx_idx == 0 {
            return None;
        }
        let parent = ctx_idx - 1;
        if let Some(slot) = self.resolve_local_in(parent, name, line) {
            self.ctxs[parent].locals[slot as usize].captured = true;
            return Some(self.add_upvalue(ctx_idx, slot, true, line));
        }
        if let Some(up) = self.resolve_upvalue(parent, name, line) {
            return Some(self.add_upvalue(ctx_idx, up, false, line));
        }
        None
    }

    fn resolve(&mut self, name: &str, line: u32) -> Storage {
        let cur_idx = self.ctxs.len() - 1;
        if let Some(slot) = self.resolve_local_in(cur_idx, name, line) {
            return Storage::Local(slot);
        }
        if let Some(up) = self.resolve_upvalue(cur_idx, name, line) {
            return Storage::Upvalue(up);
        }
        Storage::Global
    }

    /// Bind the value on TOS to `name`: a global definition at module scope,
    /// otherwise the value becomes a new local.
    fn define_variable(&mut self, name: &str, line: u32) {
        if self.at_module_scope() {
            let idx = self.str_const(name, line);
            self.emit(Opcode::DefineGlobal, line);
            self.emit_u16(idx, line);
            self.shrink(1);
        } else {
            self.declare_local(name, true, line);
            self.absorb_operands(1);
        }
    }

    /// Store TOS into an already-resolved name (assignment, not definition).
    fn store_variable(&mut self, name: &str, line: u32) {
        match self.resolve(name, line) {
            Storage::Local(slot) => {
                self.emit(Opcode::SetLocal, line);
                self.emit_u8(slot, line);
            }
            Storage::Upvalue(idx) => {
                self.emit(Opcode::SetUpvalue, line);
                self.emit_u8(idx, line);
            }
            Storage::Global => {
                let idx = self.str_const(name, line);
                let cache = self.cache_slot();
                self.emit(Opcode::SetGlobal, line);
                self.emit_u16(idx, line);
                self.emit_u16(cache, line);
            }
        }
        self.shrink(1);
    }

    // ---- statements ----

    fn statement(&mut self, stmt: &Stmt) {
        let line = stmt.line;
        match &stmt.kind {
            StmtKind::VarDecl { names, init } => self.var_decl(names, init, line),
            StmtKind::FunDecl(body) => self.fun_decl(body),
            StmtKind::NativeFunDecl(native) => {
                let idx = self.add_const(Const::Native(native_proto(native)), native.line);
                self.emit(Opcode::GetConst, native.line);
                self.emit_u16(idx, native.line);
                self.grow(1);
                self.define_variable(&native.name, native.line);
            }
            StmtKind::ClassDecl { name, superclass, methods, line } => {
                self.class_decl(name, superclass.as_ref(), methods, *line)
            }
            StmtKind::If { branches, else_body } => self.if_stmt(branches, else_body.as_deref(), line),
            StmtKind::While { cond, body } => self.while_stmt(cond, body, line),
            StmtKind::For { targets, iterable, body } => {
                self.for_stmt(targets, iterable, body, line)
            }
            StmtKind::Return(value) => self.return_stmt(value.as_ref(), line),
            StmtKind::Raise(exc) => {
                self.expression(exc);
                self.emit(Opcode::Raise, line);
                self.shrink(1);
            }
            StmtKind::Try { body, handlers, ensure } => {
                self.try_stmt(body, handlers, ensure.as_deref(), line)
            }
            StmtKind::Break => self.break_stmt(line, Opcode::MarkBreak),
            StmtKind::Continue => self.break_stmt(line, Opcode::MarkContinue),
            StmtKind::Import { module, alias, names } => {
                self.import_stmt(module, alias.as_deref(), names, line)
            }
            StmtKind::Block(body) => {
                self.begin_scope();
                for s in body {
                    self.statement(s);
                }
                self.end_scope(line);
            }
            StmtKind::Assign { targets, values } => self.assign_stmt(targets, values, line),
            StmtKind::Expr(e) => {
                self.expression(e);
                self.emit(Opcode::Pop, e.line);
                self.shrink(1);
            }
        }
    }

    fn var_decl(&mut self, names: &[String], init: &[Expr], line: u32) {
        if self.at_module_scope() {
            // Globals: evaluate everything, then bind in reverse so the
            // last value ends up under the last name.
            if init.is_empty() {
                for _ in names {
                    self.emit(Opcode::PushNull, line);
                    self.grow(1);
                }
            } else if init.len() == names.len() {
                for e in init {
                    self.expression(e);
                }
            } else {
                self.expression(&init[0]);
                self.emit_unpack(names.len(), line);
            }
            for name in names.iter().rev() {
                let idx = self.str_const(name, line);
                self.emit(Opcode::DefineGlobal, line);
                self.emit_u16(idx, line);
                self.shrink(1);
            }
        } else {
            // Locals: declare first (uninitialized) so self-reads in the
            // initializer are flagged; each value lands in its own slot.
            for name in names {
                self.declare_local(name, false, line);
            }
            if init.is_empty() {
                for _ in names {
                    self.emit(Opcode::PushNull, line);
                    self.grow(1);
                }
            } else if init.len() == names.len() {
                for e in init {
                    self.expression(e);
                }
            } else {
                self.expression(&init[0]);
                self.emit_unpack(names.len(), line);
            }
            self.mark_initialized(names.len());
            self.absorb_operands(names.len());
        }
    }

    fn emit_unpack(&mut self, n: usize, line: u32) {
        self.emit(Opcode::Unpack, line);
        self.emit_u8(n as u8, line);
        self.shrink(1);
        self.grow(n);
    }

    fn fun_decl(&mut self, body: &FunBody) {
        let line = body.line;
        if self.at_module_scope() {
            self.function(body, FnKind::Function);
            let name = body.name.clone().expect("named function declaration");
            self.define_variable(&name, line);
        } else {
            // Declare before compiling so the body can call itself.
            let name = body.name.clone().expect("named function declaration");
            self.declare_local(&name, true, line);
            self.function(body, FnKind::Function);
            self.absorb_operands(1);
        }
    }

    /// Compile a function body in a child context and emit the `Closure`
    /// instruction that instantiates it.
    fn function(&mut self, body: &FunBody, kind: FnKind) {
        let line = body.line;
        if body.params.len() > MAX_LOCALS - 1 {
            self.error(line, "too many parameters");
        }
        self.ctxs.push(FnCtx::new(body.name.clone(), kind, &body.params, body.vararg));
        for stmt in &body.body {
            self.statement(stmt);
        }
        let end_line = body.body.last().map(|s| s.line).unwrap_or(line);
        if kind == FnKind::Ctor {
            self.emit(Opcode::GetLocal, end_line);
            self.emit_u8(0, end_line);
        } else {
            self.emit(Opcode::PushNull, end_line);
        }
        self.grow(1);
        self.emit(Opcode::Return, end_line);
        self.shrink(1);

        let ctx = self.ctxs.pop().expect("function context");
        let proto = ctx.finish();
        let upvalues = proto.upvalues.clone();
        let idx = self.add_const(Const::Func(Box::new(proto)), line);
        self.emit(Opcode::Closure, line);
        self.emit_u16(idx, line);
        for up in &upvalues {
            self.emit_u8(u8::from(up.is_local), line);
            self.emit_u8(up.index, line);
        }
        self.grow(1);
    }

    fn class_decl(&mut self, name: &str, superclass: Option<&Expr>, methods: &[Method], line: u32) {
        let name_idx = self.str_const(name, line);
        match superclass {
            Some(sup) => {
                self.expression(sup);
                self.emit(Opcode::NewSubclass, line);
                self.emit_u16(name_idx, line);
                // Pops the superclass, pushes the class.
            }
            None => {
                self.emit(Opcode::NewClass, line);
                self.emit_u16(name_idx, line);
                self.grow(1);
            }
        }

        for method in methods {
            match method {
                Method::Script(body) => {
                    let mname = body.name.clone().expect("named method");
                    let kind = if mname == CTOR_NAME { FnKind::Ctor } else { FnKind::Method };
                    self.function(body, kind);
                    let midx = self.str_const(&mname, body.line);
                    self.emit(Opcode::DefMethod, body.line);
                    self.emit_u16(midx, body.line);
                    self.shrink(1);
                }
                Method::Native(native) => {
                    // The runtime resolves the implementation through the
                    // module's native registry under "ClassName.method".
                    let mut proto = native_proto(native);
                    proto.name = format!("{}.{}", name, native.name);
                    let cidx = self.add_const(Const::Native(proto), native.line);
                    let midx = self.str_const(&native.name, native.line);
                    self.emit(Opcode::NatMethod, native.line);
                    self.emit_u16(midx, native.line);
                    self.emit_u16(cidx, native.line);
                }
            }
        }
        self.define_variable(name, line);
    }

    fn if_stmt(&mut self, branches: &[(Expr, Vec<Stmt>)], else_body: Option<&[Stmt]>, line: u32) {
        let mut end_jumps = Vec::new();
        for (i, (cond, body)) in branches.iter().enumerate() {
            self.expression(cond);
            let skip = self.emit_jump(Opcode::JumpF, cond.line);
            self.shrink(1);
            self.begin_scope();
            for s in body {
                self.statement(s);
            }
            self.end_scope(line);
            let is_last = i == branches.len() - 1 && else_body.is_none();
            if !is_last {
                end_jumps.push(self.emit_jump(Opcode::Jump, line));
            }
            self.patch_jump(skip);
        }
        if let Some(body) = else_body {
            self.begin_scope();
            for s in body {
                self.statement(s);
            }
            self.end_scope(line);
        }
        for j in end_jumps {
            self.patch_jump(j);
        }
    }

    fn while_stmt(&mut self, cond: &Expr, body: &[Stmt], line: u32) {
        let continue_target = self.offset();
        self.expression(cond);
        let exit = self.emit_jump(Opcode::JumpF, cond.line);
        self.shrink(1);

        let body_start = self.offset();
        let (scope_depth, handler_depth) = {
            let ctx = self.cur();
            (ctx.scope_depth, ctx.handler_depth)
        };
        self.cur().loops.push(LoopCtx { continue_target, body_start, scope_depth, handler_depth });

        self.begin_scope();
        for s in body {
            self.statement(s);
        }
        self.end_scope(line);
        self.emit_loop(continue_target, line);

        self.patch_jump(exit);
        self.finish_loop(line);
    }

    fn for_stmt(&mut self, targets: &[String], iterable: &Expr, body: &[Stmt], line: u32) {
        // Hidden locals hold the sequence and the iterator state; the
        // protocol is `seq.__iter__(state)` advancing to the next state
        // (falsy when exhausted) and `seq.__next__(state)` fetching the
        // element for the current state.
        self.begin_scope();
        self.declare_local("(seq)", true, line);
        self.expression(iterable);
        self.absorb_operands(1);
        self.declare_local("(state)", true, line);
        self.emit(Opcode::PushNull, line);
        self.grow(1);
        self.absorb_operands(1);

        let seq_slot = (self.cur().locals.len() - 2) as u8;
        let state_slot = (self.cur().locals.len() - 1) as u8;

        let continue_target = self.offset();
        let iter_idx = self.str_const("__iter__", line);
        let next_idx = self.str_const("__next__", line);

        self.emit(Opcode::GetLocal, line);
        self.emit_u8(seq_slot, line);
        self.emit(Opcode::GetLocal, line);
        self.emit_u8(state_slot, line);
        self.grow(2);
        self.emit(Opcode::Invoke1, line);
        self.emit_u16(iter_idx, line);
        self.shrink(1);
        self.emit(Opcode::Dup, line);
        self.grow(1);
        self.emit(Opcode::SetLocal, line);
        self.emit_u8(state_slot, line);
        self.shrink(1);
        let exit = self.emit_jump(Opcode::JumpF, line);
        self.shrink(1);

        self.emit(Opcode::GetLocal, line);
        self.emit_u8(seq_slot, line);
        self.emit(Opcode::GetLocal, line);
        self.emit_u8(state_slot, line);
        self.grow(2);
        self.emit(Opcode::Invoke1, line);
        self.emit_u16(next_idx, line);
        self.shrink(1);

        let body_start = self.offset();
        let (scope_depth, handler_depth) = {
            let ctx = self.cur();
            (ctx.scope_depth, ctx.handler_depth)
        };
        self.cur().loops.push(LoopCtx { continue_target, body_start, scope_depth, handler_depth });

        self.begin_scope();
        if targets.len() == 1 {
            self.declare_local(&targets[0], true, line);
            self.absorb_operands(1);
        } else {
            self.emit_unpack(targets.len(), line);
            for t in targets {
                self.declare_local(t, true, line);
            }
            self.absorb_operands(targets.len());
        }
        for s in body {
            self.statement(s);
        }
        self.end_scope(line);
        self.emit_loop(continue_target, line);

        self.patch_jump(exit);
        self.finish_loop(line);
        self.end_scope(line); // pops (state) and (seq)
    }

    /// Rewrite break/continue sentinels emitted in the finished loop body.
    fn finish_loop(&mut self, _line: u32) {
        let loop_ctx = self.cur().loops.pop().expect("active loop");
        let end = self.offset();
        let mut at = loop_ctx.body_start;
        while at < end {
            let byte = self.cur().proto.code.bytes[at];
            let op = Opcode::from_byte(byte).expect("valid opcode in own output");
            match op {
                Opcode::MarkBreak => {
                    self.cur().proto.code.bytes[at] = Opcode::Jump as u8;
                    self.patch_jump_to(at + 1, end);
                }
                Opcode::MarkContinue => {
                    self.cur().proto.code.bytes[at] = Opcode::Jump as u8;
                    self.patch_jump_to(at + 1, loop_ctx.continue_target);
                }
                _ => {}
            }
            at += 1 + op.operand_len();
            if op == Opcode::Closure {
                // Skip the trailing upvalue pairs; their count lives in the
                // referenced prototype.
                let hi = self.cur().proto.code.bytes[at - 2];
                let lo = self.cur().proto.code.bytes[at - 1];
                let idx = u16::from_be_bytes([hi, lo]) as usize;
                if let Const::Func(p) = &self.cur().proto.code.consts[idx] {
                    at += 2 * p.upvalues.len();
                }
            }
        }
    }

    fn break_stmt(&mut self, line: u32, mark: Opcode) {
        let Some(top) = self.cur().loops.last() else {
            let what = if mark == Opcode::MarkBreak { "break" } else { "continue" };
            self.error(line, format!("'{}' outside of a loop", what));
            return;
        };
        let scope_depth = top.scope_depth;
        let handler_depth = top.handler_depth;
        if self.cur().handler_depth > handler_depth {
            let what = if mark == Opcode::MarkBreak { "break" } else { "continue" };
            self.error(line, format!("'{}' cannot cross a try block", what));
            return;
        }
        self.emit_scope_exit(scope_depth, line);
        self.emit(mark, line);
        self.emit_u16(0xFFFF, line);
    }

    fn return_stmt(&mut self, value: Option<&Expr>, line: u32) {
        if self.cur().kind == FnKind::Module {
            self.error(line, "cannot return from the top level of a module");
            return;
        }
        match value {
            Some(e) if self.cur().kind == FnKind::Ctor => {
                self.error(e.line, "cannot return a value from a constructor");
                return;
            }
            Some(e) => self.expression(e),
            None => {
                if self.cur().kind == FnKind::Ctor {
                    self.emit(Opcode::GetLocal, line);
                    self.emit_u8(0, line);
                } else {
                    self.emit(Opcode::PushNull, line);
                }
                self.grow(1);
            }
        }
        self.emit(Opcode::Return, line);
        self.shrink(1);
    }

    fn try_stmt(
        &mut self,
        body: &[Stmt],
        handlers: &[crate::ast::ExceptClause],
        ensure: Option<&[Stmt]>,
        line: u32,
    ) {
        let has_except = !handlers.is_empty();
        let has_ensure = ensure.is_some();
        let needed = usize::from(has_except) + usize::from(has_ensure);
        if self.cur().handler_depth + needed > MAX_HANDLERS {
            self.error(line, "too many nested try blocks");
            return;
        }

        let ensure_setup = if has_ensure {
            let at = self.emit_jump(Opcode::SetupEnsure, line);
            self.cur().handler_depth += 1;
            Some(at)
        } else {
            None
        };
        let except_setup = if has_except {
            let at = self.emit_jump(Opcode::SetupExcept, line);
            self.cur().handler_depth += 1;
            Some(at)
        } else {
            None
        };

        self.begin_scope();
        for s in body {
            self.statement(s);
        }
        self.end_scope(line);

        let mut join_jumps = Vec::new();
        if let Some(setup_at) = except_setup {
            self.emit(Opcode::PopHandler, line);
            self.cur().handler_depth -= 1;
            join_jumps.push(self.emit_jump(Opcode::Jump, line));

            // Handler entry: the unwinder restored the stack and pushed
            // the in-flight exception.
            let target = self.offset();
            self.patch_abs(setup_at, target);
            self.grow(1);
            let entry_stack = self.cur().stack;
            for clause in handlers {
                self.emit(Opcode::Dup, clause.line);
                self.grow(1);
                self.expression(&clause.class);
                self.emit(Opcode::Is, clause.line);
                self.shrink(1);
                let next = self.emit_jump(Opcode::JumpF, clause.line);
                self.shrink(1);

                // The exception value becomes the bound local, scoped to
                // the clause body.
                self.begin_scope();
                self.declare_local(&clause.var, true, clause.line);
                self.absorb_operands(1);
                for s in &clause.body {
                    self.statement(s);
                }
                self.end_scope(clause.line);
                join_jumps.push(self.emit_jump(Opcode::Jump, clause.line));
                self.patch_jump(next);
                // The unmatched path still holds the exception.
                self.cur().stack = entry_stack;
            }
            // No clause matched: keep unwinding.
            self.emit(Opcode::Raise, line);
            self.shrink(1);
        }

        for j in join_jumps {
            self.patch_jump(j);
        }

        if let Some(setup_at) = ensure_setup {
            let ensure_body = ensure.expect("ensure body");
            self.emit(Opcode::PopHandler, line);
            self.cur().handler_depth -= 1;
            // Normal completion: null cause, null payload.
            self.emit(Opcode::PushNull, line);
            self.emit(Opcode::PushNull, line);
            self.grow(2);

            let target = self.offset();
            self.patch_abs(setup_at, target);

            // The payload/cause pair become hidden locals so body locals
            // stack above them; EnsureEnd consumes both.
            self.begin_scope();
            self.declare_local("(unwind value)", true, line);
            self.declare_local("(unwind cause)", true, line);
            self.absorb_operands(2);
            // The body gets its own scope: any locals it declares sit
            // above the hidden pair and must be popped by ordinary
            // opcodes before EnsureEnd reads the top two slots.
            self.begin_scope();
            for s in ensure_body {
                self.statement(s);
            }
            let end_line = ensure_body.last().map(|s| s.line).unwrap_or(line);
            self.end_scope(end_line);
            self.emit(Opcode::EnsureEnd, end_line);
            // Only the hidden pair is left; EnsureEnd pops both slots at
            // runtime, so they leave the compiler's tracking silently.
            let ctx = self.cur();
            ctx.scope_depth -= 1;
            ctx.locals.pop();
            ctx.locals.pop();
        }
    }

    /// Patch a `SetupExcept`/`SetupEnsure` operand with an absolute offset.
    fn patch_abs(&mut self, operand_at: usize, target: usize) {
        let [a, b] = (target as u16).to_be_bytes();
        let ctx = self.cur();
        ctx.proto.code.bytes[operand_at] = a;
        ctx.proto.code.bytes[operand_at + 1] = b;
    }

    fn import_stmt(&mut self, module: &str, alias: Option<&str>, names: &[String], line: u32) {
        let segments: Vec<&str> = module.split('.').collect();
        let prefixes: Vec<String> = (1..=segments.len())
            .map(|n| segments[..n].join("."))
            .collect();

        if let Some(alias) = alias {
            // Only the leaf is bound, under the alias.
            for prefix in &prefixes[..prefixes.len() - 1] {
                let idx = self.str_const(prefix, line);
                self.emit(Opcode::ImportFrom, line);
                self.emit_u16(idx, line);
            }
            let idx = self.str_const(module, line);
            self.emit(Opcode::ImportAs, line);
            self.emit_u16(idx, line);
            self.grow(1);
            self.define_variable(alias, line);
        } else if !names.is_empty() {
            // `import m for a, b`: nothing of the module itself is bound.
            for prefix in &prefixes {
                let idx = self.str_const(prefix, line);
                self.emit(Opcode::ImportFrom, line);
                self.emit_u16(idx, line);
            }
            let midx = self.str_const(module, line);
            for name in names {
                let nidx = self.str_const(name, line);
                self.emit(Opcode::ImportName, line);
                self.emit_u16(midx, line);
                self.emit_u16(nidx, line);
                self.grow(1);
                self.define_variable(name, line);
            }
        } else {
            // `import a.b.c` binds the root module under its own name;
            // the chain is reached through parent globals.
            let root_idx = self.str_const(&prefixes[0], line);
            self.emit(Opcode::Import, line);
            self.emit_u16(root_idx, line);
            self.grow(1);
            self.define_variable(segments[0], line);
            for prefix in &prefixes[1..] {
                let idx = self.str_const(prefix, line);
                self.emit(Opcode::ImportFrom, line);
                self.emit_u16(idx, line);
            }
        }
    }

    fn assign_stmt(&mut self, targets: &[LValue], values: &[Expr], line: u32) {
        if targets.len() == 1 {
            match &targets[0] {
                LValue::Name(name) => {
                    self.expression(&values[0]);
                    self.store_variable(name, line);
                }
                LValue::Field { object, name } => {
                    self.expression(object);
                    self.expression(&values[0]);
                    let idx = self.str_const(name, line);
                    let cache = self.cache_slot();
                    self.emit(Opcode::SetField, line);
                    self.emit_u16(idx, line);
                    self.emit_u16(cache, line);
                    self.shrink(2);
                }
                LValue::Subscript { object, index } => {
                    self.expression(object);
                    self.expression(index);
                    self.expression(&values[0]);
                    self.emit(Opcode::SubscrSet, line);
                    self.shrink(3);
                }
            }
            return;
        }

        // Unpacking form: requires plain name targets so stores need no
        // extra operands under the pushed values.
        let mut names = Vec::with_capacity(targets.len());
        for t in targets {
            match t {
                LValue::Name(n) => names.push(n.as_str()),
                _ => {
                    self.error(line, "unpacking assignment targets must be plain names");
                    return;
                }
            }
        }

        if values.len() == names.len() {
            for v in values {
                self.expression(v);
            }
        } else {
            // A literal sequence of matching length assigns directly,
            // without materializing the collection.
            match &values[0].kind {
                ExprKind::Tuple(items) | ExprKind::List(items) if items.len() == names.len() => {
                    for item in items {
                        self.expression(item);
                    }
                }
                _ => {
                    self.expression(&values[0]);
                    self.emit_unpack(names.len(), line);
                }
            }
        }
        for name in names.iter().rev() {
            self.store_variable(name, line);
        }
    }

    // ---- expressions ----

    fn expression(&mut self, expr: &Expr) {
        let line = expr.line;
        match &expr.kind {
            ExprKind::Null => {
                self.emit(Opcode::PushNull, line);
                self.grow(1);
            }
            ExprKind::Bool(b) => {
                let idx = self.add_const(Const::Bool(*b), line);
                self.emit(Opcode::GetConst, line);
                self.emit_u16(idx, line);
                self.grow(1);
            }
            ExprKind::Num(n) => {
                let idx = self.add_const(Const::Num(*n), line);
                self.emit(Opcode::GetConst, line);
                self.emit_u16(idx, line);
                self.grow(1);
            }
            ExprKind::Str(s) => {
                let idx = self.add_const(Const::Str(s.clone()), line);
                self.emit(Opcode::GetConst, line);
                self.emit_u16(idx, line);
                self.grow(1);
            }
            ExprKind::Name(name) => match self.resolve(name, line) {
                Storage::Local(slot) => {
                    self.emit(Opcode::GetLocal, line);
                    self.emit_u8(slot, line);
                    self.grow(1);
                }
                Storage::Upvalue(idx) => {
                    self.emit(Opcode::GetUpvalue, line);
                    self.emit_u8(idx, line);
                    self.grow(1);
                }
                Storage::Global => {
                    let idx = self.str_const(name, line);
                    let cache = self.cache_slot();
                    self.emit(Opcode::GetGlobal, line);
                    self.emit_u16(idx, line);
                    self.emit_u16(cache, line);
                    self.grow(1);
                }
            },
            ExprKind::This => {
                if !matches!(self.cur().kind, FnKind::Method | FnKind::Ctor) {
                    self.error(line, "'this' outside of a method");
                }
                self.emit(Opcode::GetLocal, line);
                self.emit_u8(0, line);
                self.grow(1);
            }
            ExprKind::List(items) => {
                self.emit(Opcode::NewList, line);
                self.grow(1);
                for item in items {
                    self.expression(item);
                    self.emit(Opcode::AppendList, item.line);
                    self.shrink(1);
                }
            }
            ExprKind::Tuple(items) => {
                for item in items {
                    self.expression(item);
                }
                self.emit(Opcode::NewTuple, line);
                self.emit_u8(items.len() as u8, line);
                self.shrink(items.len());
                self.grow(1);
            }
            ExprKind::Table(entries) => {
                self.emit(Opcode::NewTable, line);
                self.grow(1);
                for (k, v) in entries {
                    self.emit(Opcode::Dup, k.line);
                    self.grow(1);
                    self.expression(k);
                    self.expression(v);
                    self.emit(Opcode::SubscrSet, k.line);
                    self.shrink(3);
                }
            }
            ExprKind::Lambda(body) => self.function(body, FnKind::Function),
            ExprKind::Binary { op, lhs, rhs } => {
                self.expression(lhs);
                self.expression(rhs);
                let opcode = match op {
                    BinOp::Add => Opcode::Add,
                    BinOp::Sub => Opcode::Sub,
                    BinOp::Mul => Opcode::Mul,
                    BinOp::Div => Opcode::Div,
                    BinOp::Mod => Opcode::Mod,
                    BinOp::Pow => Opcode::Pow,
                    BinOp::Eq => Opcode::Eq,
                    BinOp::Ne => Opcode::Eq,
                    BinOp::Lt => Opcode::Lt,
                    BinOp::Le => Opcode::Le,
                    BinOp::Gt => Opcode::Gt,
                    BinOp::Ge => Opcode::Ge,
                    BinOp::Is => Opcode::Is,
                };
                self.emit(opcode, line);
                self.shrink(1);
                if *op == BinOp::Ne {
                    self.emit(Opcode::Not, line);
                }
            }
            ExprKind::Unary { op, operand } => {
                self.expression(operand);
                let opcode = match op {
                    UnOp::Neg => Opcode::Neg,
                    UnOp::Not => Opcode::Not,
                };
                self.emit(opcode, line);
            }
            ExprKind::And { lhs, rhs } => {
                self.expression(lhs);
                self.emit(Opcode::Dup, line);
                self.grow(1);
                let end = self.emit_jump(Opcode::JumpF, line);
                self.shrink(1);
                self.emit(Opcode::Pop, line);
                self.shrink(1);
                self.expression(rhs);
                self.patch_jump(end);
            }
            ExprKind::Or { lhs, rhs } => {
                self.expression(lhs);
                self.emit(Opcode::Dup, line);
                self.grow(1);
                let end = self.emit_jump(Opcode::JumpT, line);
                self.shrink(1);
                self.emit(Opcode::Pop, line);
                self.shrink(1);
                self.expression(rhs);
                self.patch_jump(end);
            }
            ExprKind::Call { callee, args } => {
                self.expression(callee);
                for a in args {
                    self.expression(a);
                }
                self.emit_call(Opcode::Call0, Opcode::Call, None, args.len(), line);
            }
            ExprKind::Invoke { object, name, args } => {
                self.expression(object);
                for a in args {
                    self.expression(a);
                }
                let idx = self.str_const(name, line);
                self.emit_call(Opcode::Invoke0, Opcode::Invoke, Some(idx), args.len(), line);
            }
            ExprKind::Field { object, name } => {
                self.expression(object);
                let idx = self.str_const(name, line);
                let cache = self.cache_slot();
                self.emit(Opcode::GetField, line);
                self.emit_u16(idx, line);
                self.emit_u16(cache, line);
            }
            ExprKind::Subscript { object, index } => {
                self.expression(object);
                self.expression(index);
                self.emit(Opcode::SubscrGet, line);
                self.shrink(1);
            }
            ExprKind::SuperCall { name, args } => {
                if !matches!(self.cur().kind, FnKind::Method | FnKind::Ctor) {
                    self.error(line, "'super' outside of a method");
                }
                self.emit(Opcode::GetLocal, line);
                self.emit_u8(0, line);
                self.grow(1);
                for a in args {
                    self.expression(a);
                }
                let idx = self.str_const(name, line);
                self.emit_call(Opcode::Super0, Opcode::Super, Some(idx), args.len(), line);
            }
            ExprKind::Yield(value) => {
                self.cur().proto.is_generator = true;
                match value {
                    Some(v) => self.expression(v),
                    None => {
                        self.emit(Opcode::PushNull, line);
                        self.grow(1);
                    }
                }
                // Pops the yielded value on suspend, pushes the sent value
                // on resume: net zero.
                self.emit(Opcode::Yield, line);
            }
        }
    }

    /// Emit an inline or generic call-family opcode.
    fn emit_call(
        &mut self,
        inline_base: Opcode,
        generic: Opcode,
        name_idx: Option<u16>,
        argc: usize,
        line: u32,
    ) {
        if argc > u8::MAX as usize {
            self.error(line, "too many arguments in call");
            return;
        }
        match Opcode::inline_call(inline_base, argc as u8) {
            Some(op) => {
                self.emit(op, line);
                if let Some(idx) = name_idx {
                    self.emit_u16(idx, line);
                }
            }
            None => {
                self.emit(generic, line);
                if let Some(idx) = name_idx {
                    self.emit_u16(idx, line);
                }
                self.emit_u8(argc as u8, line);
            }
        }
        // Callee (or receiver) and arguments collapse into the result.
        self.shrink(argc);
    }
}

fn native_proto(native: &NativeDecl) -> brio_core::NativeProto {
    brio_core::NativeProto {
        name: native.name.clone(),
        arity: native.params.len().saturating_sub(usize::from(native.vararg)) as u8,
        vararg: native.vararg,
        defaults: native
            .params
            .iter()
            .filter_map(|p| p.default.as_ref())
            .map(const_of_lit)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn compile(src: &str) -> FuncProto {
        let stmts = Parser::new(src).unwrap().parse().expect("parse");
        compile_module("test", &stmts).expect("compile")
    }

    fn compile_err(src: &str) -> Vec<CompileError> {
        let stmts = Parser::new(src).unwrap().parse().expect("parse");
        compile_module("test", &stmts).expect_err("expected compile failure")
    }

    fn ops(proto: &FuncProto) -> Vec<Opcode> {
        let mut out = Vec::new();
        let bytes = &proto.code.bytes;
        let mut at = 0;
        while at < bytes.len() {
            let op = Opcode::from_byte(bytes[at]).unwrap();
            out.push(op);
            at += 1 + op.operand_len();
            if op == Opcode::Closure {
                let idx = u16::from_be_bytes([bytes[at - 2], bytes[at - 1]]) as usize;
                if let Const::Func(p) = &proto.code.consts[idx] {
                    at += 2 * p.upvalues.len();
                }
            }
        }
        out
    }

    fn first_func(proto: &FuncProto) -> &FuncProto {
        proto
            .code
            .consts
            .iter()
            .find_map(|c| match c {
                Const::Func(p) => Some(p.as_ref()),
                _ => None,
            })
            .expect("nested function constant")
    }

    #[test]
    fn test_module_returns_null() {
        let proto = compile("var x = 1");
        let ops = ops(&proto);
        assert_eq!(&ops[ops.len() - 2..], &[Opcode::PushNull, Opcode::Return]);
    }

    #[test]
    fn test_global_define_at_module_scope() {
        let proto = compile("var x = 1");
        assert!(ops(&proto).contains(&Opcode::DefineGlobal));
    }

    #[test]
    fn test_arithmetic_operand_order() {
        let proto = compile("var x = 1 + 2 * 3");
        let ops = ops(&proto);
        // 1, 2, 3 pushed, then Mul, then Add.
        let mul = ops.iter().position(|&o| o == Opcode::Mul).unwrap();
        let add = ops.iter().position(|&o| o == Opcode::Add).unwrap();
        assert!(mul < add);
    }

    #[test]
    fn test_locals_inside_function() {
        let proto = compile("fun f()\n var a = 1\n return a\nend");
        let f = first_func(&proto);
        let fops = ops(f);
        assert!(fops.contains(&Opcode::GetLocal));
        assert!(!fops.contains(&Opcode::DefineGlobal));
    }

    #[test]
    fn test_upvalue_capture() {
        let proto = compile(
            "fun outer()\n var x = 1\n return fun() return x end\nend",
        );
        let outer = first_func(&proto);
        let inner = first_func(outer);
        assert_eq!(inner.upvalues.len(), 1);
        assert!(inner.upvalues[0].is_local);
        assert!(ops(inner).contains(&Opcode::GetUpvalue));
        // The outer function closes the captured local when it goes out
        // of scope via Return (frame teardown closes upvalues).
        assert!(ops(outer).contains(&Opcode::Closure));
    }

    #[test]
    fn test_nested_upvalue_chain() {
        let proto = compile(
            "fun a()\n var x = 1\n return fun() return fun() return x end end\nend",
        );
        let a = first_func(&proto);
        let b = first_func(a);
        let c = first_func(b);
        // Middle function carries an intermediate upvalue entry.
        assert_eq!(b.upvalues.len(), 1);
        assert!(b.upvalues[0].is_local);
        assert_eq!(c.upvalues.len(), 1);
        assert!(!c.upvalues[0].is_local);
    }

    #[test]
    fn test_self_read_in_initializer_rejected() {
        let errs = compile_err("fun f()\n var a = a\nend");
        assert!(errs[0].message.contains("own initializer"));
    }

    #[test]
    fn test_block_scope_pops_locals() {
        let proto = compile("fun f()\n begin\n var a = 1\n end\nend");
        let f = first_func(&proto);
        assert!(ops(f).contains(&Opcode::Pop));
    }

    #[test]
    fn test_captured_local_closes_on_scope_exit() {
        let proto = compile(
            "fun f()\n var g = null\n begin\n var x = 1\n g = fun() return x end\n end\n return g\nend",
        );
        let f = first_func(&proto);
        assert!(ops(f).contains(&Opcode::CloseUpvalue));
    }

    #[test]
    fn test_while_loop_shape() {
        let proto = compile("while true do print(1) end");
        let o = ops(&proto);
        assert!(o.contains(&Opcode::JumpF));
        assert!(o.contains(&Opcode::Jump));
        assert!(!o.contains(&Opcode::MarkBreak));
    }

    #[test]
    fn test_break_rewritten_to_jump() {
        let proto = compile("while true do break end");
        let o = ops(&proto);
        assert!(!o.contains(&Opcode::MarkBreak), "sentinel must be rewritten");
    }

    #[test]
    fn test_continue_rewritten_to_jump() {
        let proto = compile("while true do continue end");
        assert!(!ops(&proto).contains(&Opcode::MarkContinue));
    }

    #[test]
    fn test_break_outside_loop_rejected() {
        let errs = compile_err("break");
        assert!(errs[0].message.contains("outside of a loop"));
    }

    #[test]
    fn test_break_across_try_rejected() {
        let errs = compile_err(
            "while true do\n try\n break\n except Exception e\n end\nend",
        );
        assert!(errs[0].message.contains("cannot cross a try"));
    }

    #[test]
    fn test_for_loop_uses_iterator_protocol() {
        let proto = compile("for v in xs do print(v) end");
        let o = ops(&proto);
        assert!(o.iter().filter(|&&op| op == Opcode::Invoke1).count() >= 2);
        let consts: Vec<String> = proto
            .code
            .consts
            .iter()
            .filter_map(|c| match c {
                Const::Str(s) => Some(s.clone()),
                _ => None,
            })
            .collect();
        assert!(consts.contains(&"__iter__".to_string()));
        assert!(consts.contains(&"__next__".to_string()));
    }

    #[test]
    fn test_try_except_layout() {
        let proto = compile("try\n f()\nexcept Exception e\n print(e)\nend");
        let o = ops(&proto);
        assert!(o.contains(&Opcode::SetupExcept));
        assert!(o.contains(&Opcode::PopHandler));
        assert!(o.contains(&Opcode::Is));
        assert!(o.contains(&Opcode::Raise), "unmatched exceptions re-raise");
    }

    #[test]
    fn test_try_ensure_layout() {
        let proto = compile("try\n f()\nensure\n g()\nend");
        let o = ops(&proto);
        assert!(o.contains(&Opcode::SetupEnsure));
        assert!(o.contains(&Opcode::EnsureEnd));
    }

    /// Operands of every `GetLocal`, in emission order.
    fn get_local_slots(proto: &FuncProto) -> Vec<u8> {
        let mut out = Vec::new();
        let bytes = &proto.code.bytes;
        let mut at = 0;
        while at < bytes.len() {
            let op = Opcode::from_byte(bytes[at]).unwrap();
            if op == Opcode::GetLocal {
                out.push(bytes[at + 1]);
            }
            at += 1 + op.operand_len();
            if op == Opcode::Closure {
                let idx = u16::from_be_bytes([bytes[at - 2], bytes[at - 1]]) as usize;
                if let Const::Func(p) = &proto.code.consts[idx] {
                    at += 2 * p.upvalues.len();
                }
            }
        }
        out
    }

    #[test]
    fn test_ensure_body_local_pops_before_ensure_end() {
        let proto = compile(
            "fun f()\n var a = 1\n try\n  a = 2\n ensure\n  var tmp = 3\n  print(tmp)\n end\n var b = 4\n return b\nend",
        );
        let f = first_func(&proto);
        let o = ops(f);
        // The ensure-body local is popped by an ordinary opcode before
        // EnsureEnd reads the hidden unwind pair off the stack top.
        let end_pos = o.iter().position(|&op| op == Opcode::EnsureEnd).unwrap();
        assert_eq!(o[end_pos - 1], Opcode::Pop, "body local must be popped before ensure_end");

        // Slot layout: 0 callee, 1 `a`, 2-3 hidden pair, 4 `tmp`. After
        // the try, the pair is gone and `b` reuses slot 2.
        let slots = get_local_slots(f);
        assert!(slots.contains(&4), "ensure-body local sits above the hidden pair");
        assert_eq!(slots.last(), Some(&2), "local numbering must resume below the pair");
    }

    #[test]
    fn test_ensure_body_captured_local_closes_upvalue() {
        let proto = compile(
            "fun f()\n var g = null\n try\n  g = null\n ensure\n  var x = 1\n  g = fun() return x end\n end\n return g\nend",
        );
        let f = first_func(&proto);
        let o = ops(f);
        // A captured ensure-body local closes instead of popping, still
        // ahead of EnsureEnd.
        let end_pos = o.iter().position(|&op| op == Opcode::EnsureEnd).unwrap();
        assert_eq!(o[end_pos - 1], Opcode::CloseUpvalue);
    }

    #[test]
    fn test_nested_try_depth_limit() {
        // MAX_HANDLERS is 6; each try+except+ensure consumes two.
        let mut src = String::new();
        for _ in 0..4 {
            src.push_str("try\n");
        }
        src.push_str("f()\n");
        for _ in 0..4 {
            src.push_str("except Exception e\nensure\nend\n");
        }
        let stmts = Parser::new(&src).unwrap().parse().expect("parse");
        let result = compile_module("test", &stmts);
        assert!(result.is_err());
        let errs = result.unwrap_err();
        assert!(errs[0].message.contains("too many nested try"));
    }

    #[test]
    fn test_class_compiles_methods() {
        let proto = compile(
            "class C\n fun m() return 1 end\nend",
        );
        let o = ops(&proto);
        assert!(o.contains(&Opcode::NewClass));
        assert!(o.contains(&Opcode::DefMethod));
    }

    #[test]
    fn test_subclass_and_super() {
        let proto = compile(
            "class C\n fun m() return 1 end\nend\nclass D is C\n fun m() return super.m() + 1 end\nend",
        );
        let o = ops(&proto);
        assert!(o.contains(&Opcode::NewSubclass));
        let method = proto
            .code
            .consts
            .iter()
            .filter_map(|c| match c {
                Const::Func(p) if p.name.as_deref() == Some("m") => Some(p.as_ref()),
                _ => None,
            })
            .last()
            .unwrap();
        assert!(ops(method).contains(&Opcode::Super0));
    }

    #[test]
    fn test_ctor_returns_this() {
        let proto = compile("class C\n fun new() end\nend");
        let ctor = first_func(&proto);
        let o = ops(ctor);
        // Implicit `return this`: GetLocal 0 before Return.
        assert_eq!(&o[o.len() - 2..], &[Opcode::GetLocal, Opcode::Return]);
    }

    #[test]
    fn test_ctor_cannot_return_value() {
        let errs = compile_err("class C\n fun new() return 1 end\nend");
        assert!(errs[0].message.contains("constructor"));
    }

    #[test]
    fn test_native_method_emits_nat_method() {
        let proto = compile("class C\n native m(x)\nend");
        assert!(ops(&proto).contains(&Opcode::NatMethod));
        let native = proto
            .code
            .consts
            .iter()
            .find_map(|c| match c {
                Const::Native(p) => Some(p),
                _ => None,
            })
            .unwrap();
        assert_eq!(native.name, "C.m");
    }

    #[test]
    fn test_generator_flag() {
        let proto = compile("var g = fun() yield 1 end");
        let f = first_func(&proto);
        assert!(f.is_generator);
        assert!(ops(f).contains(&Opcode::Yield));
    }

    #[test]
    fn test_inline_call_opcodes() {
        let proto = compile("f()\ng(1, 2)");
        let o = ops(&proto);
        assert!(o.contains(&Opcode::Call0));
        assert!(o.contains(&Opcode::Call2));
    }

    #[test]
    fn test_invoke_fusion() {
        let proto = compile("obj.m(1)");
        assert!(ops(&proto).contains(&Opcode::Invoke1));
    }

    #[test]
    fn test_import_plain_binds_root() {
        let proto = compile("import a.b.c");
        let o = ops(&proto);
        assert!(o.contains(&Opcode::Import));
        assert_eq!(o.iter().filter(|&&op| op == Opcode::ImportFrom).count(), 2);
        assert!(o.contains(&Opcode::DefineGlobal));
    }

    #[test]
    fn test_import_for_names() {
        let proto = compile("import sys for argv");
        let o = ops(&proto);
        assert!(o.contains(&Opcode::ImportFrom));
        assert!(o.contains(&Opcode::ImportName));
    }

    #[test]
    fn test_unpack_assignment_literal_elides_tuple() {
        let proto = compile("var a = 1\nvar b = 2\na, b = (b, a)");
        let o = ops(&proto);
        assert!(!o.contains(&Opcode::NewTuple), "literal tuple must not materialize");
        assert!(!o.contains(&Opcode::Unpack));
    }

    #[test]
    fn test_unpack_assignment_general_rhs() {
        let proto = compile("var a = 1\nvar b = 2\na, b = f()");
        assert!(ops(&proto).contains(&Opcode::Unpack));
    }

    #[test]
    fn test_max_stack_accounts_for_expression_depth() {
        let proto = compile("var x = 1 + (2 + (3 + (4 + 5)))");
        assert!(proto.max_stack >= 5);
    }

    #[test]
    fn test_string_constants_deduped() {
        let proto = compile("var a = \"s\"\nvar b = \"s\"\nvar c = \"s\"");
        let strings = proto
            .code
            .consts
            .iter()
            .filter(|c| matches!(c, Const::Str(s) if s == "s"))
            .count();
        assert_eq!(strings, 1);
    }

    #[test]
    fn test_cache_slots_allocated_per_site() {
        let proto = compile("print(a)\nprint(a)");
        // Two `print` reads, two `a` reads: four distinct cache slots.
        assert_eq!(proto.cache_count, 4);
    }
}
