//! Recursive-descent parser for Brio.
//!
//! The grammar is keyword-delimited (`then`/`do`/`end` blocks), so newlines
//! carry little weight: they terminate simple statements and are skipped
//! everywhere else. On a syntax error the parser records a diagnostic and
//! resynchronizes at the next statement boundary, so a single run reports
//! every independent error in the file.

use crate::ast::{
    BinOp, ConstLit, ExceptClause, Expr, ExprKind, FunBody, LValue, Method, NativeDecl, Param,
    Stmt, StmtKind, UnOp,
};
use crate::lexer::{tokenize, Token, TokenKind};
use crate::CompileError;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    errors: Vec<CompileError>,
    /// Nesting depth of function literals, for `yield` placement checks.
    fn_depth: usize,
}

/// Internal early-exit marker; the diagnostic itself is already recorded.
struct Bail;

type PResult<T> = Result<T, Bail>;

impl Parser {
    pub fn new(source: &str) -> Result<Parser, CompileError> {
        let tokens = tokenize(source)
            .map_err(|e| CompileError { line: e.line, message: e.message })?;
        Ok(Parser { tokens, pos: 0, errors: Vec::new(), fn_depth: 0 })
    }

    /// Parse a whole module body. Returns every statement that parsed
    /// cleanly, or the accumulated diagnostics if anything failed.
    pub fn parse(mut self) -> Result<Vec<Stmt>, Vec<CompileError>> {
        let mut stmts = Vec::new();
        self.skip_newlines();
        while !self.check(&TokenKind::Eof) {
            match self.declaration() {
                Ok(stmt) => stmts.push(stmt),
                Err(Bail) => self.synchronize(),
            }
            self.skip_newlines();
        }
        if self.errors.is_empty() {
            Ok(stmts)
        } else {
            Err(self.errors)
        }
    }

    // ---- token plumbing ----

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn line(&self) -> u32 {
        self.peek().line
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn matches(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error_at(&mut self, line: u32, message: impl Into<String>) -> Bail {
        self.errors.push(CompileError { line, message: message.into() });
        Bail
    }

    fn error(&mut self, message: impl Into<String>) -> Bail {
        let line = self.line();
        self.error_at(line, message)
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> PResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            let found = self.peek_kind().describe();
            Err(self.error(format!("expected {}, found {}", what, found)))
        }
    }

    fn expect_name(&mut self, what: &str) -> PResult<String> {
        match self.peek_kind().clone() {
            TokenKind::Name(n) => {
                self.advance();
                Ok(n)
            }
            other => Err(self.error(format!("expected {}, found {}", what, other.describe()))),
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(&TokenKind::Newline) || self.check(&TokenKind::Semicolon) {
            self.advance();
        }
    }

    /// Simple statements end at a newline, `;`, or anything that closes a
    /// block. Keeps `var x = 1 var y = 2` on one line an error without
    /// making every block terminator mandatory whitespace.
    fn statement_end(&mut self) -> PResult<()> {
        match self.peek_kind() {
            TokenKind::Newline | TokenKind::Semicolon => {
                self.advance();
                Ok(())
            }
            TokenKind::Eof
            | TokenKind::End
            | TokenKind::Else
            | TokenKind::Elif
            | TokenKind::Except
            | TokenKind::Ensure => Ok(()),
            other => {
                let msg = format!("expected end of statement, found {}", other.describe());
                Err(self.error(msg))
            }
        }
    }

    /// Skip forward to a plausible statement start after an error.
    fn synchronize(&mut self) {
        loop {
            match self.peek_kind() {
                TokenKind::Eof => return,
                TokenKind::Newline | TokenKind::Semicolon => {
                    self.advance();
                    return;
                }
                TokenKind::Var
                | TokenKind::Fun
                | TokenKind::Class
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Return
                | TokenKind::Try
                | TokenKind::Import
                | TokenKind::End => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    // ---- declarations and statements ----

    fn declaration(&mut self) -> PResult<Stmt> {
        let line = self.line();
        match self.peek_kind() {
            TokenKind::Var => self.var_decl(),
            TokenKind::Class => self.class_decl(),
            TokenKind::Native => {
                self.advance();
                let native = self.native_decl()?;
                Ok(Stmt::new(line, StmtKind::NativeFunDecl(native)))
            }
            // `fun` opens a declaration only when a name follows; a bare
            // `fun (...)` is a function literal expression.
            TokenKind::Fun if matches!(self.peek_next(), TokenKind::Name(_)) => {
                self.advance();
                let name = self.expect_name("function name")?;
                let body = self.fun_body(Some(name), line)?;
                Ok(Stmt::new(line, StmtKind::FunDecl(body)))
            }
            _ => self.statement(),
        }
    }

    fn peek_next(&self) -> &TokenKind {
        let idx = (self.pos + 1).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn var_decl(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance(); // var
        let mut names = vec![self.expect_name("variable name")?];
        while self.matches(&TokenKind::Comma) {
            names.push(self.expect_name("variable name")?);
        }
        let mut init = Vec::new();
        if self.matches(&TokenKind::Assign) {
            init.push(self.expression()?);
            while self.matches(&TokenKind::Comma) {
                init.push(self.expression()?);
            }
        }
        if init.len() > 1 && init.len() != names.len() {
            return Err(self.error_at(
                line,
                format!("cannot assign {} values to {} variables", init.len(), names.len()),
            ));
        }
        self.statement_end()?;
        Ok(Stmt::new(line, StmtKind::VarDecl { names, init }))
    }

    fn class_decl(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance(); // class
        let name = self.expect_name("class name")?;
        let superclass = if self.matches(&TokenKind::Is) {
            Some(self.expression()?)
        } else {
            None
        };
        self.skip_newlines();

        let mut methods = Vec::new();
        while !self.check(&TokenKind::End) && !self.check(&TokenKind::Eof) {
            let mline = self.line();
            if self.matches(&TokenKind::Fun) {
                let mname = self.expect_name("method name")?;
                methods.push(Method::Script(self.fun_body(Some(mname), mline)?));
            } else if self.matches(&TokenKind::Native) {
                methods.push(Method::Native(self.native_decl()?));
            } else {
                let found = self.peek_kind().describe();
                return Err(self.error(format!(
                    "expected method or 'end' in class body, found {}",
                    found
                )));
            }
            self.skip_newlines();
        }
        self.expect(&TokenKind::End, "'end' after class body")?;
        Ok(Stmt::new(line, StmtKind::ClassDecl { name, superclass, methods, line }))
    }

    /// Parse `name(params)` after the `native` keyword was consumed.
    fn native_decl(&mut self) -> PResult<NativeDecl> {
        let line = self.line();
        let name = self.expect_name("native function name")?;
        let (params, vararg) = self.param_list()?;
        self.statement_end()?;
        Ok(NativeDecl { name, params, vararg, line })
    }

    /// Parse `(params) body end` after the name (if any) was consumed.
    fn fun_body(&mut self, name: Option<String>, line: u32) -> PResult<FunBody> {
        let (params, vararg) = self.param_list()?;
        self.fn_depth += 1;
        let body = self.block(&[TokenKind::End]);
        self.fn_depth -= 1;
        let body = body?;
        self.expect(&TokenKind::End, "'end' after function body")?;
        Ok(FunBody { name, params, vararg, body, line })
    }

    fn param_list(&mut self) -> PResult<(Vec<Param>, bool)> {
        self.expect(&TokenKind::LParen, "'(' before parameters")?;
        let mut params = Vec::new();
        let mut vararg = false;
        let mut seen_default = false;
        if !self.check(&TokenKind::RParen) {
            loop {
                let name = self.expect_name("parameter name")?;
                if self.matches(&TokenKind::Ellipsis) {
                    params.push(Param { name, default: None });
                    vararg = true;
                    break;
                }
                let default = if self.matches(&TokenKind::Assign) {
                    Some(self.const_literal()?)
                } else {
                    None
                };
                if default.is_some() {
                    seen_default = true;
                } else if seen_default {
                    return Err(
                        self.error("parameters without defaults cannot follow defaulted ones")
                    );
                }
                params.push(Param { name, default });
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen, "')' after parameters")?;
        Ok((params, vararg))
    }

    fn const_literal(&mut self) -> PResult<ConstLit> {
        let tok = self.advance();
        let negate = tok.kind == TokenKind::Minus;
        let tok = if negate { self.advance() } else { tok };
        match tok.kind {
            TokenKind::Num(n) => Ok(ConstLit::Num(if negate { -n } else { n })),
            _ if negate => Err(self.error_at(tok.line, "expected number after '-' in default")),
            TokenKind::Str(s) => Ok(ConstLit::Str(s)),
            TokenKind::True => Ok(ConstLit::Bool(true)),
            TokenKind::False => Ok(ConstLit::Bool(false)),
            TokenKind::Null => Ok(ConstLit::Null),
            other => Err(self.error_at(
                tok.line,
                format!("parameter default must be a constant, found {}", other.describe()),
            )),
        }
    }

    /// Parse statements until one of `stops` (not consumed).
    fn block(&mut self, stops: &[TokenKind]) -> PResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        self.skip_newlines();
        while !stops.iter().any(|s| self.check(s)) && !self.check(&TokenKind::Eof) {
            match self.declaration() {
                Ok(stmt) => stmts.push(stmt),
                Err(Bail) => self.synchronize(),
            }
            self.skip_newlines();
        }
        Ok(stmts)
    }

    fn statement(&mut self) -> PResult<Stmt> {
        let line = self.line();
        match self.peek_kind() {
            TokenKind::If => self.if_stmt(),
            TokenKind::While => self.while_stmt(),
            TokenKind::For => self.for_stmt(),
            TokenKind::Try => self.try_stmt(),
            TokenKind::Import => self.import_stmt(),
            TokenKind::Return => {
                self.advance();
                let value = if self.statement_boundary() {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.statement_end()?;
                Ok(Stmt::new(line, StmtKind::Return(value)))
            }
            TokenKind::Raise => {
                self.advance();
                let exc = self.expression()?;
                self.statement_end()?;
                Ok(Stmt::new(line, StmtKind::Raise(exc)))
            }
            TokenKind::Break => {
                self.advance();
                self.statement_end()?;
                Ok(Stmt::new(line, StmtKind::Break))
            }
            TokenKind::Continue => {
                self.advance();
                self.statement_end()?;
                Ok(Stmt::new(line, StmtKind::Continue))
            }
            TokenKind::Begin => {
                self.advance();
                let body = self.block(&[TokenKind::End])?;
                self.expect(&TokenKind::End, "'end' after block")?;
                Ok(Stmt::new(line, StmtKind::Block(body)))
            }
            _ => self.expr_or_assign_stmt(),
        }
    }

    fn statement_boundary(&self) -> bool {
        matches!(
            self.peek_kind(),
            TokenKind::Newline
                | TokenKind::Semicolon
                | TokenKind::Eof
                | TokenKind::End
                | TokenKind::Else
                | TokenKind::Elif
                | TokenKind::Except
                | TokenKind::Ensure
        )
    }

    fn if_stmt(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance(); // if
        let mut branches = Vec::new();
        let cond = self.expression()?;
        self.expect(&TokenKind::Then, "'then' after condition")?;
        let body = self.block(&[TokenKind::Elif, TokenKind::Else, TokenKind::End])?;
        branches.push((cond, body));
        let mut else_body = None;
        loop {
            if self.matches(&TokenKind::Elif) {
                let cond = self.expression()?;
                self.expect(&TokenKind::Then, "'then' after condition")?;
                let body = self.block(&[TokenKind::Elif, TokenKind::Else, TokenKind::End])?;
                branches.push((cond, body));
            } else if self.matches(&TokenKind::Else) {
                else_body = Some(self.block(&[TokenKind::End])?);
                break;
            } else {
                break;
            }
        }
        self.expect(&TokenKind::End, "'end' after if")?;
        Ok(Stmt::new(line, StmtKind::If { branches, else_body }))
    }

    fn while_stmt(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance(); // while
        let cond = self.expression()?;
        self.expect(&TokenKind::Do, "'do' after condition")?;
        let body = self.block(&[TokenKind::End])?;
        self.expect(&TokenKind::End, "'end' after while body")?;
        Ok(Stmt::new(line, StmtKind::While { cond, body }))
    }

    fn for_stmt(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance(); // for
        self.matches(&TokenKind::Var); // optional, `for var x in ...`
        let mut targets = vec![self.expect_name("loop variable")?];
        while self.matches(&TokenKind::Comma) {
            targets.push(self.expect_name("loop variable")?);
        }
        self.expect(&TokenKind::In, "'in' after loop variables")?;
        let iterable = self.expression()?;
        self.expect(&TokenKind::Do, "'do' after iterable")?;
        let body = self.block(&[TokenKind::End])?;
        self.expect(&TokenKind::End, "'end' after for body")?;
        Ok(Stmt::new(line, StmtKind::For { targets, iterable, body }))
    }

    fn try_stmt(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance(); // try
        let body = self.block(&[TokenKind::Except, TokenKind::Ensure, TokenKind::End])?;
        let mut handlers = Vec::new();
        while self.check(&TokenKind::Except) {
            let hline = self.line();
            self.advance();
            let class = self.expression()?;
            let var = self.expect_name("exception variable")?;
            let hbody = self.block(&[TokenKind::Except, TokenKind::Ensure, TokenKind::End])?;
            handlers.push(ExceptClause { class, var, body: hbody, line: hline });
        }
        let ensure = if self.matches(&TokenKind::Ensure) {
            Some(self.block(&[TokenKind::End])?)
        } else {
            None
        };
        if handlers.is_empty() && ensure.is_none() {
            return Err(self.error_at(line, "'try' needs at least one 'except' or an 'ensure'"));
        }
        self.expect(&TokenKind::End, "'end' after try")?;
        Ok(Stmt::new(line, StmtKind::Try { body, handlers, ensure }))
    }

    fn import_stmt(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance(); // import
        let mut module = self.expect_name("module name")?;
        while self.matches(&TokenKind::Dot) {
            module.push('.');
            module.push_str(&self.expect_name("module name after '.'")?);
        }
        let mut alias = None;
        let mut names = Vec::new();
        if self.matches(&TokenKind::As) {
            alias = Some(self.expect_name("alias name")?);
        } else if self.matches(&TokenKind::For) {
            names.push(self.expect_name("imported name")?);
            while self.matches(&TokenKind::Comma) {
                names.push(self.expect_name("imported name")?);
            }
        }
        self.statement_end()?;
        Ok(Stmt::new(line, StmtKind::Import { module, alias, names }))
    }

    fn expr_or_assign_stmt(&mut self) -> PResult<Stmt> {
        let line = self.line();
        let first = self.expression()?;
        if !self.check(&TokenKind::Comma) && !self.check(&TokenKind::Assign) {
            self.statement_end()?;
            return Ok(Stmt::new(line, StmtKind::Expr(first)));
        }

        let mut target_exprs = vec![first];
        while self.matches(&TokenKind::Comma) {
            target_exprs.push(self.expression()?);
        }
        self.expect(&TokenKind::Assign, "'=' in assignment")?;
        let mut targets = Vec::with_capacity(target_exprs.len());
        for e in target_exprs {
            targets.push(self.as_lvalue(e)?);
        }
        let mut values = vec![self.expression()?];
        while self.matches(&TokenKind::Comma) {
            values.push(self.expression()?);
        }
        if values.len() > 1 && values.len() != targets.len() {
            return Err(self.error_at(
                line,
                format!("cannot assign {} values to {} targets", values.len(), targets.len()),
            ));
        }
        self.statement_end()?;
        Ok(Stmt::new(line, StmtKind::Assign { targets, values }))
    }

    fn as_lvalue(&mut self, expr: Expr) -> PResult<LValue> {
        match expr.kind {
            ExprKind::Name(n) => Ok(LValue::Name(n)),
            ExprKind::Field { object, name } => Ok(LValue::Field { object: *object, name }),
            ExprKind::Subscript { object, index } => {
                Ok(LValue::Subscript { object: *object, index: *index })
            }
            _ => Err(self.error_at(expr.line, "invalid assignment target")),
        }
    }

    // ---- expressions, lowest to highest precedence ----

    fn expression(&mut self) -> PResult<Expr> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> PResult<Expr> {
        let mut lhs = self.and_expr()?;
        while self.check(&TokenKind::Or) {
            let line = self.line();
            self.advance();
            let rhs = self.and_expr()?;
            lhs = Expr::new(line, ExprKind::Or { lhs: Box::new(lhs), rhs: Box::new(rhs) });
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> PResult<Expr> {
        let mut lhs = self.equality()?;
        while self.check(&TokenKind::And) {
            let line = self.line();
            self.advance();
            let rhs = self.equality()?;
            lhs = Expr::new(line, ExprKind::And { lhs: Box::new(lhs), rhs: Box::new(rhs) });
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> PResult<Expr> {
        let mut lhs = self.comparison()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::EqEq => BinOp::Eq,
                TokenKind::BangEq => BinOp::Ne,
                TokenKind::Is => BinOp::Is,
                _ => return Ok(lhs),
            };
            let line = self.line();
            self.advance();
            let rhs = self.comparison()?;
            lhs = Expr::new(
                line,
                ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
            );
        }
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Lt => BinOp::Lt,
                TokenKind::Le => BinOp::Le,
                TokenKind::Gt => BinOp::Gt,
                TokenKind::Ge => BinOp::Ge,
                _ => return Ok(lhs),
            };
            let line = self.line();
            self.advance();
            let rhs = self.term()?;
            lhs = Expr::new(
                line,
                ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
            );
        }
    }

    fn term(&mut self) -> PResult<Expr> {
        let mut lhs = self.factor()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => return Ok(lhs),
            };
            let line = self.line();
            self.advance();
            let rhs = self.factor()?;
            lhs = Expr::new(
                line,
                ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
            );
        }
    }

    fn factor(&mut self) -> PResult<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Mod,
                _ => return Ok(lhs),
            };
            let line = self.line();
            self.advance();
            let rhs = self.unary()?;
            lhs = Expr::new(
                line,
                ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
            );
        }
    }

    fn unary(&mut self) -> PResult<Expr> {
        let line = self.line();
        match self.peek_kind() {
            TokenKind::Minus => {
                self.advance();
                let operand = self.unary()?;
                Ok(Expr::new(line, ExprKind::Unary { op: UnOp::Neg, operand: Box::new(operand) }))
            }
            TokenKind::Bang => {
                self.advance();
                let operand = self.unary()?;
                Ok(Expr::new(line, ExprKind::Unary { op: UnOp::Not, operand: Box::new(operand) }))
            }
            _ => self.power(),
        }
    }

    /// `^` binds tighter than unary minus on the left and associates right:
    /// `-2 ^ 2` is `-(2^2)`, `2 ^ 3 ^ 2` is `2^(3^2)`.
    fn power(&mut self) -> PResult<Expr> {
        let lhs = self.postfix()?;
        if self.check(&TokenKind::Caret) {
            let line = self.line();
            self.advance();
            let rhs = self.unary()?;
            return Ok(Expr::new(
                line,
                ExprKind::Binary { op: BinOp::Pow, lhs: Box::new(lhs), rhs: Box::new(rhs) },
            ));
        }
        Ok(lhs)
    }

    fn postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            let line = self.line();
            match self.peek_kind() {
                TokenKind::LParen => {
                    let args = self.arg_list()?;
                    // `obj.m(...)` fuses into a direct invocation.
                    expr = match expr.kind {
                        ExprKind::Field { object, name } => {
                            Expr::new(line, ExprKind::Invoke { object, name, args })
                        }
                        _ => Expr::new(line, ExprKind::Call { callee: Box::new(expr), args }),
                    };
                }
                TokenKind::Dot => {
                    self.advance();
                    let name = self.expect_name("field name after '.'")?;
                    expr = Expr::new(line, ExprKind::Field { object: Box::new(expr), name });
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.expression()?;
                    self.expect(&TokenKind::RBracket, "']' after subscript")?;
                    expr = Expr::new(
                        line,
                        ExprKind::Subscript { object: Box::new(expr), index: Box::new(index) },
                    );
                }
                _ => return Ok(expr),
            }
        }
    }

    fn arg_list(&mut self) -> PResult<Vec<Expr>> {
        self.expect(&TokenKind::LParen, "'('")?;
        let mut args = Vec::new();
        self.skip_newlines();
        if !self.check(&TokenKind::RParen) {
            loop {
                args.push(self.expression()?);
                self.skip_newlines();
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
        }
        self.expect(&TokenKind::RParen, "')' after arguments")?;
        Ok(args)
    }

    fn primary(&mut self) -> PResult<Expr> {
        let line = self.line();
        let kind = self.peek_kind().clone();
        match kind {
            TokenKind::Num(n) => {
                self.advance();
                Ok(Expr::new(line, ExprKind::Num(n)))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::new(line, ExprKind::Str(s)))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::new(line, ExprKind::Bool(true)))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::new(line, ExprKind::Bool(false)))
            }
            TokenKind::Null => {
                self.advance();
                Ok(Expr::new(line, ExprKind::Null))
            }
            TokenKind::This => {
                self.advance();
                Ok(Expr::new(line, ExprKind::This))
            }
            TokenKind::Name(n) => {
                self.advance();
                Ok(Expr::new(line, ExprKind::Name(n)))
            }
            TokenKind::Super => {
                self.advance();
                self.expect(&TokenKind::Dot, "'.' after 'super'")?;
                let name = self.expect_name("method name after 'super.'")?;
                let args = self.arg_list()?;
                Ok(Expr::new(line, ExprKind::SuperCall { name, args }))
            }
            TokenKind::Yield => {
                self.advance();
                if self.fn_depth == 0 {
                    return Err(self.error_at(line, "'yield' outside of a function"));
                }
                let value = if self.yield_has_value() {
                    Some(Box::new(self.expression()?))
                } else {
                    None
                };
                Ok(Expr::new(line, ExprKind::Yield(value)))
            }
            TokenKind::Fun => {
                self.advance();
                let body = self.fun_body(None, line)?;
                Ok(Expr::new(line, ExprKind::Lambda(Box::new(body))))
            }
            TokenKind::LParen => {
                self.advance();
                self.skip_newlines();
                if self.matches(&TokenKind::RParen) {
                    return Ok(Expr::new(line, ExprKind::Tuple(Vec::new())));
                }
                let first = self.expression()?;
                self.skip_newlines();
                if self.matches(&TokenKind::Comma) {
                    let mut items = vec![first];
                    self.skip_newlines();
                    while !self.check(&TokenKind::RParen) {
                        items.push(self.expression()?);
                        self.skip_newlines();
                        if !self.matches(&TokenKind::Comma) {
                            break;
                        }
                        self.skip_newlines();
                    }
                    self.expect(&TokenKind::RParen, "')' after tuple")?;
                    Ok(Expr::new(line, ExprKind::Tuple(items)))
                } else {
                    self.expect(&TokenKind::RParen, "')' after expression")?;
                    Ok(first)
                }
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                self.skip_newlines();
                while !self.check(&TokenKind::RBracket) {
                    items.push(self.expression()?);
                    self.skip_newlines();
                    if !self.matches(&TokenKind::Comma) {
                        break;
                    }
                    self.skip_newlines();
                }
                self.expect(&TokenKind::RBracket, "']' after list")?;
                Ok(Expr::new(line, ExprKind::List(items)))
            }
            TokenKind::LBrace => {
                self.advance();
                let mut entries = Vec::new();
                self.skip_newlines();
                while !self.check(&TokenKind::RBrace) {
                    let key = self.expression()?;
                    self.expect(&TokenKind::Colon, "':' after table key")?;
                    let value = self.expression()?;
                    entries.push((key, value));
                    self.skip_newlines();
                    if !self.matches(&TokenKind::Comma) {
                        break;
                    }
                    self.skip_newlines();
                }
                self.expect(&TokenKind::RBrace, "'}' after table")?;
                Ok(Expr::new(line, ExprKind::Table(entries)))
            }
            other => Err(self.error(format!("expected expression, found {}", other.describe()))),
        }
    }

    fn yield_has_value(&self) -> bool {
        !matches!(
            self.peek_kind(),
            TokenKind::Newline
                | TokenKind::Semicolon
                | TokenKind::Eof
                | TokenKind::End
                | TokenKind::Else
                | TokenKind::Elif
                | TokenKind::Except
                | TokenKind::Ensure
                | TokenKind::RParen
                | TokenKind::RBracket
                | TokenKind::RBrace
                | TokenKind::Comma
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Vec<Stmt> {
        Parser::new(src).unwrap().parse().unwrap_or_else(|errs| {
            panic!("parse failed: {:?}", errs);
        })
    }

    fn parse_err(src: &str) -> Vec<CompileError> {
        Parser::new(src).unwrap().parse().expect_err("expected parse failure")
    }

    #[test]
    fn test_var_decl_with_arithmetic() {
        let stmts = parse_ok("var x = 1 + 2 * 3");
        assert_eq!(stmts.len(), 1);
        match &stmts[0].kind {
            StmtKind::VarDecl { names, init } => {
                assert_eq!(names, &["x"]);
                // Precedence: 1 + (2 * 3)
                match &init[0].kind {
                    ExprKind::Binary { op: BinOp::Add, rhs, .. } => {
                        assert!(matches!(rhs.kind, ExprKind::Binary { op: BinOp::Mul, .. }));
                    }
                    other => panic!("unexpected init: {:?}", other),
                }
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn test_fun_decl_and_call() {
        let stmts = parse_ok("fun fib(n) if n < 2 then return n end; return fib(n-1)+fib(n-2) end\nprint(fib(10))");
        assert_eq!(stmts.len(), 2);
        assert!(matches!(stmts[0].kind, StmtKind::FunDecl(_)));
        assert!(matches!(stmts[1].kind, StmtKind::Expr(_)));
    }

    #[test]
    fn test_method_call_fuses_to_invoke() {
        let stmts = parse_ok("obj.method(1, 2)");
        match &stmts[0].kind {
            StmtKind::Expr(e) => {
                assert!(matches!(&e.kind, ExprKind::Invoke { name, args, .. }
                    if name == "method" && args.len() == 2));
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn test_field_access_without_call() {
        let stmts = parse_ok("var y = obj.field");
        match &stmts[0].kind {
            StmtKind::VarDecl { init, .. } => {
                assert!(matches!(&init[0].kind, ExprKind::Field { .. }));
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn test_class_with_super() {
        let stmts = parse_ok(
            "class D is C\n fun m() return super.m() + 1 end\nend",
        );
        match &stmts[0].kind {
            StmtKind::ClassDecl { name, superclass, methods, .. } => {
                assert_eq!(name, "D");
                assert!(superclass.is_some());
                assert_eq!(methods.len(), 1);
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn test_try_except_ensure() {
        let stmts = parse_ok(
            "try\n f()\nexcept TypeException e\n print(e)\nensure\n cleanup()\nend",
        );
        match &stmts[0].kind {
            StmtKind::Try { handlers, ensure, .. } => {
                assert_eq!(handlers.len(), 1);
                assert_eq!(handlers[0].var, "e");
                assert!(ensure.is_some());
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn test_try_requires_handler_or_ensure() {
        let errs = parse_err("try\n f()\nend");
        assert!(errs[0].message.contains("except"));
    }

    #[test]
    fn test_for_in_with_tuple_targets() {
        let stmts = parse_ok("for k, v in t do print(k) end");
        match &stmts[0].kind {
            StmtKind::For { targets, .. } => assert_eq!(targets, &["k", "v"]),
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn test_import_forms() {
        let stmts = parse_ok("import a.b.c\nimport x as y\nimport m for f, g");
        assert!(matches!(&stmts[0].kind,
            StmtKind::Import { module, alias: None, names } if module == "a.b.c" && names.is_empty()));
        assert!(matches!(&stmts[1].kind,
            StmtKind::Import { module, alias: Some(a), .. } if module == "x" && a == "y"));
        assert!(matches!(&stmts[2].kind,
            StmtKind::Import { module, names, .. } if module == "m" && names.len() == 2));
    }

    #[test]
    fn test_lambda_with_yield() {
        let stmts = parse_ok("var g = fun() yield 1; yield 2 end");
        match &stmts[0].kind {
            StmtKind::VarDecl { init, .. } => {
                assert!(matches!(&init[0].kind, ExprKind::Lambda(_)));
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn test_yield_outside_function_rejected() {
        let errs = parse_err("yield 1");
        assert!(errs[0].message.contains("yield"));
    }

    #[test]
    fn test_unpacking_assignment() {
        let stmts = parse_ok("a, b = f()");
        match &stmts[0].kind {
            StmtKind::Assign { targets, values } => {
                assert_eq!(targets.len(), 2);
                assert_eq!(values.len(), 1);
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn test_mismatched_value_count_rejected() {
        let errs = parse_err("a, b = 1, 2, 3");
        assert!(errs[0].message.contains("cannot assign"));
    }

    #[test]
    fn test_vararg_params() {
        let stmts = parse_ok("fun f(a, rest...) end");
        match &stmts[0].kind {
            StmtKind::FunDecl(body) => {
                assert!(body.vararg);
                assert_eq!(body.params.len(), 2);
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn test_defaults_must_trail() {
        let errs = parse_err("fun f(a = 1, b) end");
        assert!(errs[0].message.contains("default"));
    }

    #[test]
    fn test_multiple_errors_reported() {
        let errs = parse_err("var = 1\nvar y = )\n");
        assert!(errs.len() >= 2);
    }

    #[test]
    fn test_table_and_list_literals() {
        let stmts = parse_ok("var t = {\"a\" : 1, \"b\" : 2}\nvar l = [1, 2, 3]\nvar tup = (1, 2)");
        assert_eq!(stmts.len(), 3);
    }

    #[test]
    fn test_power_right_associative() {
        let stmts = parse_ok("var x = 2 ^ 3 ^ 2");
        match &stmts[0].kind {
            StmtKind::VarDecl { init, .. } => match &init[0].kind {
                ExprKind::Binary { op: BinOp::Pow, rhs, .. } => {
                    assert!(matches!(rhs.kind, ExprKind::Binary { op: BinOp::Pow, .. }));
                }
                other => panic!("unexpected: {:?}", other),
            },
            other => panic!("unexpected stmt: {:?}", other),
        }
    }
}
