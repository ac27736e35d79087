//! The Brio abstract syntax tree.
//!
//! Every node carries the 1-indexed source line it started on; the compiler
//! copies it into the bytecode line table for runtime diagnostics.

/// A literal usable as a parameter default. Defaults must be compile-time
/// constants so the call machinery can fill missing arguments without
/// running user code.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstLit {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<ConstLit>,
}

/// A function literal or declaration body.
#[derive(Debug, Clone, PartialEq)]
pub struct FunBody {
    pub name: Option<String>,
    pub params: Vec<Param>,
    /// `fun f(a, b...)`: excess positionals collect into the `args` tuple.
    pub vararg: bool,
    pub body: Vec<Stmt>,
    pub line: u32,
}

/// A `native` declaration: the body lives in the module's native registry.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub vararg: bool,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    Script(FunBody),
    Native(NativeDecl),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Is,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub line: u32,
    pub kind: ExprKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    Name(String),
    This,
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Table(Vec<(Expr, Expr)>),
    Lambda(Box<FunBody>),
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Unary { op: UnOp, operand: Box<Expr> },
    /// Short-circuit `and`.
    And { lhs: Box<Expr>, rhs: Box<Expr> },
    /// Short-circuit `or`.
    Or { lhs: Box<Expr>, rhs: Box<Expr> },
    Call { callee: Box<Expr>, args: Vec<Expr> },
    /// `obj.name(args)` — compiled as a direct method invocation so no
    /// bound method object is materialized.
    Invoke { object: Box<Expr>, name: String, args: Vec<Expr> },
    Field { object: Box<Expr>, name: String },
    Subscript { object: Box<Expr>, index: Box<Expr> },
    /// `super.name(args)` inside a method.
    SuperCall { name: String, args: Vec<Expr> },
    Yield(Option<Box<Expr>>),
}

/// An assignment target.
#[derive(Debug, Clone, PartialEq)]
pub enum LValue {
    Name(String),
    Field { object: Expr, name: String },
    Subscript { object: Expr, index: Expr },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExceptClause {
    pub class: Expr,
    /// The name the caught exception is bound to, scoped to the clause body.
    pub var: String,
    pub body: Vec<Stmt>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub line: u32,
    pub kind: StmtKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `var a, b = e1, e2` — names always bind in the innermost scope.
    VarDecl { names: Vec<String>, init: Vec<Expr> },
    FunDecl(FunBody),
    NativeFunDecl(NativeDecl),
    ClassDecl { name: String, superclass: Option<Expr>, methods: Vec<Method>, line: u32 },
    If { branches: Vec<(Expr, Vec<Stmt>)>, else_body: Option<Vec<Stmt>> },
    While { cond: Expr, body: Vec<Stmt> },
    For { targets: Vec<String>, iterable: Expr, body: Vec<Stmt> },
    Return(Option<Expr>),
    Raise(Expr),
    Try { body: Vec<Stmt>, handlers: Vec<ExceptClause>, ensure: Option<Vec<Stmt>> },
    Break,
    Continue,
    /// `import a.b.c [as x | for n1, n2]`.
    Import { module: String, alias: Option<String>, names: Vec<String> },
    Block(Vec<Stmt>),
    Assign { targets: Vec<LValue>, values: Vec<Expr> },
    Expr(Expr),
}

impl Expr {
    pub fn new(line: u32, kind: ExprKind) -> Expr {
        Expr { line, kind }
    }
}

impl Stmt {
    pub fn new(line: u32, kind: StmtKind) -> Stmt {
        Stmt { line, kind }
    }
}
