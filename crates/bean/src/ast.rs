//! The abstract syntax tree.
//!
//! Two sum types, [`Expr`] and [`Stmt`], each carrying the source position of
//! the construct. Nodes derive `Clone`, which is what compound-assignment
//! desugaring relies on to duplicate its left-hand side. `Display` renders a
//! canonical source-like form used by diagnostics and tests.

use std::fmt;

use strum::Display;

use crate::{position::Position, value::format_number};

/// An identifier occurrence with its position.
#[derive(Debug, Clone)]
pub struct Ident {
    pub name: String,
    pub position: Position,
}

impl Ident {
    pub fn new(name: impl Into<String>, position: Position) -> Self {
        Self {
            name: name.into(),
            position,
        }
    }
}

/// Operators appearing in prefix, infix and logical expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Operator {
    #[strum(serialize = "+")]
    Plus,
    #[strum(serialize = "-")]
    Minus,
    #[strum(serialize = "!")]
    Bang,
    #[strum(serialize = "*")]
    Asterisk,
    #[strum(serialize = "/")]
    Slash,
    #[strum(serialize = "%")]
    Modulus,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Lte,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Gte,
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    NotEq,
    #[strum(serialize = "&&")]
    LogicalAnd,
    #[strum(serialize = "||")]
    LogicalOr,
    #[strum(serialize = "&")]
    BitAnd,
    #[strum(serialize = "|")]
    BitOr,
    #[strum(serialize = "^")]
    BitXor,
    #[strum(serialize = "<<")]
    Lshift,
    #[strum(serialize = ">>")]
    Rshift,
}

/// A function literal: parameters plus body, optionally named (named either
/// via `fn name() {}` statements or by being the value of a definition).
#[derive(Debug, Clone)]
pub struct FnLit {
    pub name: Option<String>,
    pub params: Vec<Ident>,
    pub body: Block,
}

/// A braced statement list.
#[derive(Debug, Clone)]
pub struct Block {
    pub statements: Vec<Stmt>,
}

/// One `if`/`else if` arm.
#[derive(Debug, Clone)]
pub struct IfCase {
    pub test: Expr,
    pub consequence: Block,
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub position: Position,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Ident(String),
    NumberLit(f64),
    BoolLit(bool),
    StringLit(String),
    NullLit,
    ArrayLit(Vec<Expr>),
    /// Parallel key/value lists; keys are restricted to literals by the
    /// parser.
    MapLit {
        keys: Vec<Expr>,
        values: Vec<Expr>,
    },
    Prefix {
        op: Operator,
        right: Box<Expr>,
    },
    Infix {
        op: Operator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `&&` / `||`, split from `Infix` because they lower to short-circuit
    /// jumps.
    Logical {
        op: Operator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    FnLit(FnLit),
    Call {
        function: Box<Expr>,
        args: Vec<Expr>,
    },
    Index {
        left: Box<Expr>,
        index: Box<Expr>,
    },
    Assign {
        dest: Box<Expr>,
        source: Box<Expr>,
    },
}

impl Expr {
    pub fn new(kind: ExprKind, position: Position) -> Self {
        Self { kind, position }
    }
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub position: Position,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Define {
        name: Ident,
        value: Expr,
        assignable: bool,
    },
    If {
        cases: Vec<IfCase>,
        alternative: Option<Block>,
    },
    Return(Option<Expr>),
    Expression(Expr),
    While {
        test: Expr,
        body: Block,
    },
    Break,
    Continue,
    Foreach {
        iterator: Ident,
        source: Expr,
        body: Block,
    },
    ForLoop {
        init: Option<Box<Stmt>>,
        test: Option<Expr>,
        update: Option<Expr>,
        body: Block,
    },
    Block(Block),
    Import {
        path: String,
    },
    Recover {
        error_ident: Ident,
        body: Block,
    },
}

impl Stmt {
    pub fn new(kind: StmtKind, position: Position) -> Self {
        Self { kind, position }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ")?;
        for stmt in &self.statements {
            write!(f, "{stmt} ")?;
        }
        write!(f, "}}")
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Ident(name) => write!(f, "{name}"),
            ExprKind::NumberLit(n) => write!(f, "{}", format_number(*n)),
            ExprKind::BoolLit(b) => write!(f, "{b}"),
            ExprKind::StringLit(s) => write!(f, "\"{s}\""),
            ExprKind::NullLit => write!(f, "null"),
            ExprKind::ArrayLit(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            ExprKind::MapLit { keys, values } => {
                write!(f, "{{")?;
                for (i, (key, value)) in keys.iter().zip(values).enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                write!(f, "}}")
            }
            ExprKind::Prefix { op, right } => write!(f, "({op}{right})"),
            ExprKind::Infix { op, left, right } | ExprKind::Logical { op, left, right } => {
                write!(f, "({left} {op} {right})")
            }
            ExprKind::FnLit(fn_lit) => {
                write!(f, "fn")?;
                if let Some(name) = &fn_lit.name {
                    write!(f, " {name}")?;
                }
                write!(f, "(")?;
                for (i, param) in fn_lit.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", param.name)?;
                }
                write!(f, ") {}", fn_lit.body)
            }
            ExprKind::Call { function, args } => {
                write!(f, "{function}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            ExprKind::Index { left, index } => write!(f, "({left}[{index}])"),
            ExprKind::Assign { dest, source } => write!(f, "({dest} = {source})"),
        }
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            StmtKind::Define {
                name,
                value,
                assignable,
            } => {
                let kw = if *assignable { "var" } else { "const" };
                write!(f, "{kw} {} = {value}", name.name)
            }
            StmtKind::If { cases, alternative } => {
                for (i, case) in cases.iter().enumerate() {
                    let kw = if i == 0 { "if" } else { " else if" };
                    write!(f, "{kw} ({}) {}", case.test, case.consequence)?;
                }
                if let Some(alternative) = alternative {
                    write!(f, " else {alternative}")?;
                }
                Ok(())
            }
            StmtKind::Return(Some(expr)) => write!(f, "return {expr}"),
            StmtKind::Return(None) => write!(f, "return"),
            StmtKind::Expression(expr) => write!(f, "{expr}"),
            StmtKind::While { test, body } => write!(f, "while ({test}) {body}"),
            StmtKind::Break => write!(f, "break"),
            StmtKind::Continue => write!(f, "continue"),
            StmtKind::Foreach {
                iterator,
                source,
                body,
            } => write!(f, "for ({} in {source}) {body}", iterator.name),
            StmtKind::ForLoop {
                init,
                test,
                update,
                body,
            } => {
                write!(f, "for (")?;
                if let Some(init) = init {
                    write!(f, "{init}")?;
                }
                write!(f, "; ")?;
                if let Some(test) = test {
                    write!(f, "{test}")?;
                }
                write!(f, "; ")?;
                if let Some(update) = update {
                    write!(f, "{update}")?;
                }
                write!(f, ") {body}")
            }
            StmtKind::Block(block) => write!(f, "{block}"),
            StmtKind::Import { path } => write!(f, "import \"{path}\""),
            StmtKind::Recover { error_ident, body } => {
                write!(f, "recover ({}) {body}", error_ident.name)
            }
        }
    }
}
