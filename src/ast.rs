use std::fmt::Display;

/// A whole source file.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    /// Top-level statements in source order.
    pub body: Vec<Stmt>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `var name = value`
    Var { name: String, value: Expr },
    /// `fn name(params) { body }` in statement position.
    Function(FunctionDecl),
    /// `target = value`, where target is an identifier or a member chain.
    /// Compound assignments are already desugared into `target = target op value`.
    Assign { target: Expr, value: Expr },
    /// The first branch is the `if`, the rest are `elif`s.
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        otherwise: Option<Vec<Stmt>>,
    },
    While { condition: Expr, body: Vec<Stmt> },
    /// `for (counter) in (start, end[, step])`
    ForRange {
        counter: String,
        start: Expr,
        end: Expr,
        step: Option<Expr>,
        body: Vec<Stmt>,
    },
    /// `for (key, value) in iterator`
    ForEach {
        key: String,
        value: String,
        iterator: Expr,
        body: Vec<Stmt>,
    },
    Return(Option<Expr>),
    Break,
    Continue,
    /// `reflect "path" [:: {names}]`; an empty name list takes every export.
    Reflect { path: String, names: Vec<String> },
    /// `shine stmt` marks a declaration as importable by `reflect`.
    Shine(Box<Stmt>),
    /// `extern name :: "path" :: (types) -> return_type`
    Extern {
        name: String,
        path: String,
        arg_types: Vec<String>,
        return_type: String,
    },
    Delete(String),
    Expr(Expr),
}

impl Stmt {
    /// The name a declaration binds, for filtering `reflect` imports.
    pub fn declared_name(&self) -> Option<&str> {
        match self {
            Stmt::Var { name, .. } | Stmt::Extern { name, .. } => Some(name),
            Stmt::Function(decl) => Some(&decl.name),
            Stmt::Shine(inner) => inner.declared_name(),
            _ => None,
        }
    }
}

/// A named or anonymous function.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    /// `_` for function literals without a name.
    pub name: String,
    /// Parameter names in declaration order.
    pub params: Vec<String>,
    /// The function body.
    pub body: Vec<Stmt>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    /// The decoded text of a string literal, without delimiters.
    Str(String),
    Bool(bool),
    Identifier(String),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    /// `object.name` when not computed, `object[expr]` when computed.
    Member {
        object: Box<Expr>,
        property: Box<Expr>,
        computed: bool,
    },
    /// Key/value pairs of a table literal. Positional entries get number keys.
    Table(Vec<(Expr, Expr)>),
    Function(Box<FunctionDecl>),
}

/// Every operator that takes two operands.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Mod,
    Eq,
    NotEq,
    Greater,
    Less,
    GreaterEq,
    LessEq,
    And,
    Or,
}

impl BinaryOp {
    /// The bytecode mnemonic for this operator.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            BinaryOp::Add => "ADD",
            BinaryOp::Sub => "SUB",
            BinaryOp::Mul => "MUL",
            BinaryOp::Div => "DIV",
            BinaryOp::Pow => "POW",
            BinaryOp::Mod => "MOD",
            BinaryOp::Eq => "EQ",
            BinaryOp::NotEq => "NOE",
            BinaryOp::Greater => "GT",
            BinaryOp::Less => "LT",
            BinaryOp::GreaterEq => "GTE",
            BinaryOp::LessEq => "LTE",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
        }
    }

    /// Whether this is one of the four arithmetic operators plus power and modulo.
    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            BinaryOp::Add
                | BinaryOp::Sub
                | BinaryOp::Mul
                | BinaryOp::Div
                | BinaryOp::Pow
                | BinaryOp::Mod
        )
    }
}

impl Display for BinaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

/// `-x` and `!x`.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
}
