use crate::types::{ParamDirection, ValueType};

use super::lexer::Pos;

#[derive(Debug, Clone)]
pub(crate) struct ShaderAst {
    pub name: String,
    pub params: Vec<ParamAst>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub(crate) struct ParamAst {
    pub direction: ParamDirection,
    pub ty: ValueType,
    pub name: String,
    pub default: Option<Expr>,
    pub pos: Pos,
}

#[derive(Debug, Clone)]
pub(crate) struct Stmt {
    pub kind: StmtKind,
    pub pos: Pos,
}

#[derive(Debug, Clone)]
pub(crate) enum StmtKind {
    Decl {
        ty: ValueType,
        name: String,
        init: Option<Expr>,
    },
    Assign {
        name: String,
        value: Expr,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    Return,
    Block(Vec<Stmt>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Expr {
    pub kind: ExprKind,
    pub pos: Pos,
}

#[derive(Debug, Clone)]
pub(crate) enum ExprKind {
    Float(f32),
    Int(i32),
    Bool(bool),
    Ident(String),
    Global(String),
    MakeClosure {
        closure: String,
        args: Vec<Expr>,
    },
    Sample {
        texture: String,
        alpha: bool,
        u: Box<Expr>,
        v: Box<Expr>,
    },
    Construct {
        ty: ValueType,
        args: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Component {
        expr: Box<Expr>,
        index: usize,
    },
}
