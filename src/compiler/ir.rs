//! Lowered, fully typed program form and its interpreter.
//!
//! Every name is already a frame slot, every global a layout slot, every
//! closure or texture reference a site index, and every operator is tagged
//! with the operand type it works on.

use crate::interface::DebugLevel;
use crate::types::{Float3, Value, ValueType};

use super::{ExecContext, UnitCode};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
}

#[derive(Clone, Debug)]
pub(crate) enum IrExpr {
    Const(Value),
    Load(usize),
    Global { slot: usize, ty: ValueType },
    /// Both operands share `ty` (`int`, `float` or `float3`).
    Arith {
        op: ArithOp,
        ty: ValueType,
        lhs: Box<IrExpr>,
        rhs: Box<IrExpr>,
    },
    Compare {
        op: CmpOp,
        lhs: Box<IrExpr>,
        rhs: Box<IrExpr>,
    },
    And(Box<IrExpr>, Box<IrExpr>),
    Or(Box<IrExpr>, Box<IrExpr>),
    Not(Box<IrExpr>),
    Neg(Box<IrExpr>),
    ToFloat(Box<IrExpr>),
    ToInt(Box<IrExpr>),
    Splat(Box<IrExpr>),
    MakeFloat3(Box<IrExpr>, Box<IrExpr>, Box<IrExpr>),
    Component(Box<IrExpr>, usize),
    MakeClosure { site: usize, args: Vec<IrExpr> },
    ClosureAdd(Box<IrExpr>, Box<IrExpr>),
    ClosureMul { weight: Box<IrExpr>, closure: Box<IrExpr> },
    Sample {
        site: usize,
        alpha: bool,
        u: Box<IrExpr>,
        v: Box<IrExpr>,
    },
}

#[derive(Clone, Debug)]
pub(crate) enum IrStmt {
    Store { slot: usize, value: IrExpr },
    If {
        cond: IrExpr,
        then_body: Vec<IrStmt>,
        else_body: Vec<IrStmt>,
    },
    Return,
}

#[derive(Clone, Debug)]
pub(crate) struct IrProgram {
    pub frame_size: usize,
    pub body: Vec<IrStmt>,
}

enum Flow {
    Next,
    Return,
}

/// Outcome of an arithmetic operation that can fault without aborting.
pub(crate) enum Arith {
    Value(Value),
    DivideByZero,
}

pub(crate) fn arith(op: ArithOp, lhs: Value, rhs: Value) -> Arith {
    let v = match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => match op {
            ArithOp::Add => Value::Int(a.wrapping_add(b)),
            ArithOp::Sub => Value::Int(a.wrapping_sub(b)),
            ArithOp::Mul => Value::Int(a.wrapping_mul(b)),
            ArithOp::Div => {
                if b == 0 {
                    return Arith::DivideByZero;
                }
                Value::Int(a.wrapping_div(b))
            }
        },
        (Value::Float(a), Value::Float(b)) => Value::Float(match op {
            ArithOp::Add => a + b,
            ArithOp::Sub => a - b,
            ArithOp::Mul => a * b,
            ArithOp::Div => a / b,
        }),
        (Value::Float3(a), Value::Float3(b)) => Value::Float3(match op {
            ArithOp::Add => a + b,
            ArithOp::Sub => a - b,
            ArithOp::Mul => a * b,
            ArithOp::Div => a / b,
        }),
        // Lowering never emits mixed operands.
        _ => lhs,
    };
    Arith::Value(v)
}

pub(crate) fn compare(op: CmpOp, lhs: Value, rhs: Value) -> bool {
    let ord = match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => a.partial_cmp(&b),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(&b),
        _ => None,
    };
    match op {
        CmpOp::Eq => lhs == rhs,
        CmpOp::Ne => lhs != rhs,
        CmpOp::Lt => ord.is_some_and(|o| o.is_lt()),
        CmpOp::Gt => ord.is_some_and(|o| o.is_gt()),
        CmpOp::Le => ord.is_some_and(|o| o.is_le()),
        CmpOp::Ge => ord.is_some_and(|o| o.is_ge()),
    }
}

pub(crate) fn to_float(v: Value) -> f32 {
    match v {
        Value::Float(f) => f,
        Value::Int(i) => i as f32,
        Value::Bool(b) => f32::from(u8::from(b)),
        _ => 0.0,
    }
}

pub(crate) fn to_int(v: Value) -> i32 {
    match v {
        Value::Int(i) => i,
        // Saturating truncation toward zero.
        Value::Float(f) => f as i32,
        Value::Bool(b) => i32::from(b),
        _ => 0,
    }
}

pub(crate) fn negate(v: Value) -> Value {
    match v {
        Value::Int(i) => Value::Int(i.wrapping_neg()),
        Value::Float(f) => Value::Float(-f),
        Value::Float3(f) => Value::Float3(-f),
        other => other,
    }
}

fn component(v: Value, index: usize) -> f32 {
    v.as_float3().map_or(0.0, |f| f.component(index))
}

/// Evaluates expressions that touch neither the frame nor the host. Used to
/// fold parameter defaults at compile time.
pub(crate) fn eval_const(expr: &IrExpr) -> Result<Value, &'static str> {
    Ok(match expr {
        IrExpr::Const(v) => *v,
        IrExpr::Arith { op, lhs, rhs, .. } => match arith(*op, eval_const(lhs)?, eval_const(rhs)?) {
            Arith::Value(v) => v,
            Arith::DivideByZero => return Err("integer division by zero"),
        },
        IrExpr::Compare { op, lhs, rhs } => {
            Value::Bool(compare(*op, eval_const(lhs)?, eval_const(rhs)?))
        }
        IrExpr::And(a, b) => {
            let (a, b) = (eval_const(a)?, eval_const(b)?);
            Value::Bool(a.as_bool() == Some(true) && b.as_bool() == Some(true))
        }
        IrExpr::Or(a, b) => {
            let (a, b) = (eval_const(a)?, eval_const(b)?);
            Value::Bool(a.as_bool() == Some(true) || b.as_bool() == Some(true))
        }
        IrExpr::Not(a) => Value::Bool(eval_const(a)?.as_bool() != Some(true)),
        IrExpr::Neg(a) => negate(eval_const(a)?),
        IrExpr::ToFloat(a) => Value::Float(to_float(eval_const(a)?)),
        IrExpr::ToInt(a) => Value::Int(to_int(eval_const(a)?)),
        IrExpr::Splat(a) => Value::Float3(Float3::splat(to_float(eval_const(a)?))),
        IrExpr::MakeFloat3(x, y, z) => Value::Float3(Float3::new(
            to_float(eval_const(x)?),
            to_float(eval_const(y)?),
            to_float(eval_const(z)?),
        )),
        IrExpr::Component(a, i) => Value::Float(component(eval_const(a)?, *i)),
        IrExpr::Load(_) => return Err("parameters cannot be read here"),
        IrExpr::Global { .. } => return Err("globals cannot be read here"),
        IrExpr::MakeClosure { .. } | IrExpr::ClosureAdd(..) | IrExpr::ClosureMul { .. } => {
            return Err("closures cannot be built here");
        }
        IrExpr::Sample { .. } => return Err("textures cannot be sampled here"),
    })
}

impl IrProgram {
    fn eval(&self, expr: &IrExpr, frame: &[Value], ctx: &mut ExecContext<'_, '_>) -> Value {
        match expr {
            IrExpr::Const(v) => *v,
            IrExpr::Load(slot) => frame.get(*slot).copied().unwrap_or(Value::Float(0.0)),
            IrExpr::Global { slot, ty } => ctx.global(*slot, *ty),
            IrExpr::Arith { op, ty, lhs, rhs } => {
                let l = self.eval(lhs, frame, ctx);
                let r = self.eval(rhs, frame, ctx);
                match arith(*op, l, r) {
                    Arith::Value(v) => v,
                    Arith::DivideByZero => {
                        ctx.report(DebugLevel::Warning, "integer division by zero, using 0");
                        ty.zero()
                    }
                }
            }
            IrExpr::Compare { op, lhs, rhs } => {
                let l = self.eval(lhs, frame, ctx);
                let r = self.eval(rhs, frame, ctx);
                Value::Bool(compare(*op, l, r))
            }
            IrExpr::And(a, b) => {
                let v = self.eval(a, frame, ctx).as_bool() == Some(true)
                    && self.eval(b, frame, ctx).as_bool() == Some(true);
                Value::Bool(v)
            }
            IrExpr::Or(a, b) => {
                let v = self.eval(a, frame, ctx).as_bool() == Some(true)
                    || self.eval(b, frame, ctx).as_bool() == Some(true);
                Value::Bool(v)
            }
            IrExpr::Not(a) => Value::Bool(self.eval(a, frame, ctx).as_bool() != Some(true)),
            IrExpr::Neg(a) => negate(self.eval(a, frame, ctx)),
            IrExpr::ToFloat(a) => Value::Float(to_float(self.eval(a, frame, ctx))),
            IrExpr::ToInt(a) => Value::Int(to_int(self.eval(a, frame, ctx))),
            IrExpr::Splat(a) => Value::Float3(Float3::splat(to_float(self.eval(a, frame, ctx)))),
            IrExpr::MakeFloat3(x, y, z) => {
                let x = to_float(self.eval(x, frame, ctx));
                let y = to_float(self.eval(y, frame, ctx));
                let z = to_float(self.eval(z, frame, ctx));
                Value::Float3(Float3::new(x, y, z))
            }
            IrExpr::Component(a, i) => Value::Float(component(self.eval(a, frame, ctx), *i)),
            IrExpr::MakeClosure { site, args } => {
                let values: Vec<Value> = args.iter().map(|a| self.eval(a, frame, ctx)).collect();
                ctx.make_closure(*site, &values)
            }
            IrExpr::ClosureAdd(a, b) => {
                let l = self.eval(a, frame, ctx);
                let r = self.eval(b, frame, ctx);
                ctx.closure_add(l, r)
            }
            IrExpr::ClosureMul { weight, closure } => {
                let w = to_float(self.eval(weight, frame, ctx));
                let c = self.eval(closure, frame, ctx);
                ctx.closure_mul(w, c)
            }
            IrExpr::Sample { site, alpha, u, v } => {
                let u = to_float(self.eval(u, frame, ctx));
                let v = to_float(self.eval(v, frame, ctx));
                if *alpha {
                    Value::Float(ctx.sample_alpha_2d(*site, u, v))
                } else {
                    Value::Float3(ctx.sample_2d(*site, u, v))
                }
            }
        }
    }

    fn run(&self, stmts: &[IrStmt], frame: &mut [Value], ctx: &mut ExecContext<'_, '_>) -> Flow {
        for stmt in stmts {
            match stmt {
                IrStmt::Store { slot, value } => {
                    let v = self.eval(value, frame, ctx);
                    if let Some(dst) = frame.get_mut(*slot) {
                        *dst = v;
                    }
                }
                IrStmt::If {
                    cond,
                    then_body,
                    else_body,
                } => {
                    let taken = self.eval(cond, frame, ctx).as_bool() == Some(true);
                    let body = if taken { then_body } else { else_body };
                    if let Flow::Return = self.run(body, frame, ctx) {
                        return Flow::Return;
                    }
                }
                IrStmt::Return => return Flow::Return,
            }
        }
        Flow::Next
    }
}

impl UnitCode for IrProgram {
    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn execute(&self, frame: &mut [Value], ctx: &mut ExecContext<'_, '_>) {
        self.run(&self.body, frame, ctx);
    }
}
