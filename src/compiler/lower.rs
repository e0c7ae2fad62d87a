//! Type checking and lowering from the syntax tree to [`IrProgram`].
//!
//! Errors do not stop lowering: each failing expression records a diagnostic
//! and yields `None`, which enclosing expressions propagate silently so one
//! mistake is reported once.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Diagnostic;
use crate::types::{ParamDirection, ShaderParam, Value, ValueType};

use super::ast::{BinaryOp, Expr, ExprKind, ShaderAst, Stmt, StmtKind, UnaryOp};
use super::ir::{eval_const, ArithOp, CmpOp, IrExpr, IrProgram, IrStmt};
use super::lexer::Pos;
use super::{ClosureRef, CompileEnv, CompiledUnit};

#[derive(Clone, Debug)]
struct TypedExpr {
    ty: ValueType,
    expr: IrExpr,
}

impl TypedExpr {
    fn new(expr: IrExpr, ty: ValueType) -> Self {
        Self { ty, expr }
    }
}

#[derive(Clone, Copy, Debug)]
struct Var {
    slot: usize,
    ty: ValueType,
    /// Parameter index for shader inputs.
    input: Option<usize>,
}

struct Lowerer<'a> {
    env: &'a CompileEnv<'a>,
    diags: Vec<Diagnostic>,
    scopes: Vec<HashMap<String, Var>>,
    next_slot: usize,
    used_inputs: Vec<bool>,
    closures: Vec<ClosureRef>,
    textures: Vec<String>,
}

pub(crate) fn lower_shader(ast: &ShaderAst, env: &CompileEnv<'_>) -> Result<CompiledUnit, Vec<Diagnostic>> {
    let mut lw = Lowerer {
        env,
        diags: Vec::new(),
        scopes: vec![HashMap::new()],
        next_slot: 0,
        used_inputs: vec![false; ast.params.len()],
        closures: Vec::new(),
        textures: Vec::new(),
    };

    let mut params = Vec::with_capacity(ast.params.len());
    for (index, p) in ast.params.iter().enumerate() {
        let default = p.default.as_ref().and_then(|d| lw.param_default(p.direction, p.ty, &p.name, d, p.pos));

        let slot = lw.next_slot;
        lw.next_slot += 1;
        let var = Var {
            slot,
            ty: p.ty,
            input: (p.direction == ParamDirection::In).then_some(index),
        };
        if lw.scopes[0].insert(p.name.clone(), var).is_some() {
            lw.error(p.pos, format!("parameter '{}' is declared twice", p.name));
        }
        params.push(ShaderParam {
            name: p.name.clone(),
            direction: p.direction,
            ty: p.ty,
            default,
        });
    }

    let body = lw.block(&ast.body);

    if !lw.diags.is_empty() {
        return Err(lw.diags);
    }
    Ok(CompiledUnit {
        shader_name: ast.name.clone(),
        params,
        used_inputs: lw.used_inputs,
        closures: lw.closures,
        textures: lw.textures,
        code: Arc::new(IrProgram {
            frame_size: lw.next_slot,
            body,
        }),
    })
}

impl<'a> Lowerer<'a> {
    fn error(&mut self, pos: Pos, message: impl Into<String>) {
        self.diags.push(pos.diag(message));
    }

    fn lookup(&self, name: &str) -> Option<Var> {
        self.scopes.iter().rev().find_map(|s| s.get(name).copied())
    }

    fn param_default(
        &mut self,
        direction: ParamDirection,
        ty: ValueType,
        name: &str,
        default: &Expr,
        pos: Pos,
    ) -> Option<Value> {
        if direction == ParamDirection::Out {
            self.error(pos, format!("output parameter '{name}' cannot have a default"));
            return None;
        }
        if ty == ValueType::Closure {
            self.error(pos, format!("closure parameter '{name}' cannot have a default"));
            return None;
        }
        // Defaults see no parameters, and any references they record are dropped.
        let (closures, textures) = (self.closures.len(), self.textures.len());
        let saved = std::mem::replace(&mut self.scopes, vec![HashMap::new()]);
        let lowered = self.expr(default);
        self.scopes = saved;
        self.closures.truncate(closures);
        self.textures.truncate(textures);

        let expr = self.coerce(lowered?, ty, default.pos, &format!("parameter '{name}'"))?;
        match eval_const(&expr) {
            Ok(v) => Some(v),
            Err(why) => {
                self.error(default.pos, format!("default for '{name}' must be constant: {why}"));
                None
            }
        }
    }

    fn coerce(&mut self, value: TypedExpr, target: ValueType, pos: Pos, what: &str) -> Option<IrExpr> {
        match (value.ty, target) {
            (a, b) if a == b => Some(value.expr),
            (ValueType::Int, ValueType::Float) => Some(IrExpr::ToFloat(Box::new(value.expr))),
            (ValueType::Int | ValueType::Float, ValueType::Float3) => {
                Some(IrExpr::Splat(Box::new(value.expr)))
            }
            (from, to) => {
                self.error(pos, format!("cannot assign a {from} value to {to} {what}"));
                None
            }
        }
    }

    fn block(&mut self, stmts: &[Stmt]) -> Vec<IrStmt> {
        self.scopes.push(HashMap::new());
        let out = stmts.iter().filter_map(|s| self.stmt(s)).collect();
        self.scopes.pop();
        out
    }

    fn stmt(&mut self, stmt: &Stmt) -> Option<IrStmt> {
        match &stmt.kind {
            StmtKind::Decl { ty, name, init } => {
                let value = match init {
                    Some(e) => {
                        let v = self.expr(e);
                        v.and_then(|v| self.coerce(v, *ty, e.pos, &format!("variable '{name}'")))
                    }
                    None => Some(IrExpr::Const(ty.zero())),
                };
                let innermost = self.scopes.len() - 1;
                if self.scopes[innermost].contains_key(name) {
                    self.error(stmt.pos, format!("'{name}' is already declared in this scope"));
                    return None;
                }
                let slot = self.next_slot;
                self.next_slot += 1;
                self.scopes[innermost].insert(
                    name.clone(),
                    Var {
                        slot,
                        ty: *ty,
                        input: None,
                    },
                );
                Some(IrStmt::Store { slot, value: value? })
            }
            StmtKind::Assign { name, value } => {
                let Some(var) = self.lookup(name) else {
                    self.error(stmt.pos, format!("unknown identifier '{name}'"));
                    return None;
                };
                if var.input.is_some() {
                    self.error(stmt.pos, format!("cannot assign to input parameter '{name}'"));
                    return None;
                }
                let v = self.expr(value)?;
                let value = self.coerce(v, var.ty, value.pos, &format!("'{name}'"))?;
                Some(IrStmt::Store { slot: var.slot, value })
            }
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                let cond = self.expr(cond).and_then(|c| {
                    if c.ty == ValueType::Bool {
                        Some(c.expr)
                    } else {
                        self.error(stmt.pos, format!("if condition must be bool, found {}", c.ty));
                        None
                    }
                });
                let then_body = self.block(then_body);
                let else_body = self.block(else_body);
                Some(IrStmt::If {
                    cond: cond?,
                    then_body,
                    else_body,
                })
            }
            StmtKind::Return => Some(IrStmt::Return),
            StmtKind::Block(body) => {
                let body = self.block(body);
                Some(IrStmt::If {
                    cond: IrExpr::Const(Value::Bool(true)),
                    then_body: body,
                    else_body: Vec::new(),
                })
            }
        }
    }

    fn expr(&mut self, e: &Expr) -> Option<TypedExpr> {
        match &e.kind {
            ExprKind::Float(v) => Some(TypedExpr::new(IrExpr::Const(Value::Float(*v)), ValueType::Float)),
            ExprKind::Int(v) => Some(TypedExpr::new(IrExpr::Const(Value::Int(*v)), ValueType::Int)),
            ExprKind::Bool(v) => Some(TypedExpr::new(IrExpr::Const(Value::Bool(*v)), ValueType::Bool)),
            ExprKind::Ident(name) => {
                let Some(var) = self.lookup(name) else {
                    self.error(e.pos, format!("unknown identifier '{name}'"));
                    return None;
                };
                if let Some(index) = var.input {
                    self.used_inputs[index] = true;
                }
                Some(TypedExpr::new(IrExpr::Load(var.slot), var.ty))
            }
            ExprKind::Global(name) => match self.env.globals.lookup(name) {
                Some((slot, ty)) => Some(TypedExpr::new(IrExpr::Global { slot, ty }, ty)),
                None => {
                    self.error(e.pos, format!("undeclared global '{name}'"));
                    None
                }
            },
            ExprKind::MakeClosure { closure, args } => {
                let lowered: Vec<Option<TypedExpr>> = args.iter().map(|a| self.expr(a)).collect();
                let lowered: Option<Vec<TypedExpr>> = lowered.into_iter().collect();
                let lowered = lowered?;
                let site = self.closures.len();
                self.closures.push(ClosureRef {
                    name: closure.clone(),
                    arg_types: lowered.iter().map(|a| a.ty).collect(),
                });
                Some(TypedExpr::new(
                    IrExpr::MakeClosure {
                        site,
                        args: lowered.into_iter().map(|a| a.expr).collect(),
                    },
                    ValueType::Closure,
                ))
            }
            ExprKind::Sample { texture, alpha, u, v } => {
                let u = self.expr(u).and_then(|x| self.coerce(x, ValueType::Float, e.pos, "texture coordinate"));
                let v = self.expr(v).and_then(|x| self.coerce(x, ValueType::Float, e.pos, "texture coordinate"));
                let (u, v) = (u?, v?);
                let site = match self.textures.iter().position(|t| t == texture) {
                    Some(i) => i,
                    None => {
                        self.textures.push(texture.clone());
                        self.textures.len() - 1
                    }
                };
                let ty = if *alpha { ValueType::Float } else { ValueType::Float3 };
                Some(TypedExpr::new(
                    IrExpr::Sample {
                        site,
                        alpha: *alpha,
                        u: Box::new(u),
                        v: Box::new(v),
                    },
                    ty,
                ))
            }
            ExprKind::Construct { ty, args } => self.construct(*ty, args, e.pos),
            ExprKind::Unary { op, expr } => {
                let inner = self.expr(expr)?;
                match (op, inner.ty) {
                    (UnaryOp::Neg, ValueType::Int | ValueType::Float | ValueType::Float3) => {
                        Some(TypedExpr::new(IrExpr::Neg(Box::new(inner.expr)), inner.ty))
                    }
                    (UnaryOp::Not, ValueType::Bool) => {
                        Some(TypedExpr::new(IrExpr::Not(Box::new(inner.expr)), ValueType::Bool))
                    }
                    (UnaryOp::Neg, ty) => {
                        self.error(e.pos, format!("cannot negate a {ty} value"));
                        None
                    }
                    (UnaryOp::Not, ty) => {
                        self.error(e.pos, format!("'!' expects bool, found {ty}"));
                        None
                    }
                }
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let l = self.expr(lhs);
                let r = self.expr(rhs);
                self.binary(*op, l?, r?, e.pos)
            }
            ExprKind::Component { expr, index } => {
                let inner = self.expr(expr)?;
                if inner.ty != ValueType::Float3 {
                    self.error(e.pos, format!("component access needs a float3, found {}", inner.ty));
                    return None;
                }
                Some(TypedExpr::new(
                    IrExpr::Component(Box::new(inner.expr), *index),
                    ValueType::Float,
                ))
            }
        }
    }

    fn construct(&mut self, ty: ValueType, args: &[Expr], pos: Pos) -> Option<TypedExpr> {
        let lowered: Vec<Option<TypedExpr>> = args.iter().map(|a| self.expr(a)).collect();
        let args: Vec<TypedExpr> = lowered.into_iter().collect::<Option<_>>()?;
        let scalar = |t: &TypedExpr| matches!(t.ty, ValueType::Int | ValueType::Float);

        match (ty, args.as_slice()) {
            (ValueType::Float3, [a]) if scalar(a) => {
                Some(TypedExpr::new(IrExpr::Splat(Box::new(a.expr.clone())), ty))
            }
            (ValueType::Float3, [a]) if a.ty == ValueType::Float3 => Some(a.clone()),
            (ValueType::Float3, [x, y, z]) if scalar(x) && scalar(y) && scalar(z) => Some(TypedExpr::new(
                IrExpr::MakeFloat3(
                    Box::new(x.expr.clone()),
                    Box::new(y.expr.clone()),
                    Box::new(z.expr.clone()),
                ),
                ty,
            )),
            (ValueType::Float, [a]) if scalar(a) || a.ty == ValueType::Bool => {
                Some(TypedExpr::new(IrExpr::ToFloat(Box::new(a.expr.clone())), ty))
            }
            (ValueType::Int, [a]) if scalar(a) || a.ty == ValueType::Bool => {
                Some(TypedExpr::new(IrExpr::ToInt(Box::new(a.expr.clone())), ty))
            }
            _ => {
                let found: Vec<String> = args.iter().map(|a| a.ty.to_string()).collect();
                self.error(pos, format!("no {ty} constructor takes ({})", found.join(", ")));
                None
            }
        }
    }

    /// Brings two numeric operands to a common type: int stays int, int with
    /// float becomes float, a scalar with a float3 is splatted.
    fn unify(l: TypedExpr, r: TypedExpr) -> Option<(ValueType, IrExpr, IrExpr)> {
        use ValueType::{Float, Float3, Int};
        let widen = |t: TypedExpr, to: ValueType| match (t.ty, to) {
            (a, b) if a == b => t.expr,
            (Int, Float) => IrExpr::ToFloat(Box::new(t.expr)),
            (_, _) => IrExpr::Splat(Box::new(t.expr)),
        };
        let ty = match (l.ty, r.ty) {
            (Int, Int) => Int,
            (Int | Float, Int | Float) => Float,
            (Int | Float | Float3, Int | Float | Float3) => Float3,
            _ => return None,
        };
        Some((ty, widen(l, ty), widen(r, ty)))
    }

    fn binary(&mut self, op: BinaryOp, l: TypedExpr, r: TypedExpr, pos: Pos) -> Option<TypedExpr> {
        use ValueType::{Bool, Closure, Float, Float3, Int};
        let (lt, rt) = (l.ty, r.ty);
        let mismatch = |this: &mut Self| -> Option<TypedExpr> {
            this.error(pos, format!("operator '{}' cannot combine {lt} and {rt}", op.symbol()));
            None
        };

        match op {
            BinaryOp::And | BinaryOp::Or => {
                if (lt, rt) != (Bool, Bool) {
                    return mismatch(self);
                }
                let (a, b) = (Box::new(l.expr), Box::new(r.expr));
                let expr = if op == BinaryOp::And { IrExpr::And(a, b) } else { IrExpr::Or(a, b) };
                Some(TypedExpr::new(expr, Bool))
            }
            BinaryOp::Eq | BinaryOp::Ne => {
                let cmp = if op == BinaryOp::Eq { CmpOp::Eq } else { CmpOp::Ne };
                if lt == Bool && rt == Bool {
                    return Some(TypedExpr::new(
                        IrExpr::Compare {
                            op: cmp,
                            lhs: Box::new(l.expr),
                            rhs: Box::new(r.expr),
                        },
                        Bool,
                    ));
                }
                let Some((_, a, b)) = Self::unify(l, r) else {
                    return mismatch(self);
                };
                Some(TypedExpr::new(
                    IrExpr::Compare {
                        op: cmp,
                        lhs: Box::new(a),
                        rhs: Box::new(b),
                    },
                    Bool,
                ))
            }
            BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => {
                let cmp = match op {
                    BinaryOp::Lt => CmpOp::Lt,
                    BinaryOp::Gt => CmpOp::Gt,
                    BinaryOp::Le => CmpOp::Le,
                    _ => CmpOp::Ge,
                };
                match Self::unify(l, r) {
                    Some((Int | Float, a, b)) => Some(TypedExpr::new(
                        IrExpr::Compare {
                            op: cmp,
                            lhs: Box::new(a),
                            rhs: Box::new(b),
                        },
                        Bool,
                    )),
                    _ => mismatch(self),
                }
            }
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                match (op, lt, rt) {
                    (BinaryOp::Add, Closure, Closure) => {
                        return Some(TypedExpr::new(
                            IrExpr::ClosureAdd(Box::new(l.expr), Box::new(r.expr)),
                            Closure,
                        ));
                    }
                    (BinaryOp::Mul, Closure, Int | Float) => {
                        return Some(TypedExpr::new(
                            IrExpr::ClosureMul {
                                weight: Box::new(r.expr),
                                closure: Box::new(l.expr),
                            },
                            Closure,
                        ));
                    }
                    (BinaryOp::Mul, Int | Float, Closure) => {
                        return Some(TypedExpr::new(
                            IrExpr::ClosureMul {
                                weight: Box::new(l.expr),
                                closure: Box::new(r.expr),
                            },
                            Closure,
                        ));
                    }
                    _ => {}
                }
                let arith = match op {
                    BinaryOp::Add => ArithOp::Add,
                    BinaryOp::Sub => ArithOp::Sub,
                    BinaryOp::Mul => ArithOp::Mul,
                    _ => ArithOp::Div,
                };
                let Some((ty, a, b)) = Self::unify(l, r) else {
                    return mismatch(self);
                };
                Some(TypedExpr::new(
                    IrExpr::Arith {
                        op: arith,
                        ty,
                        lhs: Box::new(a),
                        rhs: Box::new(b),
                    },
                    ty,
                ))
            }
        }
    }
}
