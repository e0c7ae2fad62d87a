//! Recursive-descent parser for one `shader` definition.

use crate::error::Diagnostic;
use crate::types::{ParamDirection, ValueType};

use super::ast::{BinaryOp, Expr, ExprKind, ParamAst, ShaderAst, Stmt, StmtKind, UnaryOp};
use super::lexer::{Pos, Tok, Token};

type PResult<T> = Result<T, Diagnostic>;

/// Parser recursion allowed for parentheses, calls, unary operators and blocks.
const MAX_NESTING: usize = 64;
/// Height of a single expression tree, so lowering and evaluation stay shallow.
const MAX_EXPR_HEIGHT: usize = 128;

pub(crate) struct Parser {
    tokens: Vec<Token>,
    at: usize,
    nesting: usize,
    // Height of the expression most recently returned by a parse_* method.
    height: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            at: 0,
            nesting: 0,
            height: 0,
        }
    }

    fn nested<T>(&mut self, what: &str, parse: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        if self.nesting >= MAX_NESTING {
            let pos = self.peek().pos;
            return Err(pos.diag(format!("{what} nests too deeply")));
        }
        self.nesting += 1;
        let result = parse(self);
        self.nesting -= 1;
        result
    }

    fn set_height(&mut self, pos: Pos, height: usize) -> PResult<()> {
        if height > MAX_EXPR_HEIGHT {
            return Err(pos.diag("expression nests too deeply"));
        }
        self.height = height;
        Ok(())
    }

    fn peek(&self) -> &Token {
        // tokenize() always terminates the stream with Eof.
        &self.tokens[self.at.min(self.tokens.len() - 1)]
    }

    fn peek_tok_at(&self, n: usize) -> &Tok {
        &self.tokens[(self.at + n).min(self.tokens.len() - 1)].tok
    }

    fn advance(&mut self) -> Token {
        let t = self.peek().clone();
        if self.at < self.tokens.len() - 1 {
            self.at += 1;
        }
        t
    }

    fn is_punct(&self, p: &str) -> bool {
        matches!(&self.peek().tok, Tok::Punct(q) if *q == p)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.is_punct(p) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> PResult<Pos> {
        let t = self.peek().clone();
        if self.eat_punct(p) {
            Ok(t.pos)
        } else {
            Err(t.pos.diag(format!("expected '{p}', found {}", describe(&t.tok))))
        }
    }

    fn is_ident(&self, name: &str) -> bool {
        matches!(&self.peek().tok, Tok::Ident(s) if s == name)
    }

    fn expect_ident(&mut self) -> PResult<(String, Pos)> {
        let t = self.advance();
        match t.tok {
            Tok::Ident(s) => Ok((s, t.pos)),
            other => Err(t.pos.diag(format!("expected identifier, found {}", describe(&other)))),
        }
    }

    fn type_keyword(&self) -> Option<ValueType> {
        match &self.peek().tok {
            Tok::Ident(s) => ValueType::from_keyword(s),
            _ => None,
        }
    }

    pub fn parse_shader(&mut self) -> PResult<ShaderAst> {
        if !self.is_ident("shader") {
            let t = self.peek();
            return Err(t.pos.diag(format!("expected 'shader', found {}", describe(&t.tok))));
        }
        self.advance();
        let (name, _) = self.expect_ident()?;

        self.expect_punct("(")?;
        let mut params = Vec::new();
        if !self.is_punct(")") {
            loop {
                params.push(self.parse_param()?);
                if !self.eat_punct(",") {
                    break;
                }
            }
        }
        self.expect_punct(")")?;
        let body = self.parse_block()?;

        let t = self.peek();
        if t.tok != Tok::Eof {
            return Err(t.pos.diag(format!(
                "unexpected {} after the shader body",
                describe(&t.tok)
            )));
        }
        Ok(ShaderAst { name, params, body })
    }

    fn parse_param(&mut self) -> PResult<ParamAst> {
        let pos = self.peek().pos;
        let direction = if self.is_ident("out") {
            self.advance();
            ParamDirection::Out
        } else {
            if self.is_ident("in") {
                self.advance();
            }
            ParamDirection::In
        };
        let ty = self.parse_type()?;
        let (name, _) = self.expect_ident()?;
        let default = if self.eat_punct("=") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(ParamAst {
            direction,
            ty,
            name,
            default,
            pos,
        })
    }

    fn parse_type(&mut self) -> PResult<ValueType> {
        let t = self.advance();
        if let Tok::Ident(s) = &t.tok {
            if let Some(ty) = ValueType::from_keyword(s) {
                return Ok(ty);
            }
        }
        Err(t.pos.diag(format!("expected a type, found {}", describe(&t.tok))))
    }

    fn parse_block(&mut self) -> PResult<Vec<Stmt>> {
        self.nested("block", Self::parse_block_body)
    }

    fn parse_block_body(&mut self) -> PResult<Vec<Stmt>> {
        self.expect_punct("{")?;
        let mut stmts = Vec::new();
        while !self.is_punct("}") {
            if self.peek().tok == Tok::Eof {
                let pos = self.peek().pos;
                return Err(pos.diag("unexpected end of input, expected '}'"));
            }
            stmts.push(self.parse_stmt()?);
        }
        self.expect_punct("}")?;
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> PResult<Stmt> {
        let pos = self.peek().pos;

        if self.is_punct("{") {
            let body = self.parse_block()?;
            return Ok(Stmt {
                kind: StmtKind::Block(body),
                pos,
            });
        }

        if self.is_ident("if") {
            self.advance();
            self.expect_punct("(")?;
            let cond = self.parse_expr()?;
            self.expect_punct(")")?;
            let then_body = self.parse_block()?;
            let else_body = if self.is_ident("else") {
                self.advance();
                if self.is_ident("if") {
                    vec![self.nested("statement", Self::parse_stmt)?]
                } else {
                    self.parse_block()?
                }
            } else {
                Vec::new()
            };
            return Ok(Stmt {
                kind: StmtKind::If {
                    cond,
                    then_body,
                    else_body,
                },
                pos,
            });
        }

        if self.is_ident("return") {
            self.advance();
            self.expect_punct(";")?;
            return Ok(Stmt {
                kind: StmtKind::Return,
                pos,
            });
        }

        if let Some(ty) = self.type_keyword() {
            if matches!(self.peek_tok_at(1), Tok::Ident(_)) {
                self.advance();
                let (name, _) = self.expect_ident()?;
                let init = if self.eat_punct("=") {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                self.expect_punct(";")?;
                return Ok(Stmt {
                    kind: StmtKind::Decl { ty, name, init },
                    pos,
                });
            }
        }

        if matches!(self.peek().tok, Tok::Ident(_)) && matches!(self.peek_tok_at(1), Tok::Punct("=")) {
            let (name, _) = self.expect_ident()?;
            self.expect_punct("=")?;
            let value = self.parse_expr()?;
            self.expect_punct(";")?;
            return Ok(Stmt {
                kind: StmtKind::Assign { name, value },
                pos,
            });
        }

        Err(pos.diag(format!("expected a statement, found {}", describe(&self.peek().tok))))
    }

    pub fn parse_expr(&mut self) -> PResult<Expr> {
        self.nested("expression", |p| p.parse_binary(0))
    }

    fn parse_binary(&mut self, level: usize) -> PResult<Expr> {
        const LEVELS: [&[(&str, BinaryOp)]; 6] = [
            &[("||", BinaryOp::Or)],
            &[("&&", BinaryOp::And)],
            &[("==", BinaryOp::Eq), ("!=", BinaryOp::Ne)],
            &[
                ("<=", BinaryOp::Le),
                (">=", BinaryOp::Ge),
                ("<", BinaryOp::Lt),
                (">", BinaryOp::Gt),
            ],
            &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
            &[("*", BinaryOp::Mul), ("/", BinaryOp::Div)],
        ];

        if level == LEVELS.len() {
            return self.parse_unary();
        }

        let mut lhs = self.parse_binary(level + 1)?;
        loop {
            let Some(&(_, op)) = LEVELS[level].iter().find(|(p, _)| self.is_punct(p)) else {
                return Ok(lhs);
            };
            let pos = self.advance().pos;
            let lhs_height = self.height;
            let rhs = self.parse_binary(level + 1)?;
            self.set_height(pos, 1 + lhs_height.max(self.height))?;
            lhs = Expr {
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                pos,
            };
        }
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        let pos = self.peek().pos;
        let op = if self.eat_punct("-") {
            Some(UnaryOp::Neg)
        } else if self.eat_punct("!") {
            Some(UnaryOp::Not)
        } else {
            None
        };
        if let Some(op) = op {
            let expr = self.nested("expression", Self::parse_unary)?;
            self.set_height(pos, self.height + 1)?;
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op,
                    expr: Box::new(expr),
                },
                pos,
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_primary()?;
        while self.is_punct(".") {
            let pos = self.advance().pos;
            let (name, name_pos) = self.expect_ident()?;
            let index = match name.as_str() {
                "x" | "r" => 0,
                "y" | "g" => 1,
                "z" | "b" => 2,
                other => return Err(name_pos.diag(format!("unknown component '{other}'"))),
            };
            self.set_height(pos, self.height + 1)?;
            expr = Expr {
                kind: ExprKind::Component {
                    expr: Box::new(expr),
                    index,
                },
                pos,
            };
        }
        Ok(expr)
    }

    fn parse_angle_name(&mut self) -> PResult<String> {
        self.expect_punct("<")?;
        let (name, _) = self.expect_ident()?;
        self.expect_punct(">")?;
        Ok(name)
    }

    fn parse_args(&mut self) -> PResult<Vec<Expr>> {
        self.expect_punct("(")?;
        let mut args = Vec::new();
        let mut height = 0;
        if !self.is_punct(")") {
            loop {
                args.push(self.parse_expr()?);
                height = height.max(self.height);
                if !self.eat_punct(",") {
                    break;
                }
            }
        }
        self.expect_punct(")")?;
        self.height = height;
        Ok(args)
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let t = self.advance();
        let pos = t.pos;
        let kind = match t.tok {
            Tok::Float(v) => ExprKind::Float(v),
            Tok::Int(v) => ExprKind::Int(v),
            Tok::Punct("(") => {
                let inner = self.parse_expr()?;
                self.expect_punct(")")?;
                return Ok(inner);
            }
            Tok::Ident(name) => match name.as_str() {
                "true" => ExprKind::Bool(true),
                "false" => ExprKind::Bool(false),
                "global_value" => ExprKind::Global(self.parse_angle_name()?),
                "make_closure" => {
                    let closure = self.parse_angle_name()?;
                    let args = self.parse_args()?;
                    ExprKind::MakeClosure { closure, args }
                }
                "texture2d_sample" | "texture2d_sample_alpha" => {
                    let texture = self.parse_angle_name()?;
                    let mut args = self.parse_args()?;
                    if args.len() != 2 {
                        return Err(pos.diag(format!(
                            "{name} expects 2 arguments (u, v), got {}",
                            args.len()
                        )));
                    }
                    let v = args.pop().map(Box::new);
                    let u = args.pop().map(Box::new);
                    let (Some(u), Some(v)) = (u, v) else {
                        return Err(pos.diag("missing texture coordinates"));
                    };
                    ExprKind::Sample {
                        texture,
                        alpha: name == "texture2d_sample_alpha",
                        u,
                        v,
                    }
                }
                _ => match ValueType::from_keyword(&name) {
                    Some(ty) if self.is_punct("(") => ExprKind::Construct {
                        ty,
                        args: self.parse_args()?,
                    },
                    Some(_) => {
                        return Err(pos.diag(format!("type '{name}' cannot be used as a value")));
                    }
                    None => ExprKind::Ident(name),
                },
            },
            other => {
                return Err(pos.diag(format!("expected an expression, found {}", describe(&other))));
            }
        };
        let height = match kind {
            ExprKind::MakeClosure { .. } | ExprKind::Sample { .. } | ExprKind::Construct { .. } => {
                self.height + 1
            }
            _ => 1,
        };
        self.set_height(pos, height)?;
        Ok(Expr { kind, pos })
    }
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Ident(s) => format!("'{s}'"),
        Tok::Float(v) => format!("'{v}'"),
        Tok::Int(v) => format!("'{v}'"),
        Tok::Punct(p) => format!("'{p}'"),
        Tok::Eof => "end of input".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::lexer::tokenize;

    fn parse(src: &str) -> PResult<ShaderAst> {
        Parser::new(tokenize(src)?).parse_shader()
    }

    #[test]
    fn parses_params_and_body() {
        let ast = parse(
            "shader mix_it(in float w = 0.5, color c, out closure bxdf) {
                color k = c * w;
                if (w > 0.25) { bxdf = make_closure<lambert>(k); } else { return; }
            }",
        )
        .unwrap();
        assert_eq!(ast.name, "mix_it");
        assert_eq!(ast.params.len(), 3);
        assert_eq!(ast.params[1].direction, ParamDirection::In);
        assert_eq!(ast.params[2].ty, ValueType::Closure);
        assert!(ast.params[0].default.is_some());
        assert_eq!(ast.body.len(), 2);
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let ast = parse("shader s(out float o) { o = 1.0 + 2.0 * 3.0; }").unwrap();
        let StmtKind::Assign { value, .. } = &ast.body[0].kind else {
            panic!("expected assignment");
        };
        let ExprKind::Binary { op, rhs, .. } = &value.kind else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(rhs.kind, ExprKind::Binary { op: BinaryOp::Mul, .. }));
    }

    fn shader_assigning(expr: &str) -> String {
        format!("shader s(out float o) {{ o = {expr}; }}")
    }

    #[test]
    fn deeply_parenthesized_expressions_are_rejected() {
        let src = shader_assigning(&format!("{}1.0{}", "(".repeat(2000), ")".repeat(2000)));
        let err = parse(&src).unwrap_err();
        assert!(err.message.contains("nests too deeply"), "{}", err.message);

        let ok = shader_assigning(&format!("{}1.0{}", "(".repeat(40), ")".repeat(40)));
        assert!(parse(&ok).is_ok());
    }

    #[test]
    fn long_operator_chains_are_rejected() {
        let terms = vec!["1.0"; 1000].join(" + ");
        let err = parse(&shader_assigning(&terms)).unwrap_err();
        assert_eq!(err.message, "expression nests too deeply");

        let negations = format!("{}1.0", "-".repeat(1000));
        assert!(parse(&shader_assigning(&negations)).is_err());

        let terms = vec!["1.0"; 100].join(" + ");
        assert!(parse(&shader_assigning(&terms)).is_ok());
    }

    #[test]
    fn deeply_nested_blocks_are_rejected() {
        let src = format!("shader s(out float o) {{ {} o = 1.0; {} }}", "{".repeat(1000), "}".repeat(1000));
        let err = parse(&src).unwrap_err();
        assert_eq!(err.message, "block nests too deeply");
    }

    #[test]
    fn syntax_errors_carry_positions() {
        let err = parse("shader s(out float o) {\n  o = 1.0\n}").unwrap_err();
        assert_eq!((err.line, err.column), (3, 1));
        assert!(err.message.contains("expected ';'"));
    }
}
