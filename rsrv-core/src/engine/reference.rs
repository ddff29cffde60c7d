//! A minimal arithmetic expression engine implementing [`super::Engine`].
//!
//! This stands in for the real embedded statistics engine that spec §6.5
//! treats as an opaque collaborator: enough to exercise `session`'s
//! dispatch and the wire codec end-to-end (scenarios S1/S2 in spec §8),
//! not a serious evaluator. It supports `+ - * /`, parentheses, numeric
//! literals and variable references against a per-instance global
//! environment — one instance per connection, satisfying the isolation
//! property (spec §4.7, §8 property 6).

use super::{Engine, ParseResult, ParseStatus};
use crate::wire::{Bool3, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Var(String),
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
}

#[derive(Default)]
pub struct ArithEngine {
    env: HashMap<String, Value>,
}

impl ArithEngine {
    pub fn new() -> Self {
        ArithEngine::default()
    }
}

impl Engine for ArithEngine {
    type Expr = Expr;

    fn parse(&self, src: &str, max_segments: usize) -> ParseResult<Expr> {
        let segments: Vec<&str> = src
            .split(|c| c == ';' || c == '\n')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        let taken = segments.into_iter().take(max_segments.max(1));

        let mut exprs = Vec::new();
        for seg in taken {
            match parse_expr(seg) {
                Some(e) => exprs.push(e),
                None => return ParseResult { status: ParseStatus::Error, exprs: Vec::new() },
            }
        }
        if exprs.is_empty() {
            ParseResult { status: ParseStatus::Null, exprs }
        } else {
            ParseResult { status: ParseStatus::Ok, exprs }
        }
    }

    fn try_eval(&mut self, expr: &Expr) -> Result<Value, i32> {
        eval(expr, &self.env).map(|v| Value::ArrayDouble(v))
    }

    fn install(&mut self, name: &str) -> Expr {
        Expr::Var(name.to_string())
    }

    fn bind(&mut self, target: &Expr, value: Value) {
        if let Expr::Var(name) = target {
            self.env.insert(name.clone(), value);
        }
    }
}

/// Engine error code used for "undefined variable" / malformed eval.
pub const ERR_UNDEFINED: i32 = 1;
pub const ERR_DIV_BY_ZERO: i32 = 2;

fn eval(expr: &Expr, env: &HashMap<String, Value>) -> Result<Vec<f64>, i32> {
    match expr {
        Expr::Num(n) => Ok(vec![*n]),
        Expr::Var(name) => {
            let value = env.get(name).ok_or(ERR_UNDEFINED)?;
            Ok(numeric_vec(value))
        }
        Expr::Neg(a) => Ok(eval(a, env)?.into_iter().map(|x| -x).collect()),
        Expr::Add(a, b) => broadcast(eval(a, env)?, eval(b, env)?, |x, y| Ok(x + y)),
        Expr::Sub(a, b) => broadcast(eval(a, env)?, eval(b, env)?, |x, y| Ok(x - y)),
        Expr::Mul(a, b) => broadcast(eval(a, env)?, eval(b, env)?, |x, y| Ok(x * y)),
        Expr::Div(a, b) => broadcast(eval(a, env)?, eval(b, env)?, |x, y| {
            if y == 0.0 {
                Err(ERR_DIV_BY_ZERO)
            } else {
                Ok(x / y)
            }
        }),
    }
}

fn numeric_vec(value: &Value) -> Vec<f64> {
    match value {
        Value::Int(i) => vec![*i as f64],
        Value::ArrayInt(v) => v.iter().map(|i| *i as f64).collect(),
        Value::Double(d) => vec![*d],
        Value::ArrayDouble(v) => v.clone(),
        Value::Bool(b) => vec![bool_to_f64(*b)],
        Value::ArrayBool(v) => v.iter().map(|b| bool_to_f64(*b)).collect(),
        _ => vec![f64::NAN],
    }
}

fn bool_to_f64(b: Bool3) -> f64 {
    match b {
        Bool3::True => 1.0,
        Bool3::False => 0.0,
        Bool3::Na => f64::NAN,
    }
}

fn broadcast(
    a: Vec<f64>,
    b: Vec<f64>,
    op: impl Fn(f64, f64) -> Result<f64, i32>,
) -> Result<Vec<f64>, i32> {
    let len = a.len().max(b.len());
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let x = a[i % a.len()];
        let y = b[i % b.len()];
        out.push(op(x, y)?);
    }
    Ok(out)
}

/// Recursive-descent parse of a single arithmetic expression. Returns
/// `None` on malformed input (mapped by [`ArithEngine::parse`] to
/// `ParseStatus::Error`).
fn parse_expr(src: &str) -> Option<Expr> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return None;
    }
    let mut pos = 0;
    let expr = parse_add(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return None;
    }
    Some(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Option<Vec<Tok>> {
    let mut toks = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '+' => {
                toks.push(Tok::Plus);
                i += 1;
            }
            '-' => {
                toks.push(Tok::Minus);
                i += 1;
            }
            '*' => {
                toks.push(Tok::Star);
                i += 1;
            }
            '/' => {
                toks.push(Tok::Slash);
                i += 1;
            }
            '(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            _ if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let s: String = chars[start..i].iter().collect();
                toks.push(Tok::Num(s.parse().ok()?));
            }
            _ if c.is_alphabetic() || c == '_' || c == '.' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                toks.push(Tok::Ident(chars[start..i].iter().collect()));
            }
            _ => return None,
        }
    }
    Some(toks)
}

fn parse_add(toks: &[Tok], pos: &mut usize) -> Option<Expr> {
    let mut lhs = parse_mul(toks, pos)?;
    loop {
        match toks.get(*pos) {
            Some(Tok::Plus) => {
                *pos += 1;
                let rhs = parse_mul(toks, pos)?;
                lhs = Expr::Add(Box::new(lhs), Box::new(rhs));
            }
            Some(Tok::Minus) => {
                *pos += 1;
                let rhs = parse_mul(toks, pos)?;
                lhs = Expr::Sub(Box::new(lhs), Box::new(rhs));
            }
            _ => break,
        }
    }
    Some(lhs)
}

fn parse_mul(toks: &[Tok], pos: &mut usize) -> Option<Expr> {
    let mut lhs = parse_unary(toks, pos)?;
    loop {
        match toks.get(*pos) {
            Some(Tok::Star) => {
                *pos += 1;
                let rhs = parse_unary(toks, pos)?;
                lhs = Expr::Mul(Box::new(lhs), Box::new(rhs));
            }
            Some(Tok::Slash) => {
                *pos += 1;
                let rhs = parse_unary(toks, pos)?;
                lhs = Expr::Div(Box::new(lhs), Box::new(rhs));
            }
            _ => break,
        }
    }
    Some(lhs)
}

fn parse_unary(toks: &[Tok], pos: &mut usize) -> Option<Expr> {
    if let Some(Tok::Minus) = toks.get(*pos) {
        *pos += 1;
        return Some(Expr::Neg(Box::new(parse_unary(toks, pos)?)));
    }
    parse_primary(toks, pos)
}

fn parse_primary(toks: &[Tok], pos: &mut usize) -> Option<Expr> {
    match toks.get(*pos)?.clone() {
        Tok::Num(n) => {
            *pos += 1;
            Some(Expr::Num(n))
        }
        Tok::Ident(name) => {
            *pos += 1;
            Some(Expr::Var(name))
        }
        Tok::LParen => {
            *pos += 1;
            let inner = parse_add(toks, pos)?;
            match toks.get(*pos) {
                Some(Tok::RParen) => {
                    *pos += 1;
                    Some(inner)
                }
                _ => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_simple_addition() {
        let mut engine = ArithEngine::new();
        let parsed = engine.parse("1+1", 1);
        assert_eq!(parsed.status, ParseStatus::Ok);
        let value = engine.try_eval(&parsed.exprs[0]).unwrap();
        assert_eq!(value, Value::ArrayDouble(vec![2.0]));
    }

    #[test]
    fn assignment_then_use_coerces_int_to_double() {
        let mut engine = ArithEngine::new();
        let target = engine.install("x");
        engine.bind(&target, Value::ArrayInt(vec![42]));
        let parsed = engine.parse("x*2", 1);
        let value = engine.try_eval(&parsed.exprs[0]).unwrap();
        assert_eq!(value, Value::ArrayDouble(vec![84.0]));
    }

    #[test]
    fn undefined_variable_is_an_engine_error() {
        let mut engine = ArithEngine::new();
        let parsed = engine.parse("y+1", 1);
        let err = engine.try_eval(&parsed.exprs[0]).unwrap_err();
        assert_eq!(err, ERR_UNDEFINED);
    }

    #[test]
    fn multi_expression_evaluates_each_in_order() {
        let mut engine = ArithEngine::new();
        let parsed = engine.parse("1+1; 2+2", 2);
        assert_eq!(parsed.exprs.len(), 2);
        let last = engine.try_eval(&parsed.exprs[1]).unwrap();
        assert_eq!(last, Value::ArrayDouble(vec![4.0]));
    }

    #[test]
    fn malformed_expression_is_a_parse_error() {
        let engine = ArithEngine::new();
        let parsed = engine.parse("1+*", 1);
        assert_eq!(parsed.status, ParseStatus::Error);
    }
}
