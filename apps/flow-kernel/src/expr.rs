// apps/flow-kernel/src/expr.rs
// Purpose: Guarded-expression evaluator for decision, loop and join nodes.
// Architecture: Control Flow Layer
// Dependencies: serde_json
//
// The language is deliberately tiny: dotted paths over the execution state,
// comparison, boolean logic, arithmetic and membership. No calls, no
// assignment, no I/O. Evaluation is pure over the supplied scope.

use serde_json::Value;
use std::collections::HashMap;

use crate::error::EngineError;

/// Read-only view of the execution state an expression may see.
pub struct EvalScope<'a> {
    /// The execution input, under `input.*`.
    pub input: &'a Value,
    /// Outputs of completed nodes, under `output.<node_id>.*`.
    pub outputs: &'a HashMap<String, Value>,
    /// User scratch carried through the execution, under `context.*`.
    pub context: &'a Value,
    /// Loop counter; resolvable only inside a loop body.
    pub iteration: Option<u64>,
}

impl<'a> EvalScope<'a> {
    pub fn new(input: &'a Value, outputs: &'a HashMap<String, Value>, context: &'a Value) -> Self {
        Self { input, outputs, context, iteration: None }
    }

    pub fn with_iteration(mut self, iteration: u64) -> Self {
        self.iteration = Some(iteration);
        self
    }
}

// === AST ===

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Path(Vec<String>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    In,
    Add,
    Sub,
    Mul,
    Div,
}

// === LEXER ===

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    Plus,
    Minus,
    Star,
    Slash,
    Dot,
    LParen,
    RParen,
}

fn lex(src: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    // single '=' is accepted as equality
                    tokens.push(Token::Eq);
                    i += 1;
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    return Err("unexpected '!'".to_string());
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return Err("unterminated string literal".to_string()),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    // a digit followed by ".ident" is a number then a path dot,
                    // but numbers like 0.5 must consume the dot
                    if chars[i] == '.'
                        && !chars.get(i + 1).map(|c| c.is_ascii_digit()).unwrap_or(false)
                    {
                        break;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse::<f64>().map_err(|_| format!("bad number `{text}`"))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(Token::Ident(word));
            }
            other => return Err(format!("unexpected character `{other}`")),
        }
    }

    Ok(tokens)
}

// === PARSER ===
// Precedence, loosest first: or, and, not, comparison/in, +-, */, unary -, primary.

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn peek_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(w)) if w == word)
    }

    fn parse_expr(&mut self) -> Result<Expr, String> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.peek_keyword("or") {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_not()?;
        while self.peek_keyword("and") {
            self.next();
            let right = self.parse_not()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, String> {
        if self.peek_keyword("not") {
            self.next();
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Some(Token::Lt) => Some(BinOp::Lt),
            Some(Token::Le) => Some(BinOp::Le),
            Some(Token::Gt) => Some(BinOp::Gt),
            Some(Token::Ge) => Some(BinOp::Ge),
            Some(Token::Eq) => Some(BinOp::Eq),
            Some(Token::Ne) => Some(BinOp::Ne),
            Some(Token::Ident(w)) if w == "in" => Some(BinOp::In),
            _ => None,
        };
        if let Some(op) = op {
            self.next();
            let right = self.parse_additive()?;
            return Ok(Expr::Binary(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.next();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => break,
            };
            self.next();
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Ident(w)) if w == "true" => Ok(Expr::Bool(true)),
            Some(Token::Ident(w)) if w == "false" => Ok(Expr::Bool(false)),
            Some(Token::Ident(w)) if w == "null" => Ok(Expr::Null),
            Some(Token::Ident(first)) => {
                let mut path = vec![first];
                while matches!(self.peek(), Some(Token::Dot)) {
                    self.next();
                    match self.next() {
                        Some(Token::Ident(seg)) => path.push(seg),
                        other => return Err(format!("expected field name after '.', got {other:?}")),
                    }
                }
                Ok(Expr::Path(path))
            }
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    other => Err(format!("expected ')', got {other:?}")),
                }
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}

/// Parse without evaluating. The catalog runs this at load time so syntax
/// errors fail the flow instead of the execution.
pub fn parse(src: &str) -> Result<Expr, EngineError> {
    let err = |reason: String| EngineError::Expression { expr: src.to_string(), reason };
    let tokens = lex(src).map_err(err)?;
    if tokens.is_empty() {
        return Err(EngineError::Expression {
            expr: src.to_string(),
            reason: "empty expression".to_string(),
        });
    }
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser
        .parse_expr()
        .map_err(|reason| EngineError::Expression { expr: src.to_string(), reason })?;
    if parser.pos != parser.tokens.len() {
        return Err(EngineError::Expression {
            expr: src.to_string(),
            reason: format!("trailing input at token {}", parser.pos),
        });
    }
    Ok(ast)
}

// === EVALUATION ===

fn resolve_path(path: &[String], scope: &EvalScope) -> Result<Value, String> {
    let (root, rest) = path.split_first().expect("non-empty path");

    let base: Value = match root.as_str() {
        "input" => scope.input.clone(),
        "context" => scope.context.clone(),
        "iteration" => {
            if !rest.is_empty() {
                return Err("`iteration` has no fields".to_string());
            }
            return match scope.iteration {
                Some(i) => Ok(Value::from(i)),
                None => Err("`iteration` is only available inside a loop body".to_string()),
            };
        }
        "output" => {
            let (node, tail) = rest
                .split_first()
                .ok_or_else(|| "`output` requires a node id".to_string())?;
            let out = scope
                .outputs
                .get(node)
                .ok_or_else(|| format!("no output recorded for node `{node}`"))?;
            return descend(out, tail, path);
        }
        other => return Err(format!("unresolved variable `{other}`")),
    };

    descend(&base, rest, path)
}

fn descend(base: &Value, segments: &[String], full: &[String]) -> Result<Value, String> {
    let mut current = base;
    for seg in segments {
        match current.get(seg) {
            Some(v) => current = v,
            None => return Err(format!("unresolved variable `{}`", full.join("."))),
        }
    }
    Ok(current.clone())
}

fn as_bool(v: &Value) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("expected a boolean, got {v}"))
}

fn as_number(v: &Value) -> Result<f64, String> {
    v.as_f64().ok_or_else(|| format!("expected a number, got {v}"))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn eval(expr: &Expr, scope: &EvalScope) -> Result<Value, String> {
    match expr {
        Expr::Number(n) => Ok(Value::from(*n)),
        Expr::Str(s) => Ok(Value::from(s.clone())),
        Expr::Bool(b) => Ok(Value::from(*b)),
        Expr::Null => Ok(Value::Null),
        Expr::Path(path) => resolve_path(path, scope),
        Expr::Not(inner) => {
            let v = eval(inner, scope)?;
            Ok(Value::from(!as_bool(&v)?))
        }
        Expr::Neg(inner) => {
            let v = eval(inner, scope)?;
            Ok(Value::from(-as_number(&v)?))
        }
        Expr::Binary(op, left, right) => {
            // short-circuit the logical operators
            match op {
                BinOp::And => {
                    let l = as_bool(&eval(left, scope)?)?;
                    if !l {
                        return Ok(Value::from(false));
                    }
                    return Ok(Value::from(as_bool(&eval(right, scope)?)?));
                }
                BinOp::Or => {
                    let l = as_bool(&eval(left, scope)?)?;
                    if l {
                        return Ok(Value::from(true));
                    }
                    return Ok(Value::from(as_bool(&eval(right, scope)?)?));
                }
                _ => {}
            }

            let l = eval(left, scope)?;
            let r = eval(right, scope)?;
            match op {
                BinOp::Eq => Ok(Value::from(values_equal(&l, &r))),
                BinOp::Ne => Ok(Value::from(!values_equal(&l, &r))),
                BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                    let ord = match (&l, &r) {
                        (Value::String(a), Value::String(b)) => a.cmp(b),
                        _ => as_number(&l)?
                            .partial_cmp(&as_number(&r)?)
                            .ok_or_else(|| "incomparable numbers".to_string())?,
                    };
                    let result = match op {
                        BinOp::Lt => ord.is_lt(),
                        BinOp::Le => ord.is_le(),
                        BinOp::Gt => ord.is_gt(),
                        BinOp::Ge => ord.is_ge(),
                        _ => unreachable!(),
                    };
                    Ok(Value::from(result))
                }
                BinOp::In => match (&l, &r) {
                    (needle, Value::Array(items)) => {
                        Ok(Value::from(items.iter().any(|i| values_equal(i, needle))))
                    }
                    (Value::String(needle), Value::String(hay)) => {
                        Ok(Value::from(hay.contains(needle.as_str())))
                    }
                    (Value::String(key), Value::Object(map)) => {
                        Ok(Value::from(map.contains_key(key)))
                    }
                    _ => Err(format!("`in` not defined for {l} in {r}")),
                },
                BinOp::Add => Ok(Value::from(as_number(&l)? + as_number(&r)?)),
                BinOp::Sub => Ok(Value::from(as_number(&l)? - as_number(&r)?)),
                BinOp::Mul => Ok(Value::from(as_number(&l)? * as_number(&r)?)),
                BinOp::Div => {
                    let divisor = as_number(&r)?;
                    if divisor == 0.0 {
                        return Err("division by zero".to_string());
                    }
                    Ok(Value::from(as_number(&l)? / divisor))
                }
                BinOp::And | BinOp::Or => unreachable!(),
            }
        }
    }
}

pub fn evaluate(src: &str, scope: &EvalScope) -> Result<Value, EngineError> {
    let ast = parse(src)?;
    eval(&ast, scope).map_err(|reason| EngineError::Expression {
        expr: src.to_string(),
        reason,
    })
}

/// Evaluate a guard condition. Non-boolean results are errors, never coerced.
pub fn evaluate_bool(src: &str, scope: &EvalScope) -> Result<bool, EngineError> {
    let v = evaluate(src, scope)?;
    v.as_bool().ok_or_else(|| EngineError::Expression {
        expr: src.to_string(),
        reason: format!("condition evaluated to non-boolean {v}"),
    })
}

/// Evaluate a ranking expression, e.g. a `best_by` score.
pub fn evaluate_number(src: &str, scope: &EvalScope) -> Result<f64, EngineError> {
    let v = evaluate(src, scope)?;
    v.as_f64().ok_or_else(|| EngineError::Expression {
        expr: src.to_string(),
        reason: format!("expression evaluated to non-number {v}"),
    })
}
