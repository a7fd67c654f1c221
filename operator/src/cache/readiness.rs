//! A small CEL-shaped expression language for the `eno.azure.io/readiness`
//! and `eno.azure.io/readiness-<name>` annotations. Expressions evaluate
//! against a single `self` variable bound to the live manifest.
//!
//! Grammar (subset of CEL sufficient for readiness checks):
//!
//! ```text
//! expr       := or_expr
//! or_expr    := and_expr ( "||" and_expr )*
//! and_expr   := unary ( "&&" unary )*
//! unary      := "!" unary | comparison
//! comparison := primary ( ("==" | "!=" | "<" | "<=" | ">" | ">=") primary )?
//! primary    := "true" | "false" | number | string | "has(" path ")" | path | "(" expr ")"
//! path       := ident ( "." ident )*
//! ```

use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Bool(bool),
    Number(f64),
    String(String),
    Path(Vec<String>),
    Has(Vec<String>),
    Not(Box<Expr>),
    Cmp(Box<Expr>, CmpOp, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug)]
pub struct ParseError(String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "readiness expression parse error: {}", self.0)
    }
}

impl std::error::Error for ParseError {}

/// Parses a readiness expression. The result is cheap to clone and is kept
/// precompiled in the reconstitution cache rather than reparsed per check.
pub fn parse(src: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(ParseError(format!(
            "unexpected trailing input at token {}",
            parser.pos
        )));
    }
    Ok(expr)
}

/// The outcome of evaluating a readiness expression against a live object.
pub enum Readiness {
    /// The expression evaluated to a boolean: ready now, or not.
    Boolean(bool),
    /// The expression evaluated to a string/number read as an RFC 3339
    /// timestamp: precise-time readiness.
    Timestamp(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time),
}

pub fn evaluate(expr: &Expr, root: &Value) -> Result<Readiness, ParseError> {
    let value = eval(expr, root)?;
    match value {
        Value::Bool(b) => Ok(Readiness::Boolean(b)),
        Value::String(s) => {
            let parsed = chrono::DateTime::parse_from_rfc3339(&s)
                .map_err(|e| ParseError(format!("not a boolean or timestamp: {e}")))?;
            Ok(Readiness::Timestamp(
                k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(parsed.to_utc()),
            ))
        }
        other => Err(ParseError(format!(
            "readiness expression must evaluate to bool or timestamp, got {other:?}"
        ))),
    }
}

fn eval(expr: &Expr, root: &Value) -> Result<Value, ParseError> {
    Ok(match expr {
        Expr::Bool(b) => Value::Bool(*b),
        Expr::Number(n) => serde_json::json!(n),
        Expr::String(s) => Value::String(s.clone()),
        Expr::Path(path) => lookup(root, path).cloned().unwrap_or(Value::Null),
        Expr::Has(path) => Value::Bool(lookup(root, path).is_some()),
        Expr::Not(inner) => Value::Bool(!truthy(&eval(inner, root)?)),
        Expr::And(a, b) => Value::Bool(truthy(&eval(a, root)?) && truthy(&eval(b, root)?)),
        Expr::Or(a, b) => Value::Bool(truthy(&eval(a, root)?) || truthy(&eval(b, root)?)),
        Expr::Cmp(a, op, b) => {
            let a = eval(a, root)?;
            let b = eval(b, root)?;
            Value::Bool(compare(&a, *op, &b))
        }
    })
}

fn lookup<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    // `self` is the conventional root binding; accept it and skip it.
    let mut cursor = root;
    let mut segments = path.iter();
    if path.first().map(String::as_str) == Some("self") {
        segments.next();
    }
    for segment in segments {
        cursor = cursor.get(segment)?;
    }
    Some(cursor)
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Null => false,
        _ => true,
    }
}

fn compare(a: &Value, op: CmpOp, b: &Value) -> bool {
    let ordering = match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().partial_cmp(&b.as_f64()),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Lt => ordering.is_some_and(|o| o.is_lt()),
        CmpOp::Le => ordering.is_some_and(|o| o.is_le()),
        CmpOp::Gt => ordering.is_some_and(|o| o.is_gt()),
        CmpOp::Ge => ordering.is_some_and(|o| o.is_ge()),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    String(String),
    True,
    False,
    Has,
    Dot,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
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
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(ParseError("unterminated string literal".into()));
                }
                i += 1;
                tokens.push(Token::String(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let s: String = chars[start..i].iter().collect();
                let n = s
                    .parse::<f64>()
                    .map_err(|e| ParseError(format!("invalid number {s}: {e}")))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let s: String = chars[start..i].iter().collect();
                tokens.push(match s.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "has" => Token::Has,
                    _ => Token::Ident(s),
                });
            }
            other => return Err(ParseError(format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.parse_primary()?;
        Ok(Expr::Cmp(Box::new(lhs), op, Box::new(rhs)))
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.advance() {
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::String(s)) => Ok(Expr::String(s)),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ParseError("expected ')'".into())),
                }
            }
            Some(Token::Has) => {
                match self.advance() {
                    Some(Token::LParen) => {}
                    _ => return Err(ParseError("expected '(' after has".into())),
                }
                let path = self.parse_path()?;
                match self.advance() {
                    Some(Token::RParen) => {}
                    _ => return Err(ParseError("expected ')' after has(...)".into())),
                }
                Ok(Expr::Has(path))
            }
            Some(Token::Ident(first)) => {
                let mut path = vec![first];
                while self.peek() == Some(&Token::Dot) {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(s)) => path.push(s),
                        _ => return Err(ParseError("expected identifier after '.'".into())),
                    }
                }
                Ok(Expr::Path(path))
            }
            other => Err(ParseError(format!("unexpected token {other:?}"))),
        }
    }

    fn parse_path(&mut self) -> Result<Vec<String>, ParseError> {
        let mut path = match self.advance() {
            Some(Token::Ident(s)) => vec![s],
            other => return Err(ParseError(format!("expected identifier, got {other:?}"))),
        };
        while self.peek() == Some(&Token::Dot) {
            self.advance();
            match self.advance() {
                Some(Token::Ident(s)) => path.push(s),
                _ => return Err(ParseError("expected identifier after '.'".into())),
            }
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equality_on_nested_path() {
        let expr = parse("self.status.readyReplicas == self.spec.replicas").unwrap();
        let root = json!({"spec": {"replicas": 3}, "status": {"readyReplicas": 3}});
        assert!(matches!(evaluate(&expr, &root).unwrap(), Readiness::Boolean(true)));
    }

    #[test]
    fn has_checks_presence() {
        let expr = parse("has(self.status.conditions)").unwrap();
        assert!(matches!(
            evaluate(&expr, &json!({"status": {"conditions": []}})).unwrap(),
            Readiness::Boolean(true)
        ));
        assert!(matches!(
            evaluate(&expr, &json!({"status": {}})).unwrap(),
            Readiness::Boolean(false)
        ));
    }

    #[test]
    fn logical_combinators() {
        let expr = parse("self.a == 1 && (self.b == 2 || self.c == 3)").unwrap();
        let root = json!({"a": 1, "b": 0, "c": 3});
        assert!(matches!(evaluate(&expr, &root).unwrap(), Readiness::Boolean(true)));
    }

    #[test]
    fn negation() {
        let expr = parse("!(self.a == 1)").unwrap();
        assert!(matches!(
            evaluate(&expr, &json!({"a": 2})).unwrap(),
            Readiness::Boolean(true)
        ));
    }

    #[test]
    fn timestamp_literal() {
        let expr = parse("self.status.readyAt").unwrap();
        let root = json!({"status": {"readyAt": "2024-01-01T00:00:00Z"}});
        assert!(matches!(evaluate(&expr, &root).unwrap(), Readiness::Timestamp(_)));
    }
}
