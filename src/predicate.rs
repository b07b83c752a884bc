//! The bounded predicate sublanguage for conditional edges and routers.
//!
//! Predicates are short boolean expressions over named memory-plane keys:
//! comparisons, null-checks, and boolean combinators. There is deliberately
//! no arbitrary code evaluation; the grammar below is the whole language.
//!
//! ```text
//! expr       := and_expr ( "or" and_expr )*
//! and_expr   := not_expr ( "and" not_expr )*
//! not_expr   := "not" not_expr | primary
//! primary    := "(" expr ")" | comparison
//! comparison := operand ( ("==" | "!=" | "<" | "<=" | ">" | ">=") operand
//!             | "is" "null" | "is" "not" "null" )?
//! operand    := identifier | string | number | "true" | "false" | "null"
//! ```
//!
//! A bare identifier is a truthiness test: absent keys and `null` are false,
//! booleans are themselves, zero and the empty string are false, everything
//! else is true. An absent key reads as `null` in comparisons, so
//! `feedback != null` holds exactly when `feedback` was written non-null.
//!
//! # Examples
//!
//! ```
//! use hivegraph::predicate::Predicate;
//! use rustc_hash::FxHashMap;
//! use serde_json::json;
//!
//! let p = Predicate::parse("score >= 0.8 and feedback is null").unwrap();
//!
//! let mut values = FxHashMap::default();
//! values.insert("score".to_string(), json!(0.9));
//! assert!(p.eval(&values).unwrap());
//!
//! values.insert("feedback".to_string(), json!("too short"));
//! assert!(!p.eval(&values).unwrap());
//! ```

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

/// A predicate rejected by the parser or the evaluator.
#[derive(Debug, Error, Diagnostic)]
pub enum PredicateError {
    #[error("unexpected character `{ch}` at byte {at}")]
    #[diagnostic(code(hivegraph::predicate::lex))]
    UnexpectedChar { ch: char, at: usize },

    #[error("unterminated string literal starting at byte {at}")]
    #[diagnostic(code(hivegraph::predicate::string))]
    UnterminatedString { at: usize },

    #[error("unexpected token `{found}`")]
    #[diagnostic(code(hivegraph::predicate::parse))]
    UnexpectedToken { found: String },

    #[error("predicate ended unexpectedly")]
    #[diagnostic(code(hivegraph::predicate::eof))]
    UnexpectedEnd,

    #[error("trailing input after expression: `{rest}`")]
    #[diagnostic(code(hivegraph::predicate::trailing))]
    TrailingInput { rest: String },

    #[error("cannot order {lhs} against {rhs}")]
    #[diagnostic(
        code(hivegraph::predicate::type_mismatch),
        help("ordering comparisons require two numbers or two strings")
    )]
    TypeMismatch { lhs: String, rhs: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Debug, PartialEq)]
enum Operand {
    Key(String),
    Literal(Value),
}

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Truthy(Operand),
    Compare {
        op: CompareOp,
        lhs: Operand,
        rhs: Operand,
    },
    IsNull {
        operand: Operand,
        negated: bool,
    },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

/// A parsed predicate, ready to evaluate against a keyed value map.
#[derive(Clone, Debug, PartialEq)]
pub struct Predicate {
    source: String,
    expr: Expr,
}

impl Predicate {
    /// Parse a predicate from its source text.
    pub fn parse(source: &str) -> Result<Self, PredicateError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if parser.pos < parser.tokens.len() {
            return Err(PredicateError::TrailingInput {
                rest: parser.tokens[parser.pos..]
                    .iter()
                    .map(Token::display)
                    .collect::<Vec<_>>()
                    .join(" "),
            });
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// The original source text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Every key name the predicate reads, in first-appearance order.
    #[must_use]
    pub fn references(&self) -> Vec<String> {
        let mut keys = Vec::new();
        collect_refs(&self.expr, &mut keys);
        keys
    }

    /// Evaluate against a keyed value map. Absent keys read as `null`.
    pub fn eval(&self, values: &FxHashMap<String, Value>) -> Result<bool, PredicateError> {
        eval_expr(&self.expr, values)
    }
}

fn collect_refs(expr: &Expr, out: &mut Vec<String>) {
    let mut push = |operand: &Operand| {
        if let Operand::Key(k) = operand {
            if !out.contains(k) {
                out.push(k.clone());
            }
        }
    };
    match expr {
        Expr::Truthy(operand) | Expr::IsNull { operand, .. } => push(operand),
        Expr::Compare { lhs, rhs, .. } => {
            push(lhs);
            push(rhs);
        }
        Expr::Not(inner) => collect_refs(inner, out),
        Expr::And(a, b) | Expr::Or(a, b) => {
            collect_refs(a, out);
            collect_refs(b, out);
        }
    }
}

fn resolve<'v>(operand: &'v Operand, values: &'v FxHashMap<String, Value>) -> &'v Value {
    match operand {
        Operand::Key(k) => values.get(k).unwrap_or(&Value::Null),
        Operand::Literal(v) => v,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn eval_expr(expr: &Expr, values: &FxHashMap<String, Value>) -> Result<bool, PredicateError> {
    match expr {
        Expr::Truthy(operand) => Ok(truthy(resolve(operand, values))),
        Expr::IsNull { operand, negated } => {
            let is_null = resolve(operand, values).is_null();
            Ok(is_null != *negated)
        }
        Expr::Compare { op, lhs, rhs } => {
            let (l, r) = (resolve(lhs, values), resolve(rhs, values));
            match op {
                CompareOp::Eq => Ok(values_equal(l, r)),
                CompareOp::Ne => Ok(!values_equal(l, r)),
                _ => {
                    let ordering = order(l, r)?;
                    Ok(match op {
                        CompareOp::Lt => ordering.is_lt(),
                        CompareOp::Le => ordering.is_le(),
                        CompareOp::Gt => ordering.is_gt(),
                        CompareOp::Ge => ordering.is_ge(),
                        CompareOp::Eq | CompareOp::Ne => unreachable!(),
                    })
                }
            }
        }
        Expr::Not(inner) => Ok(!eval_expr(inner, values)?),
        Expr::And(a, b) => Ok(eval_expr(a, values)? && eval_expr(b, values)?),
        Expr::Or(a, b) => Ok(eval_expr(a, values)? || eval_expr(b, values)?),
    }
}

/// Equality with numeric widening, so `1 == 1.0` holds.
fn values_equal(l: &Value, r: &Value) -> bool {
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => l == r,
    }
}

fn order(l: &Value, r: &Value) -> Result<std::cmp::Ordering, PredicateError> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b).ok_or(PredicateError::TypeMismatch {
                lhs: "NaN".to_string(),
                rhs: "a number".to_string(),
            })
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(PredicateError::TypeMismatch {
            lhs: type_name(l).to_string(),
            rhs: type_name(r).to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Lexer & parser
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(f64),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Is,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
}

impl Token {
    fn display(&self) -> String {
        match self {
            Token::Ident(s) => s.clone(),
            Token::Str(s) => format!("'{s}'"),
            Token::Number(n) => n.to_string(),
            Token::True => "true".to_string(),
            Token::False => "false".to_string(),
            Token::Null => "null".to_string(),
            Token::And => "and".to_string(),
            Token::Or => "or".to_string(),
            Token::Not => "not".to_string(),
            Token::Is => "is".to_string(),
            Token::Eq => "==".to_string(),
            Token::Ne => "!=".to_string(),
            Token::Lt => "<".to_string(),
            Token::Le => "<=".to_string(),
            Token::Gt => ">".to_string(),
            Token::Ge => ">=".to_string(),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, PredicateError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
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
            '=' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let start = i;
                i += 1;
                let from = i;
                while i < bytes.len() && bytes[i] as char != quote {
                    i += 1;
                }
                if i >= bytes.len() {
                    return Err(PredicateError::UnterminatedString { at: start });
                }
                tokens.push(Token::Str(source[from..i].to_string()));
                i += 1;
            }
            '0'..='9' | '-' => {
                let from = i;
                i += 1;
                while i < bytes.len() && matches!(bytes[i] as char, '0'..='9' | '.') {
                    i += 1;
                }
                let text = &source[from..i];
                let n = text
                    .parse::<f64>()
                    .map_err(|_| PredicateError::UnexpectedChar { ch: c, at: from })?;
                tokens.push(Token::Number(n));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let from = i;
                while i < bytes.len()
                    && matches!(bytes[i] as char, 'a'..='z' | 'A'..='Z' | '0'..='9' | '_')
                {
                    i += 1;
                }
                let word = &source[from..i];
                tokens.push(match word {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "is" => Token::Is,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word.to_string()),
                });
            }
            _ => return Err(PredicateError::UnexpectedChar { ch: c, at: i }),
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

    fn next(&mut self) -> Result<Token, PredicateError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(PredicateError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<(), PredicateError> {
        let found = self.next()?;
        if &found == token {
            Ok(())
        } else {
            Err(PredicateError::UnexpectedToken {
                found: found.display(),
            })
        }
    }

    fn expr(&mut self) -> Result<Expr, PredicateError> {
        let mut lhs = self.and_expr()?;
        while self.eat(&Token::Or) {
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, PredicateError> {
        let mut lhs = self.not_expr()?;
        while self.eat(&Token::And) {
            let rhs = self.not_expr()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<Expr, PredicateError> {
        if self.eat(&Token::Not) {
            Ok(Expr::Not(Box::new(self.not_expr()?)))
        } else {
            self.primary()
        }
    }

    fn primary(&mut self) -> Result<Expr, PredicateError> {
        if self.eat(&Token::LParen) {
            let inner = self.expr()?;
            self.expect(&Token::RParen)?;
            return Ok(inner);
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, PredicateError> {
        let lhs = self.operand()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some(CompareOp::Eq),
            Some(Token::Ne) => Some(CompareOp::Ne),
            Some(Token::Lt) => Some(CompareOp::Lt),
            Some(Token::Le) => Some(CompareOp::Le),
            Some(Token::Gt) => Some(CompareOp::Gt),
            Some(Token::Ge) => Some(CompareOp::Ge),
            Some(Token::Is) => {
                self.pos += 1;
                let negated = self.eat(&Token::Not);
                self.expect(&Token::Null)?;
                return Ok(Expr::IsNull {
                    operand: lhs,
                    negated,
                });
            }
            _ => None,
        };
        match op {
            Some(op) => {
                self.pos += 1;
                let rhs = self.operand()?;
                Ok(Expr::Compare { op, lhs, rhs })
            }
            None => Ok(Expr::Truthy(lhs)),
        }
    }

    fn operand(&mut self) -> Result<Operand, PredicateError> {
        match self.next()? {
            Token::Ident(name) => Ok(Operand::Key(name)),
            Token::Str(s) => Ok(Operand::Literal(Value::String(s))),
            Token::Number(n) => Ok(Operand::Literal(
                serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number),
            )),
            Token::True => Ok(Operand::Literal(Value::Bool(true))),
            Token::False => Ok(Operand::Literal(Value::Bool(false))),
            Token::Null => Ok(Operand::Literal(Value::Null)),
            other => Err(PredicateError::UnexpectedToken {
                found: other.display(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(pairs: &[(&str, Value)]) -> FxHashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn bare_key_is_truthiness() {
        let p = Predicate::parse("done").unwrap();
        assert!(!p.eval(&values(&[])).unwrap());
        assert!(!p.eval(&values(&[("done", json!(null))])).unwrap());
        assert!(!p.eval(&values(&[("done", json!(false))])).unwrap());
        assert!(p.eval(&values(&[("done", json!(true))])).unwrap());

        let n = Predicate::parse("not done").unwrap();
        assert!(n.eval(&values(&[])).unwrap());
    }

    #[test]
    fn absent_key_reads_as_null() {
        let p = Predicate::parse("feedback != null").unwrap();
        assert!(!p.eval(&values(&[])).unwrap());
        assert!(!p.eval(&values(&[("feedback", json!(null))])).unwrap());
        assert!(p.eval(&values(&[("feedback", json!("redo"))])).unwrap());
    }

    #[test]
    fn null_checks() {
        let p = Predicate::parse("feedback is null").unwrap();
        assert!(p.eval(&values(&[])).unwrap());
        let q = Predicate::parse("feedback is not null").unwrap();
        assert!(q.eval(&values(&[("feedback", json!("x"))])).unwrap());
    }

    #[test]
    fn comparisons_and_combinators() {
        let p = Predicate::parse("score >= 0.8 and (status == 'ok' or retries < 3)").unwrap();
        assert!(
            p.eval(&values(&[
                ("score", json!(0.9)),
                ("status", json!("bad")),
                ("retries", json!(1)),
            ]))
            .unwrap()
        );
        assert!(
            !p.eval(&values(&[
                ("score", json!(0.5)),
                ("status", json!("ok")),
                ("retries", json!(0)),
            ]))
            .unwrap()
        );
    }

    #[test]
    fn numeric_widening() {
        let p = Predicate::parse("count == 3").unwrap();
        assert!(p.eval(&values(&[("count", json!(3))])).unwrap());
        assert!(p.eval(&values(&[("count", json!(3.0))])).unwrap());
    }

    #[test]
    fn ordering_type_mismatch_is_an_error() {
        let p = Predicate::parse("status > 3").unwrap();
        let err = p.eval(&values(&[("status", json!("ok"))])).unwrap_err();
        assert!(matches!(err, PredicateError::TypeMismatch { .. }));
    }

    #[test]
    fn references_in_order() {
        let p = Predicate::parse("a == 1 or b is null and not c").unwrap();
        assert_eq!(p.references(), vec!["a", "b", "c"]);
    }

    #[test]
    fn parse_failures() {
        assert!(Predicate::parse("").is_err());
        assert!(Predicate::parse("a ==").is_err());
        assert!(Predicate::parse("a == 1 extra").is_err());
        assert!(Predicate::parse("'unterminated").is_err());
        assert!(Predicate::parse("a ? b").is_err());
    }
}
