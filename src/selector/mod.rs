//! Selector evaluation
//!
//! The broker treats selectors as opaque predicates. It validates the
//! expression once when a consumer subscribes (a failure there is surfaced as
//! `InvalidSelector`) and evaluates it against message properties at dispatch
//! time. `SimpleSelector` is the evaluator used unless an embedder provides
//! another one.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::broker::message::{Properties, PropertyValue};

pub trait SelectorEvaluator: Send + Sync + fmt::Debug {
    /// Check that `selector` is well formed. The error is a human readable reason.
    fn validate(&self, selector: &str) -> Result<(), String>;

    /// Evaluate a previously validated selector.
    fn evaluate(&self, selector: &str, properties: &Properties) -> bool;
}

/// Property comparisons joined by `AND` / `OR`.
///
/// Supports `name = 'text'`, `name <> 3`, `name >= 2.5`, `flag = TRUE`,
/// `name IS NULL` and `name IS NOT NULL`. `AND` binds tighter than `OR`.
/// A comparison against a missing property, or between mismatched types, is
/// false.
///
/// Parsed expressions are cached by their text, so each distinct selector is
/// parsed once no matter how many messages it is evaluated against.
#[derive(Debug, Default)]
pub struct SimpleSelector {
    parsed: Mutex<HashMap<String, Arc<Expression>>>,
}

impl SimpleSelector {
    fn compiled(&self, selector: &str) -> Result<Arc<Expression>, String> {
        let mut parsed = self.parsed.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(expression) = parsed.get(selector) {
            return Ok(Arc::clone(expression));
        }
        let expression = Arc::new(parse(selector)?);
        parsed.insert(selector.to_string(), Arc::clone(&expression));
        Ok(expression)
    }

    /// Number of distinct selectors parsed so far.
    pub fn cached(&self) -> usize {
        self.parsed.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl SelectorEvaluator for SimpleSelector {
    fn validate(&self, selector: &str) -> Result<(), String> {
        self.compiled(selector).map(|_| ())
    }

    fn evaluate(&self, selector: &str, properties: &Properties) -> bool {
        match self.compiled(selector) {
            Ok(expression) => expression.holds(properties),
            Err(reason) => {
                tracing::debug!("selector '{selector}' failed to parse at dispatch: {reason}");
                false
            }
        }
    }
}

/// A disjunction of conjunctions.
#[derive(Debug)]
struct Expression(Vec<Vec<Condition>>);

impl Expression {
    fn holds(&self, properties: &Properties) -> bool {
        self.0
            .iter()
            .any(|conjuncts| conjuncts.iter().all(|c| c.holds(properties)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Bool(bool),
    Op(CompareOp),
    And,
    Or,
    Is,
    Not,
    Null,
}

#[derive(Debug)]
enum Test {
    Compare(CompareOp, PropertyValue),
    IsNull,
    IsNotNull,
}

#[derive(Debug)]
struct Condition {
    property: String,
    test: Test,
}

impl Condition {
    fn holds(&self, properties: &Properties) -> bool {
        let value = properties.get(&self.property);
        match (&self.test, value) {
            (Test::IsNull, v) => v.is_none(),
            (Test::IsNotNull, v) => v.is_some(),
            (Test::Compare(_, _), None) => false,
            (Test::Compare(op, literal), Some(value)) => compare(*op, value, literal),
        }
    }
}

fn compare(op: CompareOp, value: &PropertyValue, literal: &PropertyValue) -> bool {
    use PropertyValue::{Bool, Double, Int, String};

    let numeric = |v: &PropertyValue| match v {
        Int(i) => Some(*i as f64),
        Double(d) => Some(*d),
        _ => None,
    };

    match (value, literal) {
        (String(a), String(b)) => match op {
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
            _ => false,
        },
        (Bool(a), Bool(b)) => match op {
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
            _ => false,
        },
        (a, b) => match (numeric(a), numeric(b)) {
            (Some(a), Some(b)) => match op {
                CompareOp::Eq => a == b,
                CompareOp::Ne => a != b,
                CompareOp::Lt => a < b,
                CompareOp::Le => a <= b,
                CompareOp::Gt => a > b,
                CompareOp::Ge => a >= b,
            },
            _ => false,
        },
    }
}

fn parse(selector: &str) -> Result<Expression, String> {
    let mut tokens = tokenize(selector)?.into_iter().peekable();
    if tokens.peek().is_none() {
        return Err("empty selector".to_string());
    }

    let mut disjuncts = Vec::new();
    let mut current = Vec::new();
    loop {
        current.push(parse_condition(&mut tokens)?);
        match tokens.next() {
            None => {
                disjuncts.push(current);
                return Ok(Expression(disjuncts));
            }
            Some(Token::And) => {}
            Some(Token::Or) => disjuncts.push(std::mem::take(&mut current)),
            Some(other) => return Err(format!("unexpected {other:?}")),
        }
    }
}

fn parse_condition<I>(tokens: &mut std::iter::Peekable<I>) -> Result<Condition, String>
where
    I: Iterator<Item = Token>,
{
    let property = match tokens.next() {
        Some(Token::Ident(name)) => name,
        Some(other) => return Err(format!("expected property name, found {other:?}")),
        None => return Err("unexpected end of input".to_string()),
    };

    let test = match tokens.next() {
        Some(Token::Op(op)) => {
            let literal = match tokens.next() {
                Some(Token::Str(s)) => PropertyValue::String(s),
                Some(Token::Num(n)) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => {
                    PropertyValue::Int(n as i64)
                }
                Some(Token::Num(n)) => PropertyValue::Double(n),
                Some(Token::Bool(b)) => PropertyValue::Bool(b),
                Some(other) => return Err(format!("expected literal, found {other:?}")),
                None => return Err("unexpected end of input".to_string()),
            };
            Test::Compare(op, literal)
        }
        Some(Token::Is) => match tokens.next() {
            Some(Token::Null) => Test::IsNull,
            Some(Token::Not) if tokens.next() == Some(Token::Null) => Test::IsNotNull,
            _ => return Err("expected NULL or NOT NULL after IS".to_string()),
        },
        Some(other) => return Err(format!("expected operator, found {other:?}")),
        None => return Err("unexpected end of input".to_string()),
    };

    Ok(Condition { property, test })
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '\'' => {
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".to_string()),
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            text.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            text.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            '=' => {
                tokens.push(Token::Op(CompareOp::Eq));
                i += 1;
            }
            '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let (op, width) = match (c, next) {
                    ('<', Some('>')) => (CompareOp::Ne, 2),
                    ('<', Some('=')) => (CompareOp::Le, 2),
                    ('>', Some('=')) => (CompareOp::Ge, 2),
                    ('<', _) => (CompareOp::Lt, 1),
                    _ => (CompareOp::Gt, 1),
                };
                tokens.push(Token::Op(op));
                i += width;
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{text}'"))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '$' | '.'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "IS" => Token::Is,
                    "NOT" => Token::Not,
                    "NULL" => Token::Null,
                    "TRUE" => Token::Bool(true),
                    "FALSE" => Token::Bool(false),
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }

    Ok(tokens)
}
