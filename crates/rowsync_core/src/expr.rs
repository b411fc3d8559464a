//! Row predicates as data.
//!
//! A [`Condition`] is a small tagged tree evaluated against a row and an
//! optional identity. The same tree is used for permission rules and query
//! filters, on the client and on the server, so both sides agree on which
//! rows are visible and which writes are allowed.
//!
//! Evaluation follows SQL three-valued logic: a comparison involving null,
//! or an identity field that is absent, is *unknown*; `NOT unknown` stays
//! unknown; and a row passes only when the whole tree is *true*.

use crate::error::CoreResult;
use crate::identity::{Identity, IdentityField};
use crate::schema::TableSchema;
use crate::value::{Row, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `LIKE` with `%` and `_` wildcards.
    Like,
    /// Case-insensitive `LIKE`.
    ILike,
    /// `IS` (null-safe equality).
    Is,
    /// `IS NOT` (null-safe inequality).
    IsNot,
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    /// A literal value.
    Literal(Value),
    /// A field of the evaluating identity.
    Identity(IdentityField),
}

/// A boolean condition over one row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Always true.
    Always,
    /// Always false.
    Never,
    /// `column op operand`
    Compare {
        /// Column name.
        column: String,
        /// Operator.
        op: CompareOp,
        /// Right-hand side.
        operand: Operand,
    },
    /// `column IN (values)`
    In {
        /// Column name.
        column: String,
        /// Candidate values.
        values: Vec<Value>,
    },
    /// Conjunction.
    And(Vec<Condition>),
    /// Disjunction.
    Or(Vec<Condition>),
    /// Negation.
    Not(Box<Condition>),
}

/// Starts a comparison on `column`.
pub fn col(column: impl Into<String>) -> ColumnRef {
    ColumnRef(column.into())
}

/// Column handle returned by [`col`].
#[derive(Debug, Clone)]
pub struct ColumnRef(String);

impl ColumnRef {
    fn cmp(self, op: CompareOp, operand: Operand) -> Condition {
        Condition::Compare {
            column: self.0,
            op,
            operand,
        }
    }

    /// `column = value`
    pub fn eq(self, value: impl Into<Value>) -> Condition {
        self.cmp(CompareOp::Eq, Operand::Literal(value.into()))
    }

    /// `column != value`
    pub fn ne(self, value: impl Into<Value>) -> Condition {
        self.cmp(CompareOp::Ne, Operand::Literal(value.into()))
    }

    /// `column < value`
    pub fn lt(self, value: impl Into<Value>) -> Condition {
        self.cmp(CompareOp::Lt, Operand::Literal(value.into()))
    }

    /// `column <= value`
    pub fn le(self, value: impl Into<Value>) -> Condition {
        self.cmp(CompareOp::Le, Operand::Literal(value.into()))
    }

    /// `column > value`
    pub fn gt(self, value: impl Into<Value>) -> Condition {
        self.cmp(CompareOp::Gt, Operand::Literal(value.into()))
    }

    /// `column >= value`
    pub fn ge(self, value: impl Into<Value>) -> Condition {
        self.cmp(CompareOp::Ge, Operand::Literal(value.into()))
    }

    /// `column LIKE pattern`
    pub fn like(self, pattern: impl Into<String>) -> Condition {
        self.cmp(CompareOp::Like, Operand::Literal(Value::Text(pattern.into())))
    }

    /// `column ILIKE pattern`
    pub fn ilike(self, pattern: impl Into<String>) -> Condition {
        self.cmp(CompareOp::ILike, Operand::Literal(Value::Text(pattern.into())))
    }

    /// `column IS NULL`
    pub fn is_null(self) -> Condition {
        self.cmp(CompareOp::Is, Operand::Literal(Value::Null))
    }

    /// `column IS NOT NULL`
    pub fn is_not_null(self) -> Condition {
        self.cmp(CompareOp::IsNot, Operand::Literal(Value::Null))
    }

    /// `column = identity.<field>`
    pub fn eq_identity(self, field: IdentityField) -> Condition {
        self.cmp(CompareOp::Eq, Operand::Identity(field))
    }

    /// `column op identity.<field>`
    pub fn compare_identity(self, op: CompareOp, field: IdentityField) -> Condition {
        self.cmp(op, Operand::Identity(field))
    }

    /// `column IN (values)`
    pub fn in_list<I, V>(self, values: I) -> Condition
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Condition::In {
            column: self.0,
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

impl Condition {
    /// Conjunction of two conditions, folding constants.
    pub fn and(self, other: Condition) -> Condition {
        match (self, other) {
            (Condition::Always, c) | (c, Condition::Always) => c,
            (Condition::Never, _) | (_, Condition::Never) => Condition::Never,
            (Condition::And(mut a), Condition::And(b)) => {
                a.extend(b);
                Condition::And(a)
            }
            (Condition::And(mut a), c) => {
                a.push(c);
                Condition::And(a)
            }
            (a, b) => Condition::And(vec![a, b]),
        }
    }

    /// Disjunction of two conditions, folding constants.
    pub fn or(self, other: Condition) -> Condition {
        match (self, other) {
            (Condition::Never, c) | (c, Condition::Never) => c,
            (Condition::Always, _) | (_, Condition::Always) => Condition::Always,
            (Condition::Or(mut a), Condition::Or(b)) => {
                a.extend(b);
                Condition::Or(a)
            }
            (Condition::Or(mut a), c) => {
                a.push(c);
                Condition::Or(a)
            }
            (a, b) => Condition::Or(vec![a, b]),
        }
    }

    /// Negation.
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Condition {
        match self {
            Condition::Always => Condition::Never,
            Condition::Never => Condition::Always,
            Condition::Not(inner) => *inner,
            c => Condition::Not(Box::new(c)),
        }
    }

    /// Returns true if the row passes the condition.
    pub fn evaluate(&self, row: &Row, identity: Option<&Identity>) -> bool {
        self.eval(row, identity) == Some(true)
    }

    fn eval(&self, row: &Row, identity: Option<&Identity>) -> Option<bool> {
        match self {
            Condition::Always => Some(true),
            Condition::Never => Some(false),
            Condition::Compare {
                column,
                op,
                operand,
            } => {
                let rhs = match operand {
                    Operand::Literal(v) => v.clone(),
                    Operand::Identity(field) => {
                        Value::Text(identity?.field(*field)?.to_string())
                    }
                };
                compare(row.value(column), *op, &rhs)
            }
            Condition::In { column, values } => {
                let lhs = row.value(column);
                if lhs.is_null() {
                    return None;
                }
                let mut saw_null = false;
                for v in values {
                    match sql_cmp(lhs, v) {
                        Some(Ordering::Equal) => return Some(true),
                        None if v.is_null() => saw_null = true,
                        _ => {}
                    }
                }
                if saw_null {
                    None
                } else {
                    Some(false)
                }
            }
            Condition::And(parts) => {
                let mut result = Some(true);
                for part in parts {
                    match part.eval(row, identity) {
                        Some(false) => return Some(false),
                        None => result = None,
                        Some(true) => {}
                    }
                }
                result
            }
            Condition::Or(parts) => {
                let mut result = Some(false);
                for part in parts {
                    match part.eval(row, identity) {
                        Some(true) => return Some(true),
                        None => result = None,
                        Some(false) => {}
                    }
                }
                result
            }
            Condition::Not(inner) => inner.eval(row, identity).map(|b| !b),
        }
    }

    /// Collects every column referenced by the condition.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::Always | Condition::Never => {}
            Condition::Compare { column, .. } | Condition::In { column, .. } => {
                out.push(column);
            }
            Condition::And(parts) | Condition::Or(parts) => {
                for part in parts {
                    part.collect_columns(out);
                }
            }
            Condition::Not(inner) => inner.collect_columns(out),
        }
    }

    /// Checks every referenced column against the table declaration.
    pub fn validate(&self, table: &TableSchema) -> CoreResult<()> {
        for column in self.columns() {
            table.require_column(column)?;
        }
        Ok(())
    }

    /// Returns true if the condition reads an identity field.
    pub fn uses_identity(&self) -> bool {
        match self {
            Condition::Compare {
                operand: Operand::Identity(_),
                ..
            } => true,
            Condition::And(parts) | Condition::Or(parts) => {
                parts.iter().any(Condition::uses_identity)
            }
            Condition::Not(inner) => inner.uses_identity(),
            _ => false,
        }
    }
}

/// SQL comparison. `None` when either side is null or the types are not
/// comparable.
fn sql_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Integer(x), Value::Integer(y)) => Some(x.cmp(y)),
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
            a.as_float()?.partial_cmp(&b.as_float()?)
        }
        (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn compare(lhs: &Value, op: CompareOp, rhs: &Value) -> Option<bool> {
    match op {
        CompareOp::Is => Some(null_safe_eq(lhs, rhs)),
        CompareOp::IsNot => Some(!null_safe_eq(lhs, rhs)),
        CompareOp::Like | CompareOp::ILike => {
            let text = lhs.as_text();
            let pattern = rhs.as_text();
            match (text, pattern) {
                (Some(t), Some(p)) => Some(like_match(t, p, op == CompareOp::ILike)),
                _ if lhs.is_null() || rhs.is_null() => None,
                _ => Some(false),
            }
        }
        _ => {
            if lhs.is_null() || rhs.is_null() {
                return None;
            }
            let ord = match sql_cmp(lhs, rhs) {
                Some(ord) => ord,
                // Mismatched types are never equal and never ordered.
                None => return Some(op == CompareOp::Ne),
            };
            Some(match op {
                CompareOp::Eq => ord == Ordering::Equal,
                CompareOp::Ne => ord != Ordering::Equal,
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Le => ord != Ordering::Greater,
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::Ge => ord != Ordering::Less,
                _ => false,
            })
        }
    }
}

fn null_safe_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        _ => sql_cmp(a, b) == Some(Ordering::Equal),
    }
}

/// `LIKE` matching. `%` matches any run, `_` one character, and `\` escapes
/// the next pattern character.
pub fn like_match(text: &str, pattern: &str, case_insensitive: bool) -> bool {
    let fold = |s: &str| -> Vec<char> {
        if case_insensitive {
            s.chars().flat_map(char::to_lowercase).collect()
        } else {
            s.chars().collect()
        }
    };
    let text = fold(text);
    let pattern = parse_pattern(&fold(pattern));

    // Greedy matching with single-point backtracking on the last `%`.
    let (mut t, mut p) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some(Token::Any) => {
                star = Some((p, t));
                p += 1;
            }
            Some(Token::One) => {
                t += 1;
                p += 1;
            }
            Some(Token::Char(c)) if *c == text[t] => {
                t += 1;
                p += 1;
            }
            _ => match star {
                Some((sp, st)) => {
                    p = sp + 1;
                    t = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|tok| matches!(tok, Token::Any))
}

#[derive(Debug, PartialEq)]
enum Token {
    Any,
    One,
    Char(char),
}

fn parse_pattern(chars: &[char]) -> Vec<Token> {
    let mut out = Vec::with_capacity(chars.len());
    let mut iter = chars.iter();
    while let Some(&c) = iter.next() {
        out.push(match c {
            '%' => Token::Any,
            '_' => Token::One,
            '\\' => Token::Char(iter.next().copied().unwrap_or('\\')),
            c => Token::Char(c),
        });
    }
    out
}
