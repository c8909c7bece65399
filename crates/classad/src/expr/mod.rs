//! Sandboxed expression language shared by match expressions and collector constraints.
//!
//! Expressions are compiled once and evaluated against [`Scope`]s. A scope binds names to
//! values (typically [`Record`]s such as a job ad or an entry description) and optionally
//! falls back to a default record for unbound names, which is how collector constraints
//! refer to the attributes of the ad under test.
mod ast;
mod eval;
mod functions;
mod parser;

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

pub use ast::{BinaryOp, Expr, Function, Literal, UnaryOp};
pub use functions::{GLIDEIN_CPUS, entry_cpus};

use crate::ad::{ClassAd, Value, quote_string};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// A name that cannot be resolved is an error.
    Strict,
    /// A name that cannot be resolved is `undefined`, which propagates through most
    /// operators. Only `true` satisfies a constraint.
    ClassAd,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    #[error("Attribute `{0}` is not defined")]
    MissingAttribute(String),
    #[error("Type error: {0}")]
    TypeError(String),
    #[error("Division by zero")]
    DivisionByZero,
}

/// Anything that exposes named attributes to expressions.
pub trait Record {
    fn lookup(&self, name: &str) -> Option<EvalValue<'_>>;
}

impl Record for ClassAd {
    fn lookup(&self, name: &str) -> Option<EvalValue<'_>> {
        self.get(name).map(EvalValue::from_value)
    }
}

#[derive(Clone)]
pub enum EvalValue<'a> {
    Undefined,
    Bool(bool),
    Int(i64),
    Real(f64),
    Str(Cow<'a, str>),
    List(Vec<EvalValue<'a>>),
    Record(&'a dyn Record),
}

impl<'a> EvalValue<'a> {
    pub fn from_value(value: &'a Value) -> EvalValue<'a> {
        match value {
            Value::Bool(value) => EvalValue::Bool(*value),
            Value::Int(value) => EvalValue::Int(*value),
            Value::Real(value) => EvalValue::Real(*value),
            Value::Str(value) => EvalValue::Str(Cow::Borrowed(value)),
        }
    }

    pub fn str(value: &'a str) -> EvalValue<'a> {
        EvalValue::Str(Cow::Borrowed(value))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, EvalValue::Undefined)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            EvalValue::Int(value) => Some(*value),
            EvalValue::Real(value) => Some(*value as i64),
            EvalValue::Bool(value) => Some(*value as i64),
            _ => None,
        }
    }

    /// Converts a scalar result back to an attribute value.
    pub fn to_value(&self) -> Option<Value> {
        match self {
            EvalValue::Bool(value) => Some(Value::Bool(*value)),
            EvalValue::Int(value) => Some(Value::Int(*value)),
            EvalValue::Real(value) => Some(Value::Real(*value)),
            EvalValue::Str(value) => Some(Value::Str(value.to_string())),
            _ => None,
        }
    }

    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            EvalValue::Undefined => "undefined",
            EvalValue::Bool(_) => "bool",
            EvalValue::Int(_) => "int",
            EvalValue::Real(_) => "real",
            EvalValue::Str(_) => "string",
            EvalValue::List(_) => "list",
            EvalValue::Record(_) => "record",
        }
    }
}

impl Debug for EvalValue<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EvalValue::Undefined => f.write_str("Undefined"),
            EvalValue::Bool(value) => write!(f, "Bool({value})"),
            EvalValue::Int(value) => write!(f, "Int({value})"),
            EvalValue::Real(value) => write!(f, "Real({value:?})"),
            EvalValue::Str(value) => write!(f, "Str({value:?})"),
            EvalValue::List(items) => f.debug_list().entries(items).finish(),
            EvalValue::Record(_) => f.write_str("Record"),
        }
    }
}

/// Name bindings for one evaluation.
pub struct Scope<'a> {
    mode: EvalMode,
    bindings: Vec<(&'a str, EvalValue<'a>)>,
    fallback: Option<&'a dyn Record>,
}

impl<'a> Scope<'a> {
    pub fn strict() -> Self {
        Self {
            mode: EvalMode::Strict,
            bindings: Vec::new(),
            fallback: None,
        }
    }

    /// Scope for evaluating a constraint against one ad.
    pub fn classad(ad: &'a dyn Record) -> Self {
        Self {
            mode: EvalMode::ClassAd,
            bindings: Vec::new(),
            fallback: Some(ad),
        }
    }

    pub fn bind(mut self, name: &'a str, value: EvalValue<'a>) -> Self {
        self.bindings.push((name, value));
        self
    }

    pub fn bind_record(self, name: &'a str, record: &'a dyn Record) -> Self {
        self.bind(name, EvalValue::Record(record))
    }

    pub fn mode(&self) -> EvalMode {
        self.mode
    }

    fn resolve(&self, name: &str) -> Result<EvalValue<'a>, EvalError> {
        if let Some((_, value)) = self.bindings.iter().find(|(n, _)| *n == name) {
            return Ok(value.clone());
        }
        if let Some(value) = self.fallback.and_then(|record| record.lookup(name)) {
            return Ok(value);
        }
        self.missing(name)
    }

    fn missing(&self, name: &str) -> Result<EvalValue<'a>, EvalError> {
        match self.mode {
            EvalMode::Strict => Err(EvalError::MissingAttribute(name.to_string())),
            EvalMode::ClassAd => Ok(EvalValue::Undefined),
        }
    }
}

/// A compiled expression together with its source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> anyhow::Result<Expression> {
        let ast = parser::parse_expression(source)?;
        Ok(Expression {
            source: source.trim().to_string(),
            ast,
        })
    }

    pub fn always_true() -> Expression {
        Expression {
            source: "true".to_string(),
            ast: Expr::Literal(Literal::Bool(true)),
        }
    }

    pub fn always_false() -> Expression {
        Expression {
            source: "false".to_string(),
            ast: Expr::Literal(Literal::Bool(false)),
        }
    }

    /// Integer attribute equality test, e.g. `ClusterId == 12`.
    pub fn attr_equals_int(attr: &str, value: i64) -> Expression {
        let ast = Expr::Binary(
            BinaryOp::Eq,
            Box::new(Expr::Ident(attr.to_string())),
            Box::new(Expr::Literal(Literal::Int(value))),
        );
        Expression {
            source: format!("{attr} == {value}"),
            ast,
        }
    }

    /// Attribute equality test, e.g. `MyType == "glideclient"`.
    pub fn attr_equals(attr: &str, value: &str) -> Expression {
        let ast = Expr::Binary(
            BinaryOp::Eq,
            Box::new(Expr::Ident(attr.to_string())),
            Box::new(Expr::Literal(Literal::Str(value.to_string()))),
        );
        Expression {
            source: format!("{attr} == {}", quote_string(value)),
            ast,
        }
    }

    /// Conjunction of two expressions.
    pub fn and(&self, other: &Expression) -> Expression {
        let ast = Expr::Binary(
            BinaryOp::And,
            Box::new(self.ast.clone()),
            Box::new(other.ast.clone()),
        );
        Expression {
            source: format!("({}) && ({})", self.source, other.source),
            ast,
        }
    }

    /// Disjunction of two expressions.
    pub fn or(&self, other: &Expression) -> Expression {
        let ast = Expr::Binary(
            BinaryOp::Or,
            Box::new(self.ast.clone()),
            Box::new(other.ast.clone()),
        );
        Expression {
            source: format!("({}) || ({})", self.source, other.source),
            ast,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    pub fn identifiers(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.ast.collect_identifiers(&mut names);
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Attribute names the expression reads from the record bound to `root`.
    pub fn member_names(&self, root: &str) -> Vec<String> {
        let mut names = Vec::new();
        self.ast.collect_members(root, &mut names);
        names.sort_unstable();
        names.dedup();
        names
    }

    pub fn eval<'a>(&'a self, scope: &Scope<'a>) -> Result<EvalValue<'a>, EvalError> {
        eval::evaluate(&self.ast, scope)
    }

    /// Evaluates the expression as a predicate.
    ///
    /// In strict mode any truthy value is accepted. In ClassAd mode only `true` is;
    /// `undefined` and every other value count as false.
    pub fn eval_bool<'a>(&'a self, scope: &Scope<'a>) -> Result<bool, EvalError> {
        let value = self.eval(scope)?;
        Ok(match scope.mode() {
            EvalMode::ClassAd => matches!(value, EvalValue::Bool(true)),
            EvalMode::Strict => eval::truth(&value)?.unwrap_or(false),
        })
    }

    /// Checks a constraint against an ad. Evaluation errors count as a mismatch.
    pub fn matches(&self, ad: &ClassAd) -> bool {
        match self.eval_bool(&Scope::classad(ad)) {
            Ok(result) => result,
            Err(error) => {
                log::debug!(
                    "Constraint `{}` failed on ad {}: {error}",
                    self.source,
                    ad.name()
                );
                false
            }
        }
    }
}

impl Display for Expression {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for Expression {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Expression::parse(s)
    }
}

impl TryFrom<String> for Expression {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Expression::parse(&value)
    }
}

impl From<Expression> for String {
    fn from(value: Expression) -> Self {
        value.source
    }
}
