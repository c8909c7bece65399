use std::borrow::Cow;
use std::cmp::Ordering;

use crate::expr::ast::{BinaryOp, Expr, Literal, UnaryOp};
use crate::expr::functions::call;
use crate::expr::{EvalError, EvalMode, EvalValue, Scope};

pub(crate) fn evaluate<'a>(expr: &'a Expr, scope: &Scope<'a>) -> Result<EvalValue<'a>, EvalError> {
    match expr {
        Expr::Literal(literal) => Ok(match literal {
            Literal::Undefined => EvalValue::Undefined,
            Literal::Bool(value) => EvalValue::Bool(*value),
            Literal::Int(value) => EvalValue::Int(*value),
            Literal::Real(value) => EvalValue::Real(*value),
            Literal::Str(value) => EvalValue::Str(Cow::Borrowed(value)),
        }),
        Expr::Ident(name) => scope.resolve(name),
        Expr::List(items) => items
            .iter()
            .map(|item| evaluate(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(EvalValue::List),
        Expr::Index(base, index) => {
            let base = evaluate(base, scope)?;
            let index = evaluate(index, scope)?;
            subscript(base, &index, scope)
        }
        Expr::Attr(base, name) => {
            let base = evaluate(base, scope)?;
            member(base, name, scope)
        }
        Expr::Unary(op, value) => {
            let value = evaluate(value, scope)?;
            unary(*op, value)
        }
        Expr::Binary(BinaryOp::And, lhs, rhs) => logical(true, lhs, rhs, scope),
        Expr::Binary(BinaryOp::Or, lhs, rhs) => logical(false, lhs, rhs, scope),
        Expr::Binary(op, lhs, rhs) => {
            let lhs = evaluate(lhs, scope)?;
            let rhs = evaluate(rhs, scope)?;
            binary(*op, lhs, rhs, scope.mode())
        }
        Expr::Cond(cond, then, otherwise) => {
            let cond = evaluate(cond, scope)?;
            match truth(&cond)? {
                Some(true) => evaluate(then, scope),
                Some(false) => evaluate(otherwise, scope),
                None => Ok(EvalValue::Undefined),
            }
        }
        Expr::Call(function, args) => call(*function, args, scope),
    }
}

/// Truth value of a result; `None` stands for `undefined`.
pub(crate) fn truth(value: &EvalValue) -> Result<Option<bool>, EvalError> {
    Ok(match value {
        EvalValue::Undefined => None,
        EvalValue::Bool(value) => Some(*value),
        EvalValue::Int(value) => Some(*value != 0),
        EvalValue::Real(value) => Some(*value != 0.0),
        EvalValue::Str(value) => Some(!value.is_empty()),
        EvalValue::List(items) => Some(!items.is_empty()),
        EvalValue::Record(_) => {
            return Err(EvalError::TypeError(
                "a record cannot be used as a condition".to_string(),
            ));
        }
    })
}

fn member<'a>(
    base: EvalValue<'a>,
    name: &str,
    scope: &Scope<'a>,
) -> Result<EvalValue<'a>, EvalError> {
    match base {
        EvalValue::Record(record) => match record.lookup(name) {
            Some(value) => Ok(value),
            None => scope.missing(name),
        },
        EvalValue::Undefined => Ok(EvalValue::Undefined),
        value => Err(EvalError::TypeError(format!(
            "cannot read attribute `{name}` of a {}",
            value.type_name()
        ))),
    }
}

fn subscript<'a>(
    base: EvalValue<'a>,
    index: &EvalValue<'a>,
    scope: &Scope<'a>,
) -> Result<EvalValue<'a>, EvalError> {
    match (base, index) {
        (base @ (EvalValue::Record(_) | EvalValue::Undefined), EvalValue::Str(key)) => {
            member(base, key, scope)
        }
        (EvalValue::List(items), EvalValue::Int(position)) => {
            let position = if *position < 0 {
                items.len() as i64 + position
            } else {
                *position
            };
            match usize::try_from(position).ok().and_then(|p| items.get(p)) {
                Some(item) => Ok(item.clone()),
                None => match scope.mode() {
                    EvalMode::Strict => Err(EvalError::TypeError(format!(
                        "list index {position} out of range"
                    ))),
                    EvalMode::ClassAd => Ok(EvalValue::Undefined),
                },
            }
        }
        (EvalValue::Undefined, _) | (_, EvalValue::Undefined) => Ok(EvalValue::Undefined),
        (base, index) => Err(EvalError::TypeError(format!(
            "cannot index a {} with a {}",
            base.type_name(),
            index.type_name()
        ))),
    }
}

fn unary(op: UnaryOp, value: EvalValue) -> Result<EvalValue, EvalError> {
    match (op, value) {
        (_, EvalValue::Undefined) => Ok(EvalValue::Undefined),
        (UnaryOp::Neg, EvalValue::Int(value)) => value
            .checked_neg()
            .map(EvalValue::Int)
            .ok_or_else(|| EvalError::TypeError("integer overflow".to_string())),
        (UnaryOp::Neg, EvalValue::Real(value)) => Ok(EvalValue::Real(-value)),
        (UnaryOp::Neg, value) => Err(EvalError::TypeError(format!(
            "cannot negate a {}",
            value.type_name()
        ))),
        (UnaryOp::Not, value) => Ok(match truth(&value)? {
            Some(value) => EvalValue::Bool(!value),
            None => EvalValue::Undefined,
        }),
    }
}

/// Three-valued `&&` (`conjunction == true`) and `||`, short-circuiting where the
/// left operand alone decides the result.
fn logical<'a>(
    conjunction: bool,
    lhs: &'a Expr,
    rhs: &'a Expr,
    scope: &Scope<'a>,
) -> Result<EvalValue<'a>, EvalError> {
    let dominant = !conjunction;
    let lhs = truth(&evaluate(lhs, scope)?)?;
    if lhs == Some(dominant) {
        return Ok(EvalValue::Bool(dominant));
    }
    let rhs = truth(&evaluate(rhs, scope)?)?;
    Ok(match (lhs, rhs) {
        (_, Some(value)) if value == dominant => EvalValue::Bool(dominant),
        (Some(_), Some(value)) => EvalValue::Bool(value),
        _ => EvalValue::Undefined,
    })
}

fn numeric(value: &EvalValue) -> Option<f64> {
    match value {
        EvalValue::Int(value) => Some(*value as f64),
        EvalValue::Real(value) => Some(*value),
        EvalValue::Bool(value) => Some(*value as i64 as f64),
        _ => None,
    }
}

fn binary<'a>(
    op: BinaryOp,
    lhs: EvalValue<'a>,
    rhs: EvalValue<'a>,
    mode: EvalMode,
) -> Result<EvalValue<'a>, EvalError> {
    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            arithmetic(op, lhs, rhs)
        }
        BinaryOp::Is => Ok(EvalValue::Bool(identical(&lhs, &rhs))),
        BinaryOp::IsNot => Ok(EvalValue::Bool(!identical(&lhs, &rhs))),
        BinaryOp::In | BinaryOp::NotIn => {
            let contained = contains(&rhs, &lhs, mode)?;
            Ok(match contained {
                Some(value) => EvalValue::Bool(value == (op == BinaryOp::In)),
                None => EvalValue::Undefined,
            })
        }
        BinaryOp::Eq | BinaryOp::Ne => Ok(match equals(&lhs, &rhs, mode) {
            Some(value) => EvalValue::Bool(value == (op == BinaryOp::Eq)),
            None => EvalValue::Undefined,
        }),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            if lhs.is_undefined() || rhs.is_undefined() {
                return Ok(EvalValue::Undefined);
            }
            let ordering = order(&lhs, &rhs, mode)?;
            Ok(EvalValue::Bool(match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        BinaryOp::And | BinaryOp::Or => Err(EvalError::TypeError(
            "logical operators are evaluated lazily".to_string(),
        )),
    }
}

fn arithmetic<'a>(
    op: BinaryOp,
    lhs: EvalValue<'a>,
    rhs: EvalValue<'a>,
) -> Result<EvalValue<'a>, EvalError> {
    let overflow = || EvalError::TypeError("integer overflow".to_string());
    match (lhs, rhs) {
        (EvalValue::Undefined, _) | (_, EvalValue::Undefined) => Ok(EvalValue::Undefined),
        (EvalValue::Int(a), EvalValue::Int(b)) => {
            let result = match op {
                BinaryOp::Add => a.checked_add(b).ok_or_else(overflow)?,
                BinaryOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
                BinaryOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
                BinaryOp::Div if b == 0 => return Err(EvalError::DivisionByZero),
                BinaryOp::Div => a.checked_div(b).ok_or_else(overflow)?,
                BinaryOp::Mod if b == 0 => return Err(EvalError::DivisionByZero),
                _ => a.checked_rem(b).ok_or_else(overflow)?,
            };
            Ok(EvalValue::Int(result))
        }
        (EvalValue::Str(a), EvalValue::Str(b)) if op == BinaryOp::Add => {
            Ok(EvalValue::Str(Cow::Owned(format!("{a}{b}"))))
        }
        (lhs, rhs) => match (numeric(&lhs), numeric(&rhs)) {
            (Some(a), Some(b)) => {
                let result = match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div if b == 0.0 => return Err(EvalError::DivisionByZero),
                    BinaryOp::Div => a / b,
                    BinaryOp::Mod if b == 0.0 => return Err(EvalError::DivisionByZero),
                    _ => a % b,
                };
                Ok(EvalValue::Real(result))
            }
            _ => Err(EvalError::TypeError(format!(
                "unsupported operands for `{}`: {} and {}",
                op.symbol(),
                lhs.type_name(),
                rhs.type_name()
            ))),
        },
    }
}

/// `=?=`: same type and same value; strings compare case-sensitively.
fn identical(lhs: &EvalValue, rhs: &EvalValue) -> bool {
    match (lhs, rhs) {
        (EvalValue::Undefined, EvalValue::Undefined) => true,
        (EvalValue::Bool(a), EvalValue::Bool(b)) => a == b,
        (EvalValue::Int(a), EvalValue::Int(b)) => a == b,
        (EvalValue::Real(a), EvalValue::Real(b)) => a == b,
        (EvalValue::Str(a), EvalValue::Str(b)) => a == b,
        (EvalValue::List(a), EvalValue::List(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| identical(a, b))
        }
        _ => false,
    }
}

/// `==`; `None` when undefined. Strings ignore case in ClassAd mode.
pub(crate) fn equals(lhs: &EvalValue, rhs: &EvalValue, mode: EvalMode) -> Option<bool> {
    match (lhs, rhs) {
        (EvalValue::Undefined, _) | (_, EvalValue::Undefined) => None,
        (EvalValue::Str(a), EvalValue::Str(b)) => Some(match mode {
            EvalMode::Strict => a == b,
            EvalMode::ClassAd => a.eq_ignore_ascii_case(b),
        }),
        (EvalValue::Bool(a), EvalValue::Bool(b)) => Some(a == b),
        (EvalValue::List(a), EvalValue::List(b)) => Some(
            a.len() == b.len()
                && a.iter()
                    .zip(b)
                    .all(|(a, b)| equals(a, b, mode).unwrap_or(false)),
        ),
        (lhs, rhs) => match (numeric(lhs), numeric(rhs)) {
            (Some(a), Some(b)) => Some(a == b),
            _ => match mode {
                EvalMode::Strict => Some(false),
                EvalMode::ClassAd => None,
            },
        },
    }
}

fn order(lhs: &EvalValue, rhs: &EvalValue, mode: EvalMode) -> Result<Ordering, EvalError> {
    match (lhs, rhs) {
        (EvalValue::Str(a), EvalValue::Str(b)) => Ok(match mode {
            EvalMode::Strict => a.cmp(b),
            EvalMode::ClassAd => a.to_lowercase().cmp(&b.to_lowercase()),
        }),
        (lhs, rhs) => match (numeric(lhs), numeric(rhs)) {
            (Some(a), Some(b)) => a
                .partial_cmp(&b)
                .ok_or_else(|| EvalError::TypeError("cannot order NaN".to_string())),
            _ => Err(EvalError::TypeError(format!(
                "cannot compare a {} with a {}",
                lhs.type_name(),
                rhs.type_name()
            ))),
        },
    }
}

/// Membership test of `needle` in `haystack`; `None` when undefined.
pub(crate) fn contains(
    haystack: &EvalValue,
    needle: &EvalValue,
    mode: EvalMode,
) -> Result<Option<bool>, EvalError> {
    match (haystack, needle) {
        (EvalValue::Undefined, _) => Ok(None),
        (EvalValue::List(items), needle) => Ok(Some(
            items
                .iter()
                .any(|item| equals(item, needle, mode).unwrap_or(false)),
        )),
        (EvalValue::Str(haystack), EvalValue::Str(needle)) => {
            Ok(Some(haystack.contains(needle.as_ref())))
        }
        (EvalValue::Record(record), EvalValue::Str(name)) => Ok(Some(record.lookup(name).is_some())),
        (_, EvalValue::Undefined) => Ok(None),
        (haystack, needle) => Err(EvalError::TypeError(format!(
            "cannot search for a {} in a {}",
            needle.type_name(),
            haystack.type_name()
        ))),
    }
}
