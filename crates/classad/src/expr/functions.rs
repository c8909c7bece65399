use std::borrow::Cow;

use crate::expr::ast::{Expr, Function};
use crate::expr::eval::{contains, evaluate, truth};
use crate::expr::{EvalError, EvalValue, Record, Scope};

/// Attribute of an entry description holding its cores per pilot.
pub const GLIDEIN_CPUS: &str = "GLIDEIN_CPUS";
const GLIDEIN_ESTIMATED_CPUS: &str = "GLIDEIN_ESTIMATED_CPUS";

fn type_error<T>(function: Function, value: &EvalValue) -> Result<T, EvalError> {
    Err(EvalError::TypeError(format!(
        "{}() does not accept a {}",
        function.name(),
        value.type_name()
    )))
}

pub(crate) fn call<'a>(
    function: Function,
    args: &'a [Expr],
    scope: &Scope<'a>,
) -> Result<EvalValue<'a>, EvalError> {
    match function {
        // Lazily evaluated helpers
        Function::Defined => {
            return match evaluate(&args[0], scope) {
                Ok(value) => Ok(EvalValue::Bool(!value.is_undefined())),
                Err(EvalError::MissingAttribute(_)) => Ok(EvalValue::Bool(false)),
                Err(error) => Err(error),
            };
        }
        Function::IfThenElse => {
            let cond = evaluate(&args[0], scope)?;
            return match truth(&cond)? {
                Some(true) => evaluate(&args[1], scope),
                Some(false) => evaluate(&args[2], scope),
                None => Ok(EvalValue::Undefined),
            };
        }
        _ => {}
    }

    let mut values = args
        .iter()
        .map(|arg| evaluate(arg, scope))
        .collect::<Result<Vec<_>, _>>()?;
    if function != Function::Member && values.iter().any(|v| v.is_undefined()) {
        return Ok(EvalValue::Undefined);
    }
    let first = values.remove(0);

    match function {
        Function::GlideinCpus => glidein_cpus(first),
        Function::Int => match first {
            EvalValue::Int(value) => Ok(EvalValue::Int(value)),
            EvalValue::Real(value) => Ok(EvalValue::Int(value as i64)),
            EvalValue::Bool(value) => Ok(EvalValue::Int(value as i64)),
            EvalValue::Str(ref value) => parse_number(value)
                .map(|n| EvalValue::Int(n as i64))
                .ok_or_else(|| EvalError::TypeError(format!("cannot convert `{value}` to int"))),
            value => type_error(function, &value),
        },
        Function::Real => match first {
            EvalValue::Int(value) => Ok(EvalValue::Real(value as f64)),
            EvalValue::Real(value) => Ok(EvalValue::Real(value)),
            EvalValue::Bool(value) => Ok(EvalValue::Real(value as i64 as f64)),
            EvalValue::Str(ref value) => parse_number(value)
                .map(EvalValue::Real)
                .ok_or_else(|| EvalError::TypeError(format!("cannot convert `{value}` to real"))),
            value => type_error(function, &value),
        },
        Function::Str => match first {
            EvalValue::Str(value) => Ok(EvalValue::Str(value)),
            EvalValue::Int(value) => Ok(EvalValue::Str(Cow::Owned(value.to_string()))),
            EvalValue::Real(value) => Ok(EvalValue::Str(Cow::Owned(value.to_string()))),
            EvalValue::Bool(value) => Ok(EvalValue::Str(Cow::Owned(value.to_string()))),
            value => type_error(function, &value),
        },
        Function::Len => match first {
            EvalValue::Str(value) => Ok(EvalValue::Int(value.chars().count() as i64)),
            EvalValue::List(items) => Ok(EvalValue::Int(items.len() as i64)),
            value => type_error(function, &value),
        },
        Function::Lower | Function::Upper | Function::Strip => match first {
            EvalValue::Str(value) => Ok(EvalValue::Str(Cow::Owned(match function {
                Function::Lower => value.to_lowercase(),
                Function::Upper => value.to_uppercase(),
                _ => value.trim().to_string(),
            }))),
            value => type_error(function, &value),
        },
        Function::Split => {
            let EvalValue::Str(text) = first else {
                return type_error(function, &first);
            };
            let items: Vec<EvalValue> = match values.first() {
                Some(EvalValue::Str(separator)) if !separator.is_empty() => text
                    .split(separator.as_ref())
                    .map(|item| EvalValue::Str(Cow::Owned(item.trim().to_string())))
                    .collect(),
                Some(value) => return type_error(function, value),
                None => text
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|item| !item.is_empty())
                    .map(|item| EvalValue::Str(Cow::Owned(item.to_string())))
                    .collect(),
            };
            Ok(EvalValue::List(items))
        }
        Function::Member => {
            let haystack = values.remove(0);
            Ok(match contains(&haystack, &first, scope.mode())? {
                Some(value) => EvalValue::Bool(value),
                None => EvalValue::Undefined,
            })
        }
        Function::Min | Function::Max => {
            let second = values.remove(0);
            let min = function == Function::Min;
            match (&first, &second) {
                (EvalValue::Int(a), EvalValue::Int(b)) => {
                    Ok(EvalValue::Int(if min { *a.min(b) } else { *a.max(b) }))
                }
                _ => match (numeric_arg(&first), numeric_arg(&second)) {
                    (Some(a), Some(b)) => Ok(EvalValue::Real(if min { a.min(b) } else { a.max(b) })),
                    (None, _) => type_error(function, &first),
                    _ => type_error(function, &second),
                },
            }
        }
        Function::Defined | Function::IfThenElse => unreachable!("evaluated lazily"),
    }
}

fn numeric_arg(value: &EvalValue) -> Option<f64> {
    match value {
        EvalValue::Int(value) => Some(*value as f64),
        EvalValue::Real(value) => Some(*value),
        _ => None,
    }
}

fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    text.parse::<i64>()
        .map(|value| value as f64)
        .ok()
        .or_else(|| text.parse::<f64>().ok())
}

/// Cores provided by one pilot of an entry.
///
/// Accepts either the entry description (with its attributes under `attrs`) or the
/// attribute record itself. Missing values and the symbolic `auto`/`slot`/`node`
/// settings fall back to the estimated count published by the factory, then to 1.
fn glidein_cpus(glidein: EvalValue) -> Result<EvalValue, EvalError> {
    let EvalValue::Record(record) = glidein else {
        return Err(EvalError::TypeError(format!(
            "glideinCpus() expects an entry, got a {}",
            glidein.type_name()
        )));
    };
    let attrs: &dyn Record = match record.lookup("attrs") {
        Some(EvalValue::Record(attrs)) => attrs,
        _ => record,
    };
    Ok(EvalValue::Int(entry_cpus(attrs)))
}

/// Cores per pilot of an entry given its attributes, at least 1.
pub fn entry_cpus(attrs: &dyn Record) -> i64 {
    cpus_of(attrs).max(1)
}

fn cpus_of(attrs: &dyn Record) -> i64 {
    let estimated = || {
        attrs
            .lookup(GLIDEIN_ESTIMATED_CPUS)
            .and_then(|value| value.as_int())
            .unwrap_or(1)
    };
    match attrs.lookup(GLIDEIN_CPUS) {
        Some(EvalValue::Int(value)) => value,
        Some(EvalValue::Real(value)) => value as i64,
        Some(EvalValue::Str(value)) => match value.trim().to_ascii_lowercase().as_str() {
            "auto" | "slot" | "node" => estimated(),
            other => parse_number(other).map(|v| v as i64).unwrap_or(1),
        },
        _ => estimated(),
    }
}
