//! Host evaluation of expression trees.
//!
//! This is the authoritative semantics: the host-only path, the CPU recheck
//! path and the emulated device all run it. NULL handling follows SQL:
//! operators on NULL yield NULL, `AND`/`OR` use three-valued logic, and a
//! qual list accepts a row only when every qual is true.

use std::cmp::Ordering;

use crate::error::EvalError;
use crate::transpiler::{ArithOp, CompareOp, Expr, ScalarFunc};
use crate::types::{DataType, Datum};

/// Evaluate `expr` against one input row.
pub fn eval(expr: &Expr, row: &[Datum], params: &[Datum]) -> Result<Datum, EvalError> {
    match expr {
        Expr::Column { index, .. } => row.get(*index).cloned().ok_or(EvalError::BadColumn(*index)),
        Expr::Literal { value, .. } => Ok(value.clone()),
        Expr::Param { id, .. } => params.get(*id).cloned().ok_or(EvalError::UnboundParam(*id)),
        Expr::Arith { op, left, right } => {
            let l = eval(left, row, params)?;
            let r = eval(right, row, params)?;
            arith(*op, &l, &r, expr.data_type())
        }
        Expr::Compare { op, left, right } => {
            let l = eval(left, row, params)?;
            let r = eval(right, row, params)?;
            Ok(match compare(&l, &r)? {
                None => Datum::Null,
                Some(ord) => Datum::Bool(compare_holds(*op, ord)),
            })
        }
        Expr::And(args) => {
            let mut saw_null = false;
            for arg in args {
                match eval(arg, row, params)? {
                    Datum::Bool(false) => return Ok(Datum::Bool(false)),
                    Datum::Null => saw_null = true,
                    Datum::Bool(true) => {}
                    other => return Err(not_boolean(&other)),
                }
            }
            Ok(if saw_null { Datum::Null } else { Datum::Bool(true) })
        }
        Expr::Or(args) => {
            let mut saw_null = false;
            for arg in args {
                match eval(arg, row, params)? {
                    Datum::Bool(true) => return Ok(Datum::Bool(true)),
                    Datum::Null => saw_null = true,
                    Datum::Bool(false) => {}
                    other => return Err(not_boolean(&other)),
                }
            }
            Ok(if saw_null { Datum::Null } else { Datum::Bool(false) })
        }
        Expr::Not(arg) => match eval(arg, row, params)? {
            Datum::Bool(b) => Ok(Datum::Bool(!b)),
            Datum::Null => Ok(Datum::Null),
            other => Err(not_boolean(&other)),
        },
        Expr::IsNull { arg, negated } => {
            let isnull = eval(arg, row, params)?.is_null();
            Ok(Datum::Bool(isnull != *negated))
        }
        Expr::Cast { arg, to } => cast(eval(arg, row, params)?, *to),
        Expr::Func { func, args } => {
            let values = args
                .iter()
                .map(|a| eval(a, row, params))
                .collect::<Result<Vec<_>, _>>()?;
            call(*func, values)
        }
    }
}

/// True when every qual evaluates to true. NULL rejects the row.
pub fn eval_quals(quals: &[Expr], row: &[Datum], params: &[Datum]) -> Result<bool, EvalError> {
    for qual in quals {
        match eval(qual, row, params)? {
            Datum::Bool(true) => {}
            Datum::Bool(false) | Datum::Null => return Ok(false),
            other => return Err(not_boolean(&other)),
        }
    }
    Ok(true)
}

fn not_boolean(d: &Datum) -> EvalError {
    EvalError::TypeMismatch(format!("expected boolean, got {d}"))
}

fn compare_holds(op: CompareOp, ord: Ordering) -> bool {
    match op {
        CompareOp::Eq => ord == Ordering::Equal,
        CompareOp::NotEq => ord != Ordering::Equal,
        CompareOp::Lt => ord == Ordering::Less,
        CompareOp::LtEq => ord != Ordering::Greater,
        CompareOp::Gt => ord == Ordering::Greater,
        CompareOp::GtEq => ord != Ordering::Less,
    }
}

fn as_i64(d: &Datum) -> Option<i64> {
    match d {
        Datum::Int16(v) => Some(*v as i64),
        Datum::Int32(v) => Some(*v as i64),
        Datum::Int64(v) => Some(*v),
        _ => None,
    }
}

fn as_f64(d: &Datum) -> Option<f64> {
    match d {
        Datum::Float32(v) => Some(*v as f64),
        Datum::Float64(v) => Some(*v),
        other => as_i64(other).map(|v| v as f64),
    }
}

fn type_label(t: DataType) -> &'static str {
    match t {
        DataType::Int16 => "smallint",
        DataType::Int32 => "integer",
        DataType::Int64 => "bigint",
        DataType::Float32 => "real",
        _ => "double precision",
    }
}

/// Narrow an integer result to `t`, or report overflow.
fn int_datum(v: i64, t: DataType) -> Result<Datum, EvalError> {
    let overflow = || EvalError::Overflow(type_label(t));
    Ok(match t {
        DataType::Int16 => Datum::Int16(i16::try_from(v).map_err(|_| overflow())?),
        DataType::Int32 => Datum::Int32(i32::try_from(v).map_err(|_| overflow())?),
        DataType::Int64 => Datum::Int64(v),
        DataType::Float32 => Datum::Float32(v as f32),
        DataType::Float64 => Datum::Float64(v as f64),
        other => return Err(EvalError::TypeMismatch(format!("{other} is not numeric"))),
    })
}

fn arith(op: ArithOp, l: &Datum, r: &Datum, result: DataType) -> Result<Datum, EvalError> {
    if l.is_null() || r.is_null() {
        return Ok(Datum::Null);
    }
    let mismatch = || EvalError::TypeMismatch(format!("{l} {} {r}", op.symbol()));
    match result {
        DataType::Int16 | DataType::Int32 | DataType::Int64 => {
            let (a, b) = (as_i64(l).ok_or_else(mismatch)?, as_i64(r).ok_or_else(mismatch)?);
            if matches!(op, ArithOp::Div | ArithOp::Mod) && b == 0 {
                return Err(EvalError::DivisionByZero);
            }
            let v = match op {
                ArithOp::Add => a.checked_add(b),
                ArithOp::Sub => a.checked_sub(b),
                ArithOp::Mul => a.checked_mul(b),
                ArithOp::Div => a.checked_div(b),
                ArithOp::Mod => a.checked_rem(b),
            }
            .ok_or(EvalError::Overflow(type_label(result)))?;
            int_datum(v, result)
        }
        DataType::Float32 | DataType::Float64 => {
            let (a, b) = (as_f64(l).ok_or_else(mismatch)?, as_f64(r).ok_or_else(mismatch)?);
            if matches!(op, ArithOp::Div | ArithOp::Mod) && b == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            let v = match op {
                ArithOp::Add => a + b,
                ArithOp::Sub => a - b,
                ArithOp::Mul => a * b,
                ArithOp::Div => a / b,
                ArithOp::Mod => a % b,
            };
            Ok(if result == DataType::Float32 {
                Datum::Float32(v as f32)
            } else {
                Datum::Float64(v)
            })
        }
        _ => Err(mismatch()),
    }
}

/// Ordering of two values, `None` when either is NULL.
pub(crate) fn compare(l: &Datum, r: &Datum) -> Result<Option<Ordering>, EvalError> {
    if l.is_null() || r.is_null() {
        return Ok(None);
    }
    let ord = match (l, r) {
        (Datum::Bool(a), Datum::Bool(b)) => a.cmp(b),
        (Datum::Date(a), Datum::Date(b)) => a.cmp(b),
        (Datum::Text(a), Datum::Text(b)) | (Datum::Json(a), Datum::Json(b)) => {
            a.as_bytes().cmp(b.as_bytes())
        }
        _ => match (as_i64(l), as_i64(r)) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => match (as_f64(l), as_f64(r)) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                _ => {
                    return Err(EvalError::TypeMismatch(format!(
                        "cannot compare {l} with {r}"
                    )))
                }
            },
        },
    };
    Ok(Some(ord))
}

fn cast(v: Datum, to: DataType) -> Result<Datum, EvalError> {
    if v.is_null() || v.data_type() == Some(to) {
        return Ok(v);
    }
    match to {
        DataType::Int16 | DataType::Int32 | DataType::Int64 => {
            if let Some(i) = as_i64(&v) {
                return int_datum(i, to);
            }
            if let Some(f) = as_f64(&v) {
                let rounded = f.round();
                if !rounded.is_finite() || rounded < i64::MIN as f64 || rounded > i64::MAX as f64 {
                    return Err(EvalError::Overflow(type_label(to)));
                }
                return int_datum(rounded as i64, to);
            }
        }
        DataType::Float32 => {
            if let Some(f) = as_f64(&v) {
                return Ok(Datum::Float32(f as f32));
            }
        }
        DataType::Float64 => {
            if let Some(f) = as_f64(&v) {
                return Ok(Datum::Float64(f));
            }
        }
        DataType::Text => {
            return Ok(Datum::Text(match v {
                Datum::Text(s) | Datum::Json(s) => s,
                other => other.to_string(),
            }))
        }
        DataType::Json => {
            if let Datum::Text(s) = v {
                return Ok(Datum::Json(s));
            }
        }
        DataType::Bool | DataType::Date => {}
    }
    Err(EvalError::TypeMismatch(format!("cannot cast {v} to {to}")))
}

fn text_arg(v: &Datum) -> Result<&str, EvalError> {
    match v {
        Datum::Text(s) | Datum::Json(s) => Ok(s),
        other => Err(EvalError::TypeMismatch(format!("expected text, got {other}"))),
    }
}

fn call(func: ScalarFunc, args: Vec<Datum>) -> Result<Datum, EvalError> {
    if args.iter().any(Datum::is_null) {
        return Ok(Datum::Null);
    }
    let arity = |n: usize| {
        if args.len() == n {
            Ok(())
        } else {
            Err(EvalError::TypeMismatch(format!(
                "{} takes {n} argument(s), got {}",
                func.name(),
                args.len()
            )))
        }
    };
    match func {
        ScalarFunc::Abs => {
            arity(1)?;
            match &args[0] {
                Datum::Int16(v) => v.checked_abs().map(Datum::Int16).ok_or(EvalError::Overflow("smallint")),
                Datum::Int32(v) => v.checked_abs().map(Datum::Int32).ok_or(EvalError::Overflow("integer")),
                Datum::Int64(v) => v.checked_abs().map(Datum::Int64).ok_or(EvalError::Overflow("bigint")),
                Datum::Float32(v) => Ok(Datum::Float32(v.abs())),
                Datum::Float64(v) => Ok(Datum::Float64(v.abs())),
                other => Err(EvalError::TypeMismatch(format!("abs({other})"))),
            }
        }
        ScalarFunc::Length => {
            arity(1)?;
            let s = text_arg(&args[0])?;
            i32::try_from(s.len())
                .map(Datum::Int32)
                .map_err(|_| EvalError::Overflow("integer"))
        }
        // ASCII-only case mapping keeps byte lengths stable across device and host.
        ScalarFunc::Upper => {
            arity(1)?;
            Ok(Datum::Text(text_arg(&args[0])?.to_ascii_uppercase()))
        }
        ScalarFunc::Lower => {
            arity(1)?;
            Ok(Datum::Text(text_arg(&args[0])?.to_ascii_lowercase()))
        }
        ScalarFunc::Concat => {
            let mut out = String::new();
            for arg in &args {
                out.push_str(text_arg(arg)?);
            }
            Ok(Datum::Text(out))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(i: usize, t: DataType) -> Expr {
        Expr::col(i, t)
    }

    #[test]
    fn three_valued_and_or() {
        let row = vec![Datum::Null, Datum::Bool(false), Datum::Bool(true)];
        let n = c(0, DataType::Bool);
        let f = c(1, DataType::Bool);
        let t = c(2, DataType::Bool);
        let and = |a: &Expr, b: &Expr| eval(&Expr::and(vec![a.clone(), b.clone()]), &row, &[]).unwrap();
        let or = |a: &Expr, b: &Expr| eval(&Expr::or(vec![a.clone(), b.clone()]), &row, &[]).unwrap();
        assert_eq!(and(&n, &f), Datum::Bool(false));
        assert_eq!(and(&n, &t), Datum::Null);
        assert_eq!(or(&n, &t), Datum::Bool(true));
        assert_eq!(or(&n, &f), Datum::Null);
    }

    #[test]
    fn null_qual_rejects_row() {
        let q = Expr::compare(CompareOp::Gt, c(0, DataType::Int32), Expr::lit(Datum::Int32(1)));
        assert!(!eval_quals(&[q], &[Datum::Null], &[]).unwrap());
    }

    #[test]
    fn integer_overflow_and_division_by_zero() {
        let row = vec![Datum::Int32(i32::MAX), Datum::Int32(0)];
        let add = Expr::arith(ArithOp::Add, c(0, DataType::Int32), Expr::lit(Datum::Int32(1)));
        assert_eq!(eval(&add, &row, &[]), Err(EvalError::Overflow("integer")));
        let div = Expr::arith(ArithOp::Div, c(0, DataType::Int32), c(1, DataType::Int32));
        assert_eq!(eval(&div, &row, &[]), Err(EvalError::DivisionByZero));
    }

    #[test]
    fn mixed_numeric_comparison() {
        let q = Expr::compare(CompareOp::LtEq, c(0, DataType::Int16), Expr::lit(Datum::Float64(2.5)));
        assert_eq!(eval(&q, &[Datum::Int16(2)], &[]).unwrap(), Datum::Bool(true));
    }

    #[test]
    fn concat_and_case_mapping() {
        let row = vec![Datum::Text("ab".into()), Datum::Text("Cd".into())];
        let e = Expr::func(
            ScalarFunc::Concat,
            vec![c(0, DataType::Text), c(1, DataType::Text)],
        );
        assert_eq!(eval(&e, &row, &[]).unwrap(), Datum::Text("abCd".into()));
        let u = Expr::func(ScalarFunc::Upper, vec![c(1, DataType::Text)]);
        assert_eq!(eval(&u, &row, &[]).unwrap(), Datum::Text("CD".into()));
    }

    #[test]
    fn params_are_bound_by_position() {
        let q = Expr::compare(CompareOp::Eq, c(0, DataType::Int64), Expr::param(0, DataType::Int64));
        assert!(eval_quals(&[q.clone()], &[Datum::Int64(7)], &[Datum::Int64(7)]).unwrap());
        assert_eq!(eval_quals(&[q], &[Datum::Int64(7)], &[]), Err(EvalError::UnboundParam(0)));
    }
}
