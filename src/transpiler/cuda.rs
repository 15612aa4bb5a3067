//! Default transpiler: CUDA C against the device library in `gpu/cuda_lib`.
//!
//! Every value is a `pg_<type>_t` struct carrying an `isnull` flag, and every
//! operator is a `pgfn_<type>_<op>(kcxt, ...)` call, so NULL propagation and
//! error reporting live in the library rather than in generated code.

use crate::error::{Result, ScanError};
use crate::gpu::codegen::{CodegenContext, ExtraFlags};
use crate::transpiler::{Expr, ExprTranspiler, ScalarFunc};
use crate::types::DataType;

#[derive(Debug, Default, Clone, Copy)]
pub struct CudaTranspiler;

impl CudaTranspiler {
    fn capable(&self, expr: &Expr, root: bool) -> bool {
        match expr {
            Expr::Column { dtype, .. } | Expr::Literal { dtype, .. } | Expr::Param { dtype, .. } => {
                *dtype != DataType::Json
            }
            Expr::Arith { left, right, .. } => {
                DataType::promote(left.data_type(), right.data_type()).is_some()
                    && self.capable(left, false)
                    && self.capable(right, false)
            }
            Expr::Compare { left, right, .. } => {
                let (lt, rt) = (left.data_type(), right.data_type());
                let comparable = DataType::promote(lt, rt).is_some() || (lt == rt && lt != DataType::Json);
                comparable && self.capable(left, false) && self.capable(right, false)
            }
            Expr::And(args) | Expr::Or(args) => args.iter().all(|a| self.capable(a, false)),
            Expr::Not(arg) | Expr::IsNull { arg, .. } => self.capable(arg, false),
            Expr::Cast { arg, to } => {
                arg.data_type().is_numeric() && to.is_numeric() && self.capable(arg, false)
            }
            Expr::Func { func, args } => {
                let text_leaves = args
                    .iter()
                    .all(|a| a.is_leaf() && a.data_type() == DataType::Text && self.capable(a, false));
                match func {
                    ScalarFunc::Abs => {
                        args.len() == 1 && args[0].data_type().is_numeric() && self.capable(&args[0], false)
                    }
                    ScalarFunc::Length => args.len() == 1 && text_leaves,
                    // Fresh variable-length values have no device scratch space; they
                    // can only be written straight into a projection slot.
                    ScalarFunc::Upper | ScalarFunc::Lower => root && args.len() == 1 && text_leaves,
                    ScalarFunc::Concat => root && !args.is_empty() && text_leaves,
                }
            }
        }
    }

    fn coerce(&self, expr: &Expr, to: DataType, ctx: &mut CodegenContext) -> Result<String> {
        let code = self.emit_expr(expr, ctx)?;
        let from = expr.data_type();
        if from == to {
            return Ok(code);
        }
        Ok(format!(
            "pgfn_{}_from_{}(kcxt, {code})",
            to.device_name(),
            from.device_name()
        ))
    }

    fn note_type(&self, dtype: DataType, ctx: &mut CodegenContext) {
        match dtype {
            DataType::Float32 | DataType::Float64 => ctx.require(ExtraFlags::MATHLIB),
            DataType::Text => ctx.require(ExtraFlags::TEXTLIB),
            _ => {}
        }
    }

    fn fold(&self, fname: &str, args: &[Expr], ctx: &mut CodegenContext) -> Result<String> {
        let mut iter = args.iter();
        let Some(first) = iter.next() else {
            return Err(ScanError::Plan(format!("empty argument list for {fname}")));
        };
        let mut code = self.emit_expr(first, ctx)?;
        for arg in iter {
            let next = self.emit_expr(arg, ctx)?;
            code = format!("{fname}(kcxt, {code}, {next})");
        }
        Ok(code)
    }
}

impl ExprTranspiler for CudaTranspiler {
    fn is_device_capable(&self, expr: &Expr) -> bool {
        self.capable(expr, true)
    }

    fn emit_expr(&self, expr: &Expr, ctx: &mut CodegenContext) -> Result<String> {
        if !self.capable(expr, false) && !matches!(expr, Expr::Func { .. }) {
            return Err(ScanError::Plan(format!(
                "expression is not device capable: {expr:?}"
            )));
        }
        self.note_type(expr.data_type(), ctx);
        match expr {
            Expr::Column { index, dtype } => Ok(ctx.var_ref(*index, *dtype)),
            Expr::Literal { value, dtype } => Ok(ctx.const_param(value.clone(), *dtype)),
            Expr::Param { id, dtype } => Ok(ctx.bound_param(*id, *dtype)),
            Expr::Arith { op, left, right } => {
                let t = expr.data_type();
                let l = self.coerce(left, t, ctx)?;
                let r = self.coerce(right, t, ctx)?;
                Ok(format!("pgfn_{}_{}(kcxt, {l}, {r})", t.device_name(), op.device_name()))
            }
            Expr::Compare { op, left, right } => {
                let (lt, rt) = (left.data_type(), right.data_type());
                let t = DataType::promote(lt, rt).unwrap_or(lt);
                self.note_type(t, ctx);
                let l = self.coerce(left, t, ctx)?;
                let r = self.coerce(right, t, ctx)?;
                Ok(format!("pgfn_{}_{}(kcxt, {l}, {r})", t.device_name(), op.device_name()))
            }
            Expr::And(args) => self.fold("pgfn_bool_and", args, ctx),
            Expr::Or(args) => self.fold("pgfn_bool_or", args, ctx),
            Expr::Not(arg) => Ok(format!("pgfn_bool_not(kcxt, {})", self.emit_expr(arg, ctx)?)),
            Expr::IsNull { arg, negated } => {
                let macro_name = if *negated { "PG_ISNOTNULL" } else { "PG_ISNULL" };
                Ok(format!("{macro_name}({})", self.emit_expr(arg, ctx)?))
            }
            Expr::Cast { arg, to } => self.coerce(arg, *to, ctx),
            Expr::Func { func, args } => match func {
                ScalarFunc::Abs => {
                    let t = expr.data_type();
                    Ok(format!("pgfn_{}_abs(kcxt, {})", t.device_name(), self.emit_expr(&args[0], ctx)?))
                }
                ScalarFunc::Length if args.len() == 1 => {
                    ctx.require(ExtraFlags::TEXTLIB);
                    Ok(format!("pgfn_text_length(kcxt, {})", self.emit_expr(&args[0], ctx)?))
                }
                _ => Err(ScanError::Plan(format!(
                    "{}() yields a new variable-length value and is only allowed as a projection target",
                    func.name()
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transpiler::{ArithOp, CompareOp};
    use crate::types::Datum;

    #[test]
    fn json_columns_are_not_device_capable() {
        let t = CudaTranspiler;
        let q = Expr::compare(
            CompareOp::Eq,
            Expr::col(0, DataType::Json),
            Expr::Literal {
                value: Datum::Json("{}".into()),
                dtype: DataType::Json,
            },
        );
        assert!(!t.is_device_capable(&q));
        assert!(t.is_device_capable(&Expr::compare(
            CompareOp::Gt,
            Expr::col(1, DataType::Int64),
            Expr::lit(Datum::Int32(3))
        )));
    }

    #[test]
    fn varlena_functions_only_at_root() {
        let t = CudaTranspiler;
        let concat = Expr::func(
            ScalarFunc::Concat,
            vec![Expr::col(0, DataType::Text), Expr::lit(Datum::Text("x".into()))],
        );
        assert!(t.is_device_capable(&concat));
        let nested = Expr::compare(CompareOp::Eq, concat, Expr::lit(Datum::Text("ax".into())));
        assert!(!t.is_device_capable(&nested));
    }

    #[test]
    fn mixed_arithmetic_emits_casts() {
        let t = CudaTranspiler;
        let mut ctx = CodegenContext::default();
        let e = Expr::arith(ArithOp::Add, Expr::col(0, DataType::Int32), Expr::col(1, DataType::Int64));
        let code = t.emit_expr(&e, &mut ctx).unwrap();
        assert_eq!(code, "pgfn_int8_add(kcxt, pgfn_int8_from_int4(kcxt, KVAR_1), KVAR_2)");
        assert_eq!(ctx.columns(), vec![0, 1]);
    }
}
