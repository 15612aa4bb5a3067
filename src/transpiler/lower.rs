//! Lowering DataFusion physical expressions into [`Expr`] trees.
//!
//! Lets a DataFusion `FilterExec` predicate or `ProjectionExec` expression be
//! handed to a scan. Supported:
//! - `Column` and `Literal` (boolean, integer, float, Date32 and Utf8 scalars)
//! - `BinaryExpr` with comparison, arithmetic, `AND` and `OR` operators
//! - `Literal op Column` (comparison operator is flipped)
//! - `NotExpr`, `IsNullExpr`, `IsNotNullExpr`, `CastExpr`
//!
//! Anything else returns `None` and the caller keeps its own operator.

use std::sync::Arc;

use datafusion::common::ScalarValue;
use datafusion::logical_expr::Operator;
use datafusion::physical_expr::expressions::{
    BinaryExpr, CastExpr, Column, IsNotNullExpr, IsNullExpr, Literal, NotExpr,
};
use datafusion::physical_expr::PhysicalExpr;

use crate::chunk::arrow::from_arrow_type;
use crate::transpiler::{ArithOp, CompareOp, Expr};
use crate::types::{Datum, Schema};

/// Lower a filter predicate into a list of ANDed quals.
///
/// Top-level `AND`s are flattened so the planner can send each clause to the
/// device or the host independently.
pub fn lower_predicate(predicate: &Arc<dyn PhysicalExpr>, schema: &Schema) -> Option<Vec<Expr>> {
    let mut quals = Vec::new();
    for conjunct in split_conjunction(predicate) {
        quals.push(lower_physical_expr(conjunct, schema)?);
    }
    Some(quals)
}

fn split_conjunction(expr: &Arc<dyn PhysicalExpr>) -> Vec<&Arc<dyn PhysicalExpr>> {
    match expr.as_any().downcast_ref::<BinaryExpr>() {
        Some(bin) if *bin.op() == Operator::And => {
            let mut out = split_conjunction(bin.left());
            out.extend(split_conjunction(bin.right()));
            out
        }
        _ => vec![expr],
    }
}

/// Lower one physical expression, or `None` if any node is unsupported.
pub fn lower_physical_expr(expr: &Arc<dyn PhysicalExpr>, schema: &Schema) -> Option<Expr> {
    let any = expr.as_any();

    if let Some(col) = any.downcast_ref::<Column>() {
        let field = schema.field(col.index())?;
        return Some(Expr::col(col.index(), field.dtype));
    }
    if let Some(lit) = any.downcast_ref::<Literal>() {
        return lower_scalar(lit.value());
    }
    if let Some(not) = any.downcast_ref::<NotExpr>() {
        return Some(Expr::negate(lower_physical_expr(not.arg(), schema)?));
    }
    if let Some(is_null) = any.downcast_ref::<IsNullExpr>() {
        return Some(Expr::is_null(lower_physical_expr(is_null.arg(), schema)?));
    }
    if let Some(is_not_null) = any.downcast_ref::<IsNotNullExpr>() {
        return Some(Expr::is_not_null(lower_physical_expr(is_not_null.arg(), schema)?));
    }
    if let Some(cast) = any.downcast_ref::<CastExpr>() {
        let to = from_arrow_type(cast.cast_type())?;
        return Some(Expr::cast(lower_physical_expr(cast.expr(), schema)?, to));
    }

    let bin = any.downcast_ref::<BinaryExpr>()?;
    let left = lower_physical_expr(bin.left(), schema)?;
    let right = lower_physical_expr(bin.right(), schema)?;

    match bin.op() {
        Operator::And => return Some(flatten(Expr::and(vec![left, right]))),
        Operator::Or => return Some(flatten(Expr::or(vec![left, right]))),
        _ => {}
    }
    if let Some(op) = compare_op(bin.op()) {
        // Keep the column on the left: `5 < x` becomes `x > 5`.
        if left.is_leaf() && !matches!(left, Expr::Column { .. }) && matches!(right, Expr::Column { .. }) {
            return Some(Expr::compare(op.flip(), right, left));
        }
        return Some(Expr::compare(op, left, right));
    }
    let op = match bin.op() {
        Operator::Plus => ArithOp::Add,
        Operator::Minus => ArithOp::Sub,
        Operator::Multiply => ArithOp::Mul,
        Operator::Divide => ArithOp::Div,
        Operator::Modulo => ArithOp::Mod,
        _ => return None,
    };
    Some(Expr::arith(op, left, right))
}

fn compare_op(op: &Operator) -> Option<CompareOp> {
    Some(match op {
        Operator::Eq => CompareOp::Eq,
        Operator::NotEq => CompareOp::NotEq,
        Operator::Lt => CompareOp::Lt,
        Operator::LtEq => CompareOp::LtEq,
        Operator::Gt => CompareOp::Gt,
        Operator::GtEq => CompareOp::GtEq,
        _ => return None,
    })
}

/// Merge nested `AND(AND(..))` / `OR(OR(..))` into one level.
fn flatten(expr: Expr) -> Expr {
    match expr {
        Expr::And(args) => Expr::And(
            args.into_iter()
                .flat_map(|a| match a {
                    Expr::And(inner) => inner,
                    other => vec![other],
                })
                .collect(),
        ),
        Expr::Or(args) => Expr::Or(
            args.into_iter()
                .flat_map(|a| match a {
                    Expr::Or(inner) => inner,
                    other => vec![other],
                })
                .collect(),
        ),
        other => other,
    }
}

fn lower_scalar(value: &ScalarValue) -> Option<Expr> {
    let datum = match value {
        ScalarValue::Boolean(v) => v.map(Datum::Bool),
        ScalarValue::Int16(v) => v.map(Datum::Int16),
        ScalarValue::Int32(v) => v.map(Datum::Int32),
        ScalarValue::Int64(v) => v.map(Datum::Int64),
        ScalarValue::Float32(v) => v.map(Datum::Float32),
        ScalarValue::Float64(v) => v.map(Datum::Float64),
        ScalarValue::Date32(v) => v.map(Datum::Date),
        ScalarValue::Utf8(v) | ScalarValue::LargeUtf8(v) => v.clone().map(Datum::Text),
        _ => return None,
    };
    let dtype = from_arrow_type(&value.data_type())?;
    Some(match datum {
        Some(value) => Expr::Literal { value, dtype },
        None => Expr::typed_null(dtype),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, Field};

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("a", DataType::Int32),
            Field::new("b", DataType::Float64),
        ])
    }

    fn column(name: &str, index: usize) -> Arc<dyn PhysicalExpr> {
        Arc::new(Column::new(name, index))
    }

    fn literal(v: ScalarValue) -> Arc<dyn PhysicalExpr> {
        Arc::new(Literal::new(v))
    }

    fn binary(l: Arc<dyn PhysicalExpr>, op: Operator, r: Arc<dyn PhysicalExpr>) -> Arc<dyn PhysicalExpr> {
        Arc::new(BinaryExpr::new(l, op, r))
    }

    #[test]
    fn literal_on_left_is_flipped() {
        let pred = binary(literal(ScalarValue::Int32(Some(5))), Operator::Lt, column("a", 0));
        let quals = lower_predicate(&pred, &schema()).unwrap();
        assert_eq!(
            quals,
            vec![Expr::compare(
                CompareOp::Gt,
                Expr::col(0, DataType::Int32),
                Expr::lit(Datum::Int32(5))
            )]
        );
    }

    #[test]
    fn conjunction_is_split_into_quals() {
        let a_gt = binary(column("a", 0), Operator::Gt, literal(ScalarValue::Int32(Some(1))));
        let b_lt = binary(column("b", 1), Operator::Lt, literal(ScalarValue::Float64(Some(2.0))));
        let pred = binary(a_gt, Operator::And, b_lt);
        assert_eq!(lower_predicate(&pred, &schema()).unwrap().len(), 2);
    }

    #[test]
    fn arithmetic_lowers_and_unknown_operators_do_not() {
        let sum = binary(column("a", 0), Operator::Plus, column("b", 1));
        let e = lower_physical_expr(&sum, &schema()).unwrap();
        assert_eq!(e.data_type(), DataType::Float64);

        let concat = binary(column("a", 0), Operator::StringConcat, column("b", 1));
        assert!(lower_physical_expr(&concat, &schema()).is_none());
    }
}
