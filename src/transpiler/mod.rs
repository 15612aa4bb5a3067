//! Scalar expression trees and their translation into device code.
//!
//! An [`Expr`] is written over a fixed input row layout: `Column { index }`
//! addresses the input schema by position. The same tree is
//! - checked by [`ExprTranspiler::is_device_capable`] when a scan is planned,
//! - turned into kernel source by the transpiler and [`crate::gpu::codegen`],
//! - evaluated row-at-a-time by [`eval`] on the host fallback and recheck paths.
//!
//! ## Module Structure
//!
//! - `cuda`: the default transpiler, emitting CUDA C against the device library
//! - `eval`: host evaluator with SQL three-valued logic
//! - `lower`: lowering from DataFusion physical expressions

mod cuda;
pub mod eval;
pub mod lower;

use std::collections::BTreeSet;
use std::fmt;

use crate::error::Result;
use crate::gpu::codegen::{self, CodegenContext, ProjectionCode};
use crate::types::{DataType, Datum, Schema};

pub use cuda::CudaTranspiler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl ArithOp {
    pub(crate) fn symbol(&self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
        }
    }

    pub(crate) fn device_name(&self) -> &'static str {
        match self {
            ArithOp::Add => "add",
            ArithOp::Sub => "sub",
            ArithOp::Mul => "mul",
            ArithOp::Div => "div",
            ArithOp::Mod => "mod",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    pub(crate) fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "<>",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
        }
    }

    pub(crate) fn device_name(&self) -> &'static str {
        match self {
            CompareOp::Eq => "eq",
            CompareOp::NotEq => "ne",
            CompareOp::Lt => "lt",
            CompareOp::LtEq => "le",
            CompareOp::Gt => "gt",
            CompareOp::GtEq => "ge",
        }
    }

    /// The operator with its operands swapped (`5 < x` is `x > 5`).
    pub fn flip(&self) -> CompareOp {
        match self {
            CompareOp::Eq => CompareOp::Eq,
            CompareOp::NotEq => CompareOp::NotEq,
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::LtEq => CompareOp::GtEq,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::GtEq => CompareOp::LtEq,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarFunc {
    Abs,
    /// Byte length of a text value.
    Length,
    Upper,
    Lower,
    Concat,
}

impl ScalarFunc {
    pub fn name(&self) -> &'static str {
        match self {
            ScalarFunc::Abs => "abs",
            ScalarFunc::Length => "length",
            ScalarFunc::Upper => "upper",
            ScalarFunc::Lower => "lower",
            ScalarFunc::Concat => "concat",
        }
    }

    /// Functions whose result is a fresh variable-length value.
    pub fn returns_varlena(&self) -> bool {
        matches!(self, ScalarFunc::Upper | ScalarFunc::Lower | ScalarFunc::Concat)
    }
}

/// A node in a scalar expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Input column by position.
    Column { index: usize, dtype: DataType },
    /// A constant. Shipped to the device through the parameter buffer.
    Literal { value: Datum, dtype: DataType },
    /// A value bound by the host at scan start (`$id`).
    Param { id: usize, dtype: DataType },
    Arith {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    IsNull { arg: Box<Expr>, negated: bool },
    Cast { arg: Box<Expr>, to: DataType },
    Func { func: ScalarFunc, args: Vec<Expr> },
}

impl Expr {
    pub fn col(index: usize, dtype: DataType) -> Expr {
        Expr::Column { index, dtype }
    }

    /// Constant of the datum's own type. A bare `Datum::Null` is typed boolean;
    /// use [`Expr::typed_null`] for anything else.
    pub fn lit(value: Datum) -> Expr {
        let dtype = value.data_type().unwrap_or(DataType::Bool);
        Expr::Literal { value, dtype }
    }

    pub fn typed_null(dtype: DataType) -> Expr {
        Expr::Literal {
            value: Datum::Null,
            dtype,
        }
    }

    pub fn param(id: usize, dtype: DataType) -> Expr {
        Expr::Param { id, dtype }
    }

    pub fn arith(op: ArithOp, left: Expr, right: Expr) -> Expr {
        Expr::Arith {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn compare(op: CompareOp, left: Expr, right: Expr) -> Expr {
        Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn and(args: Vec<Expr>) -> Expr {
        Expr::And(args)
    }

    pub fn or(args: Vec<Expr>) -> Expr {
        Expr::Or(args)
    }

    pub fn negate(arg: Expr) -> Expr {
        Expr::Not(Box::new(arg))
    }

    pub fn is_null(arg: Expr) -> Expr {
        Expr::IsNull {
            arg: Box::new(arg),
            negated: false,
        }
    }

    pub fn is_not_null(arg: Expr) -> Expr {
        Expr::IsNull {
            arg: Box::new(arg),
            negated: true,
        }
    }

    pub fn cast(arg: Expr, to: DataType) -> Expr {
        Expr::Cast {
            arg: Box::new(arg),
            to,
        }
    }

    pub fn func(func: ScalarFunc, args: Vec<Expr>) -> Expr {
        Expr::Func { func, args }
    }

    /// Result type of the expression.
    pub fn data_type(&self) -> DataType {
        match self {
            Expr::Column { dtype, .. } | Expr::Literal { dtype, .. } | Expr::Param { dtype, .. } => {
                *dtype
            }
            Expr::Arith { left, right, .. } => {
                let (lt, rt) = (left.data_type(), right.data_type());
                DataType::promote(lt, rt).unwrap_or(lt)
            }
            Expr::Compare { .. } | Expr::And(_) | Expr::Or(_) | Expr::Not(_) | Expr::IsNull { .. } => {
                DataType::Bool
            }
            Expr::Cast { to, .. } => *to,
            Expr::Func { func, args } => match func {
                ScalarFunc::Abs => args.first().map_or(DataType::Int32, |a| a.data_type()),
                ScalarFunc::Length => DataType::Int32,
                ScalarFunc::Upper | ScalarFunc::Lower | ScalarFunc::Concat => DataType::Text,
            },
        }
    }

    /// A leaf that needs no evaluation beyond a load.
    pub fn is_leaf(&self) -> bool {
        matches!(
            self,
            Expr::Column { .. } | Expr::Literal { .. } | Expr::Param { .. }
        )
    }

    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Column { .. } | Expr::Literal { .. } | Expr::Param { .. } => vec![],
            Expr::Arith { left, right, .. } | Expr::Compare { left, right, .. } => {
                vec![left.as_ref(), right.as_ref()]
            }
            Expr::And(args) | Expr::Or(args) | Expr::Func { args, .. } => args.iter().collect(),
            Expr::Not(arg) | Expr::IsNull { arg, .. } | Expr::Cast { arg, .. } => vec![arg.as_ref()],
        }
    }

    /// Input columns referenced anywhere in the tree.
    pub fn columns(&self) -> BTreeSet<usize> {
        let mut out = BTreeSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut BTreeSet<usize>) {
        if let Expr::Column { index, .. } = self {
            out.insert(*index);
        }
        for child in self.children() {
            child.collect_columns(out);
        }
    }

    /// Copy of the tree with every column index passed through `map`.
    /// Returns `None` if `map` rejects any index.
    pub fn remap_columns(&self, map: &impl Fn(usize) -> Option<usize>) -> Option<Expr> {
        let boxed = |e: &Expr| e.remap_columns(map).map(Box::new);
        Some(match self {
            Expr::Column { index, dtype } => Expr::Column {
                index: map(*index)?,
                dtype: *dtype,
            },
            Expr::Literal { .. } | Expr::Param { .. } => self.clone(),
            Expr::Arith { op, left, right } => Expr::Arith {
                op: *op,
                left: boxed(left)?,
                right: boxed(right)?,
            },
            Expr::Compare { op, left, right } => Expr::Compare {
                op: *op,
                left: boxed(left)?,
                right: boxed(right)?,
            },
            Expr::And(args) => Expr::And(remap_all(args, map)?),
            Expr::Or(args) => Expr::Or(remap_all(args, map)?),
            Expr::Not(arg) => Expr::Not(boxed(arg)?),
            Expr::IsNull { arg, negated } => Expr::IsNull {
                arg: boxed(arg)?,
                negated: *negated,
            },
            Expr::Cast { arg, to } => Expr::Cast {
                arg: boxed(arg)?,
                to: *to,
            },
            Expr::Func { func, args } => Expr::Func {
                func: *func,
                args: remap_all(args, map)?,
            },
        })
    }

    /// Copy of the tree with every leaf replaced by `f(leaf)`.
    pub(crate) fn map_leaves(&self, f: &mut dyn FnMut(&Expr) -> Expr) -> Expr {
        let mut boxed = |e: &Expr, f: &mut dyn FnMut(&Expr) -> Expr| Box::new(e.map_leaves(f));
        match self {
            Expr::Column { .. } | Expr::Literal { .. } | Expr::Param { .. } => f(self),
            Expr::Arith { op, left, right } => Expr::Arith {
                op: *op,
                left: boxed(left, f),
                right: boxed(right, f),
            },
            Expr::Compare { op, left, right } => Expr::Compare {
                op: *op,
                left: boxed(left, f),
                right: boxed(right, f),
            },
            Expr::And(args) => Expr::And(args.iter().map(|a| a.map_leaves(f)).collect()),
            Expr::Or(args) => Expr::Or(args.iter().map(|a| a.map_leaves(f)).collect()),
            Expr::Not(arg) => Expr::Not(boxed(arg, f)),
            Expr::IsNull { arg, negated } => Expr::IsNull {
                arg: boxed(arg, f),
                negated: *negated,
            },
            Expr::Cast { arg, to } => Expr::Cast {
                arg: boxed(arg, f),
                to: *to,
            },
            Expr::Func { func, args } => Expr::Func {
                func: *func,
                args: args.iter().map(|a| a.map_leaves(f)).collect(),
            },
        }
    }

    /// Render against `schema` so columns show their names.
    pub fn display<'a>(&'a self, schema: &'a Schema) -> ExprDisplay<'a> {
        ExprDisplay { expr: self, schema }
    }
}

fn remap_all(args: &[Expr], map: &impl Fn(usize) -> Option<usize>) -> Option<Vec<Expr>> {
    args.iter().map(|a| a.remap_columns(map)).collect()
}

pub struct ExprDisplay<'a> {
    expr: &'a Expr,
    schema: &'a Schema,
}

impl ExprDisplay<'_> {
    fn sub<'b>(&'b self, expr: &'b Expr) -> ExprDisplay<'b> {
        ExprDisplay {
            expr,
            schema: self.schema,
        }
    }

    fn list(&self, f: &mut fmt::Formatter<'_>, args: &[Expr], sep: &str) -> fmt::Result {
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                f.write_str(sep)?;
            }
            write!(f, "{}", self.sub(arg))?;
        }
        Ok(())
    }
}

impl fmt::Display for ExprDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.expr {
            Expr::Column { index, .. } => match self.schema.field(*index) {
                Some(field) => f.write_str(&field.name),
                None => write!(f, "#{index}"),
            },
            Expr::Literal { value, .. } => write!(f, "{value}"),
            Expr::Param { id, .. } => write!(f, "${id}"),
            Expr::Arith { op, left, right } => {
                write!(f, "({} {} {})", self.sub(left), op.symbol(), self.sub(right))
            }
            Expr::Compare { op, left, right } => {
                write!(f, "({} {} {})", self.sub(left), op.symbol(), self.sub(right))
            }
            Expr::And(args) => {
                f.write_str("(")?;
                self.list(f, args, " AND ")?;
                f.write_str(")")
            }
            Expr::Or(args) => {
                f.write_str("(")?;
                self.list(f, args, " OR ")?;
                f.write_str(")")
            }
            Expr::Not(arg) => write!(f, "NOT {}", self.sub(arg)),
            Expr::IsNull { arg, negated } => {
                let kw = if *negated { "IS NOT NULL" } else { "IS NULL" };
                write!(f, "({} {kw})", self.sub(arg))
            }
            Expr::Cast { arg, to } => write!(f, "CAST({} AS {to})", self.sub(arg)),
            Expr::Func { func, args } => {
                write!(f, "{}(", func.name())?;
                self.list(f, args, ", ")?;
                f.write_str(")")
            }
        }
    }
}

/// Translator from expression trees to device source text.
///
/// The scan planner only hands it expressions that `is_device_capable`
/// accepted; emitting an expression it rejected is a planning bug and
/// returns `ScanError::Plan`.
pub trait ExprTranspiler: Send + Sync + fmt::Debug {
    /// Whether `expr` can run inside a generated kernel.
    fn is_device_capable(&self, expr: &Expr) -> bool;

    /// Device expression for `expr`. Column and parameter references are
    /// registered in `ctx` so their declarations can be emitted later.
    fn emit_expr(&self, expr: &Expr, ctx: &mut CodegenContext) -> Result<String>;

    /// Body of the row-filter function for the AND of `quals`.
    fn emit_predicate_code(&self, quals: &[Expr], ctx: &mut CodegenContext) -> Result<String> {
        codegen::emit_quals_function(self, quals, ctx)
    }

    /// Projection functions for `targets` plus the width totals used to
    /// size the destination chunk.
    fn emit_projection_code(
        &self,
        targets: &[Expr],
        ctx: &mut CodegenContext,
    ) -> Result<ProjectionCode> {
        codegen::emit_projection_functions(self, targets, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Field;

    #[test]
    fn display_uses_column_names() {
        let schema = Schema::new(vec![
            Field::new("id", DataType::Int32),
            Field::new("name", DataType::Text),
        ]);
        let e = Expr::and(vec![
            Expr::compare(CompareOp::Gt, Expr::col(0, DataType::Int32), Expr::lit(Datum::Int32(10))),
            Expr::is_not_null(Expr::col(1, DataType::Text)),
        ]);
        assert_eq!(e.display(&schema).to_string(), "((id > 10) AND (name IS NOT NULL))");
    }

    #[test]
    fn remap_rejects_unmapped_column() {
        let e = Expr::arith(ArithOp::Add, Expr::col(0, DataType::Int32), Expr::col(2, DataType::Int32));
        let mapped = e.remap_columns(&|i| if i == 0 { Some(5) } else { Some(i) });
        assert_eq!(mapped.map(|m| m.columns()), Some(BTreeSet::from([2, 5])));
        assert!(e.remap_columns(&|i| (i == 0).then_some(0)).is_none());
    }

    #[test]
    fn arithmetic_type_is_promoted() {
        let e = Expr::arith(ArithOp::Mul, Expr::col(0, DataType::Int16), Expr::lit(Datum::Float64(1.5)));
        assert_eq!(e.data_type(), DataType::Float64);
    }
}
