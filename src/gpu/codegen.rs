//! Device program generation for scan quals and projections.
//!
//! Builds the CUDA C source of one scan program from expression trees that
//! the planner already judged device capable. The result is a
//! [`KernelProgram`]: source text, the parameter list, the referenced input
//! columns and the library modules the source needs. Programs are pure
//! functions of their inputs and are cached by signature.
//!
//! # Generated functions
//! - `gpuscan_quals_eval(kcxt, kds, kds_index)`: the AND of the device quals
//! - `gpuscan_projection_values(kcxt, kds, kds_index, v)`: evaluates every
//!   target into a `gpuscan_proj_values` struct
//! - `gpuscan_projection_size(v, format)`: sizing pass
//! - `gpuscan_projection_write(v, format, kds_dst, dst_index, buf)`: writing pass
//!
//! The entry kernels in `cuda_lib/gpuscan.cuh` call these. The projection
//! kernel runs the sizing pass for every row, reserves space for the whole
//! block with a prefix sum, then runs the writing pass at the reserved
//! offsets. Both passes are emitted from the same list of output slots in
//! the same order with the same null tests, so the size computed for a row
//! is exactly what gets written.
//!
//! # Parameters
//! Constants and host-bound values are shipped in the parameter buffer and
//! read as `KPARAM_n`; input columns are read as `KVAR_n` (1-based).

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::chunk::layout::{typealign, TupleLayout};
use crate::error::{EvalError, Result, ScanError};
use crate::transpiler::{Expr, ExprTranspiler, ScalarFunc};
use crate::types::{DataType, Datum, SchemaRef};

const COMMON_LIB: &str = include_str!("cuda_lib/common.cuh");
const TEXT_LIB: &str = include_str!("cuda_lib/textlib.cuh");
const MATH_LIB: &str = include_str!("cuda_lib/mathlib.cuh");
const GPUSCAN_LIB: &str = include_str!("cuda_lib/gpuscan.cuh");

/// Extra bytes assumed per computed variable-length output column.
pub const COMPUTED_VARLENA_WIDTH: usize = 32;

macro_rules! emit {
    ($out:expr) => {
        $out.push('\n')
    };
    ($out:expr, $($arg:tt)*) => {{
        $out.push_str(&format!($($arg)*));
        $out.push('\n');
    }};
}

// ── Extra flags ─────────────────────────────────────────────────────────────

/// Device library modules a program needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ExtraFlags(u32);

impl ExtraFlags {
    pub const GPUSCAN: ExtraFlags = ExtraFlags(1 << 0);
    pub const TEXTLIB: ExtraFlags = ExtraFlags(1 << 1);
    pub const MATHLIB: ExtraFlags = ExtraFlags(1 << 2);

    pub fn contains(self, other: ExtraFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ExtraFlags) {
        self.0 |= other.0;
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn names(self) -> Vec<&'static str> {
        [
            (Self::GPUSCAN, "gpuscan"),
            (Self::TEXTLIB, "textlib"),
            (Self::MATHLIB, "mathlib"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect()
    }
}

impl fmt::Display for ExtraFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names().join(", "))
    }
}

// ── Codegen context ─────────────────────────────────────────────────────────

/// Where a `KPARAM_n` slot gets its value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamSource {
    Const { value: Datum, dtype: DataType },
    Bound { id: usize, dtype: DataType },
}

impl ParamSource {
    pub fn dtype(&self) -> DataType {
        match self {
            ParamSource::Const { dtype, .. } | ParamSource::Bound { dtype, .. } => *dtype,
        }
    }
}

/// State threaded through expression emission.
///
/// Parameter slots are shared by every function of the program; variable
/// declarations are tracked per function.
#[derive(Debug, Default)]
pub struct CodegenContext {
    params: Vec<ParamSource>,
    columns: BTreeSet<usize>,
    fn_vars: BTreeMap<usize, DataType>,
    fn_params: BTreeSet<usize>,
    extra_flags: ExtraFlags,
}

impl CodegenContext {
    /// Reference to input column `index`.
    pub fn var_ref(&mut self, index: usize, dtype: DataType) -> String {
        self.columns.insert(index);
        self.fn_vars.insert(index, dtype);
        format!("KVAR_{}", index + 1)
    }

    /// Reference to a constant; equal constants share one slot.
    pub fn const_param(&mut self, value: Datum, dtype: DataType) -> String {
        let slot = self.const_slot(value, dtype);
        self.fn_params.insert(slot);
        format!("KPARAM_{slot}")
    }

    /// Reference to the host-bound value `$id`.
    pub fn bound_param(&mut self, id: usize, dtype: DataType) -> String {
        let slot = self.bound_slot(id, dtype);
        self.fn_params.insert(slot);
        format!("KPARAM_{slot}")
    }

    pub fn require(&mut self, flags: ExtraFlags) {
        self.extra_flags.insert(flags);
    }

    /// Every input column referenced so far, ascending.
    pub fn columns(&self) -> Vec<usize> {
        self.columns.iter().copied().collect()
    }

    pub fn params(&self) -> &[ParamSource] {
        &self.params
    }

    pub fn extra_flags(&self) -> ExtraFlags {
        self.extra_flags
    }

    fn const_slot(&mut self, value: Datum, dtype: DataType) -> usize {
        let source = ParamSource::Const { value, dtype };
        self.slot_of(source)
    }

    fn bound_slot(&mut self, id: usize, dtype: DataType) -> usize {
        self.slot_of(ParamSource::Bound { id, dtype })
    }

    fn slot_of(&mut self, source: ParamSource) -> usize {
        if let Some(slot) = self.params.iter().position(|p| *p == source) {
            return slot;
        }
        self.params.push(source);
        self.params.len() - 1
    }

    fn begin_function(&mut self) {
        self.fn_vars.clear();
        self.fn_params.clear();
    }

    /// Declarations for the parameters and columns the current function used.
    fn declarations(&self, kds: &str, index: &str) -> String {
        let mut out = String::new();
        for slot in &self.fn_params {
            let t = self.params[*slot].dtype().device_name();
            emit!(out, "  pg_{t}_t KPARAM_{slot} = pg_{t}_param(kcxt, {slot});");
        }
        for (column, dtype) in &self.fn_vars {
            let t = dtype.device_name();
            emit!(
                out,
                "  pg_{t}_t KVAR_{} = pg_{t}_vref({kds}, kcxt, {column}, {index});",
                column + 1
            );
        }
        out
    }

    /// Copy of `expr` with constants and bound values replaced by their
    /// parameter slots, so it evaluates against the decoded parameter buffer.
    fn bind_slots(&mut self, expr: &Expr) -> Expr {
        expr.map_leaves(&mut |leaf| match leaf {
            Expr::Literal { value, dtype } => Expr::Param {
                id: self.const_slot(value.clone(), *dtype),
                dtype: *dtype,
            },
            Expr::Param { id, dtype } => Expr::Param {
                id: self.bound_slot(*id, *dtype),
                dtype: *dtype,
            },
            other => other.clone(),
        })
    }
}

// ── Quals ───────────────────────────────────────────────────────────────────

/// Emit `gpuscan_quals_eval` for the AND of `quals`.
pub fn emit_quals_function<T: ExprTranspiler + ?Sized>(
    transpiler: &T,
    quals: &[Expr],
    ctx: &mut CodegenContext,
) -> Result<String> {
    ctx.begin_function();
    let body = match quals {
        [] => "true".to_string(),
        [qual] => format!("EVAL({})", transpiler.emit_expr(qual, ctx)?),
        many => format!("EVAL({})", transpiler.emit_expr(&Expr::and(many.to_vec()), ctx)?),
    };

    let mut out = String::new();
    emit!(out, "STATIC_FUNCTION(cl_bool)");
    emit!(out, "gpuscan_quals_eval(kern_context *kcxt,");
    emit!(out, "                   kern_data_store *kds,");
    emit!(out, "                   size_t kds_index)");
    emit!(out, "{{");
    out.push_str(&ctx.declarations("kds", "kds_index"));
    emit!(out);
    emit!(out, "  return {body};");
    emit!(out, "}}");
    Ok(out)
}

// ── Projection ──────────────────────────────────────────────────────────────

/// Output of [`emit_projection_functions`].
#[derive(Debug, Clone)]
pub struct ProjectionCode {
    pub source: String,
    /// Fixed part of one output row, tuple header included.
    pub fixed_width: usize,
    /// Estimated variable-length bytes per output row for computed values.
    pub extra_width: usize,
}

enum SlotValue {
    /// A value of the slot's own type, copied as is.
    Plain,
    Concat,
    Upper,
    Lower,
}

/// One output column. Both passes walk the same `Vec<ProjSlot>`.
struct ProjSlot {
    resno: usize,
    dtype: DataType,
    /// Struct members holding the evaluated inputs of this slot.
    members: Vec<(String, DataType)>,
    value: SlotValue,
}

impl ProjSlot {
    fn null_test(&self) -> String {
        let tests: Vec<String> = self.members.iter().map(|(m, _)| format!("v->{m}.isnull")).collect();
        tests.join(" || ")
    }

    fn varlena_length(&self) -> String {
        let lens: Vec<String> = self.members.iter().map(|(m, _)| format!("v->{m}.len")).collect();
        format!("({})", lens.join(" + "))
    }

    fn payload_copies(&self) -> Vec<String> {
        self.members
            .iter()
            .map(|(m, t)| {
                let copy = match self.value {
                    SlotValue::Upper => "pg_text_upper_copy".to_string(),
                    SlotValue::Lower => "pg_text_lower_copy".to_string(),
                    SlotValue::Plain | SlotValue::Concat => format!("pg_{}_copy", t.device_name()),
                };
                format!("off += {copy}(buf + off, v->{m});")
            })
            .collect()
    }
}

fn plan_slots<T: ExprTranspiler + ?Sized>(
    transpiler: &T,
    targets: &[Expr],
    ctx: &mut CodegenContext,
) -> Result<(Vec<ProjSlot>, Vec<String>)> {
    let mut slots = Vec::with_capacity(targets.len());
    let mut assigns = Vec::new();
    for (resno, target) in targets.iter().enumerate() {
        let dtype = target.data_type();
        let (value, inputs): (SlotValue, Vec<&Expr>) = match target {
            Expr::Func {
                func: ScalarFunc::Concat,
                args,
            } => (SlotValue::Concat, args.iter().collect()),
            Expr::Func {
                func: ScalarFunc::Upper,
                args,
            } if args.len() == 1 => (SlotValue::Upper, vec![&args[0]]),
            Expr::Func {
                func: ScalarFunc::Lower,
                args,
            } if args.len() == 1 => (SlotValue::Lower, vec![&args[0]]),
            _ => (SlotValue::Plain, vec![target]),
        };
        let single = inputs.len() == 1 && matches!(value, SlotValue::Plain);
        let mut members = Vec::with_capacity(inputs.len());
        for (k, input) in inputs.into_iter().enumerate() {
            let member = if single { format!("t{resno}") } else { format!("t{resno}_{k}") };
            // Bare columns are copied whatever their type.
            let code = match input {
                Expr::Column { index, dtype } => ctx.var_ref(*index, *dtype),
                other => transpiler.emit_expr(other, ctx)?,
            };
            assigns.push(format!("  v->{member} = {code};"));
            members.push((member, input.data_type()));
        }
        slots.push(ProjSlot {
            resno,
            dtype,
            members,
            value,
        });
    }
    Ok((slots, assigns))
}

/// Emit the projection struct and its three functions for `targets`.
pub fn emit_projection_functions<T: ExprTranspiler + ?Sized>(
    transpiler: &T,
    targets: &[Expr],
    ctx: &mut CodegenContext,
) -> Result<ProjectionCode> {
    if targets.is_empty() {
        return Err(ScanError::Plan("projection without target columns".into()));
    }
    ctx.begin_function();
    let (slots, assigns) = plan_slots(transpiler, targets, ctx)?;
    let natts = slots.len();

    let mut out = String::new();
    emit!(out, "typedef struct");
    emit!(out, "{{");
    for slot in &slots {
        for (member, t) in &slot.members {
            emit!(out, "  pg_{}_t {member};", t.device_name());
        }
    }
    emit!(out, "}} gpuscan_proj_values;");
    emit!(out);

    // values
    emit!(out, "STATIC_FUNCTION(void)");
    emit!(out, "gpuscan_projection_values(kern_context *kcxt,");
    emit!(out, "                          kern_data_store *kds,");
    emit!(out, "                          size_t kds_index,");
    emit!(out, "                          gpuscan_proj_values *v)");
    emit!(out, "{{");
    out.push_str(&ctx.declarations("kds", "kds_index"));
    emit!(out);
    for assign in &assigns {
        emit!(out, "{assign}");
    }
    emit!(out, "}}");
    emit!(out);

    // sizing pass
    emit!(out, "STATIC_FUNCTION(cl_uint)");
    emit!(out, "gpuscan_projection_size(const gpuscan_proj_values *v, cl_uint format)");
    emit!(out, "{{");
    emit!(out, "  cl_uint off = (format == KDS_FORMAT_ROW ? TUPLE_HEADER_LENGTH({natts}) : 0);");
    emit!(out);
    for slot in &slots {
        if slot.dtype.is_varlena() {
            emit!(out, "  if (!({}))", slot.null_test());
            emit!(
                out,
                "    off = TYPEALIGN(4, off) + (format == KDS_FORMAT_ROW ? VARHDRSZ : 0) + {};",
                slot.varlena_length()
            );
        } else {
            emit!(out, "  if (format == KDS_FORMAT_ROW && !({}))", slot.null_test());
            emit!(
                out,
                "    off = TYPEALIGN({}, off) + {};",
                slot.dtype.attalign(),
                slot.dtype.attlen()
            );
        }
    }
    emit!(out, "  return MAXALIGN(off);");
    emit!(out, "}}");
    emit!(out);

    // writing pass
    emit!(out, "STATIC_FUNCTION(cl_uint)");
    emit!(out, "gpuscan_projection_write(const gpuscan_proj_values *v,");
    emit!(out, "                         cl_uint format,");
    emit!(out, "                         kern_data_store *kds_dst,");
    emit!(out, "                         size_t dst_index,");
    emit!(out, "                         char *buf)");
    emit!(out, "{{");
    emit!(out, "  cl_uint off = (format == KDS_FORMAT_ROW ? tuple_form_header(buf, {natts}) : 0);");
    emit!(out, "  Datum *values = KDS_SLOT_VALUES(kds_dst, dst_index);");
    emit!(out, "  cl_bool *isnull = KDS_SLOT_ISNULL(kds_dst, dst_index);");
    emit!(out);
    for slot in &slots {
        let j = slot.resno;
        let t = slot.dtype.device_name();
        emit!(out, "  if ({})", slot.null_test());
        emit!(out, "  {{");
        emit!(out, "    if (format == KDS_FORMAT_ROW)");
        emit!(out, "      tuple_set_hasnull(buf);");
        emit!(out, "    else");
        emit!(out, "      isnull[{j}] = true;");
        emit!(out, "  }}");
        if slot.dtype.is_varlena() {
            let len = slot.varlena_length();
            emit!(out, "  else");
            emit!(out, "  {{");
            emit!(out, "    off = TYPEALIGN(4, off);");
            emit!(out, "    if (format == KDS_FORMAT_ROW)");
            emit!(out, "    {{");
            emit!(out, "      pg_varlena_set_length(buf + off, {len});");
            emit!(out, "      off += VARHDRSZ;");
            emit!(out, "      tuple_set_notnull(buf, {j});");
            emit!(out, "    }}");
            emit!(out, "    else");
            emit!(out, "    {{");
            emit!(out, "      values[{j}] = pg_slot_varlena(kds_dst, buf + off, {len});");
            emit!(out, "      isnull[{j}] = false;");
            emit!(out, "    }}");
            for copy in slot.payload_copies() {
                emit!(out, "    {copy}");
            }
            emit!(out, "  }}");
        } else {
            let m = &slot.members[0].0;
            emit!(out, "  else if (format == KDS_FORMAT_ROW)");
            emit!(out, "  {{");
            emit!(out, "    off = TYPEALIGN({}, off);", slot.dtype.attalign());
            emit!(out, "    pg_{t}_store(buf + off, v->{m});");
            emit!(out, "    off += {};", slot.dtype.attlen());
            emit!(out, "    tuple_set_notnull(buf, {j});");
            emit!(out, "  }}");
            emit!(out, "  else");
            emit!(out, "  {{");
            emit!(out, "    values[{j}] = pg_{t}_to_datum(v->{m});");
            emit!(out, "    isnull[{j}] = false;");
            emit!(out, "  }}");
        }
    }
    emit!(out, "  if (format == KDS_FORMAT_ROW)");
    emit!(out, "    tuple_finish(buf, off);");
    emit!(out, "  return MAXALIGN(off);");
    emit!(out, "}}");

    let computed_varlena = slots
        .iter()
        .filter(|s| !matches!(s.value, SlotValue::Plain))
        .count();
    Ok(ProjectionCode {
        source: out,
        fixed_width: TupleLayout::new(slots.iter().map(|s| s.dtype)).fixed_width(),
        extra_width: typealign(8, COMPUTED_VARLENA_WIDTH * computed_varlena),
    })
}

// ── Kernel program ──────────────────────────────────────────────────────────

/// Device projection of a program.
#[derive(Debug, Clone)]
pub struct ProjectionProgram {
    /// Output expressions over the input columns, parameters bound to slots.
    pub targets: Vec<Expr>,
    pub layout: TupleLayout,
    pub fixed_width: usize,
    pub extra_width: usize,
}

/// A generated scan program. Immutable once built.
#[derive(Debug, Clone)]
pub struct KernelProgram {
    source: String,
    params: Vec<ParamSource>,
    columns: Vec<usize>,
    extra_flags: ExtraFlags,
    signature: u64,
    input: SchemaRef,
    quals: Vec<Expr>,
    projection: Option<ProjectionProgram>,
}

impl KernelProgram {
    /// The generated part of the program.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Generated code with the library modules it needs, ready to compile.
    pub fn full_source(&self) -> String {
        assemble(&self.source, self.extra_flags)
    }

    pub fn params(&self) -> &[ParamSource] {
        &self.params
    }

    pub fn param_types(&self) -> Vec<DataType> {
        self.params.iter().map(ParamSource::dtype).collect()
    }

    pub fn columns(&self) -> &[usize] {
        &self.columns
    }

    pub fn extra_flags(&self) -> ExtraFlags {
        self.extra_flags
    }

    pub fn signature(&self) -> u64 {
        self.signature
    }

    pub fn input_schema(&self) -> &SchemaRef {
        &self.input
    }

    pub fn has_quals(&self) -> bool {
        !self.quals.is_empty()
    }

    /// Device quals with parameters bound to slots.
    pub fn quals(&self) -> &[Expr] {
        &self.quals
    }

    pub fn projection(&self) -> Option<&ProjectionProgram> {
        self.projection.as_ref()
    }

    /// Values for every parameter slot, taking bound values from `bound`.
    pub fn resolve_params(&self, bound: &[Datum]) -> Result<Vec<(Datum, DataType)>> {
        self.params
            .iter()
            .map(|p| match p {
                ParamSource::Const { value, dtype } => Ok((value.clone(), *dtype)),
                ParamSource::Bound { id, dtype } => {
                    let value = bound.get(*id).ok_or(EvalError::UnboundParam(*id))?;
                    if !value.is_null() && !value.conforms_to(*dtype) {
                        return Err(ScanError::Plan(format!("${id} is bound to {value}, expected {dtype}")));
                    }
                    Ok((value.clone(), *dtype))
                }
            })
            .collect()
    }
}

fn assemble(generated: &str, flags: ExtraFlags) -> String {
    let mut out = String::with_capacity(COMMON_LIB.len() + GPUSCAN_LIB.len() + generated.len() + 4096);
    out.push_str(COMMON_LIB);
    if flags.contains(ExtraFlags::TEXTLIB) {
        out.push_str(TEXT_LIB);
    }
    if flags.contains(ExtraFlags::MATHLIB) {
        out.push_str(MATH_LIB);
    }
    out.push_str(generated);
    out.push_str(GPUSCAN_LIB);
    out
}

/// Signature used as the program cache key.
pub fn program_signature(full_source: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    full_source.hash(&mut hasher);
    hasher.finish()
}

/// Turns device quals and projection targets into a [`KernelProgram`].
pub struct KernelSourceBuilder<'a> {
    transpiler: &'a dyn ExprTranspiler,
}

impl<'a> KernelSourceBuilder<'a> {
    pub fn new(transpiler: &'a dyn ExprTranspiler) -> Self {
        Self { transpiler }
    }

    /// `quals` and `projection` are expressed over `input`. `None` means
    /// the scan returns source rows unchanged.
    pub fn build(&self, input: &SchemaRef, quals: &[Expr], projection: Option<&[Expr]>) -> Result<KernelProgram> {
        for expr in quals.iter().chain(projection.unwrap_or_default()) {
            for column in expr.columns() {
                if column >= input.len() {
                    return Err(ScanError::Plan(format!(
                        "column {column} is out of range for a {}-column input",
                        input.len()
                    )));
                }
            }
        }

        let mut ctx = CodegenContext::default();
        ctx.require(ExtraFlags::GPUSCAN);

        let mut source = String::new();
        emit!(source, "/* ------ generated by gpuscan ------ */");
        emit!(source, "#define GPUSCAN_HAS_QUALS {}", !quals.is_empty() as u8);
        emit!(source, "#define GPUSCAN_HAS_PROJECTION {}", projection.is_some() as u8);
        emit!(source);
        if !quals.is_empty() {
            source.push_str(&self.transpiler.emit_predicate_code(quals, &mut ctx)?);
            emit!(source);
        }
        let projection = match projection {
            Some(targets) => {
                let code = self.transpiler.emit_projection_code(targets, &mut ctx)?;
                source.push_str(&code.source);
                emit!(source);
                Some(ProjectionProgram {
                    targets: targets.iter().map(|t| ctx.bind_slots(t)).collect(),
                    layout: TupleLayout::new(targets.iter().map(Expr::data_type)),
                    fixed_width: code.fixed_width,
                    extra_width: code.extra_width,
                })
            }
            None => None,
        };
        let quals: Vec<Expr> = quals.iter().map(|q| ctx.bind_slots(q)).collect();

        let extra_flags = ctx.extra_flags();
        let signature = program_signature(&assemble(&source, extra_flags));
        Ok(KernelProgram {
            source,
            params: ctx.params,
            columns: ctx.columns.into_iter().collect(),
            extra_flags,
            signature,
            input: input.clone(),
            quals,
            projection,
        })
    }
}
