//! Planning a scan: which quals and targets run on the device.
//!
//! # Design
//! Quals are split one by one with [`ExprTranspiler::is_device_capable`].
//! Rows move through two stages:
//!
//! 1. device stage: the device quals over source rows, then the scan target
//!    list when there is a device projection
//! 2. host stage: the host quals and the final target list over the rows
//!    the device stage produced
//!
//! Both stages can run on the host, which is how host-only scans, CPU
//! rechecks and lost devices produce the same rows as the device would.
//!
//! The scan target list holds bare columns (copied whatever their type),
//! device-capable computed targets, and every column a host-side qual or
//! target needs. It is only built when the requested targets differ from
//! the input columns.

use std::sync::Arc;

use crate::chunk::layout::{maxalign, TupleLayout};
use crate::chunk::{head_length, slot_area_length, Chunk, ChunkFormat};
use crate::error::{Result, ScanError};
use crate::gpu::codegen::{KernelProgram, KernelSourceBuilder};
use crate::scan::ScanVariant;
use crate::transpiler::eval::{eval, eval_quals};
use crate::transpiler::{Expr, ExprTranspiler};
use crate::types::{DataType, Datum, Field, Row, Schema, SchemaRef};

/// Row widths used to size destination chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanWidths {
    /// Fixed part of one source tuple.
    pub base_fixed_width: usize,
    /// Fixed part of one projected tuple.
    pub proj_fixed_width: usize,
    /// Estimated variable-length bytes of computed columns per projected row.
    pub proj_extra_width: usize,
}

#[derive(Debug, Clone)]
pub struct DeviceProjection {
    /// Targets the device computes, over the input columns.
    pub scan_tlist: Vec<Expr>,
    pub scan_schema: SchemaRef,
    /// Requested targets over the scan target list.
    pub final_tlist: Vec<Expr>,
}

#[derive(Debug, Clone)]
pub struct ScanPlan {
    input: SchemaRef,
    output: SchemaRef,
    device_quals: Vec<Expr>,
    /// Over the device stage output.
    host_quals: Vec<Expr>,
    projection: Option<DeviceProjection>,
    program: Arc<KernelProgram>,
    widths: ScanWidths,
    variant: ScanVariant,
}

fn field_for(expr: &Expr, schema: &Schema) -> Field {
    match expr {
        Expr::Column { index, .. } => match schema.field(*index) {
            Some(f) => f.clone(),
            None => Field::new(format!("#{index}"), expr.data_type()),
        },
        _ => Field::new(expr.display(schema).to_string(), expr.data_type()),
    }
}

fn position_of(list: &[Expr], expr: &Expr) -> Option<usize> {
    list.iter().position(|e| e == expr)
}

fn push_unique(list: &mut Vec<Expr>, expr: Expr) -> usize {
    match position_of(list, &expr) {
        Some(i) => i,
        None => {
            list.push(expr);
            list.len() - 1
        }
    }
}

impl ScanPlan {
    /// Plan a scan of `input` returning `targets` (`None`: every input column)
    /// for rows passing every one of `quals`.
    pub fn new(
        input: SchemaRef,
        quals: Vec<Expr>,
        targets: Option<Vec<Expr>>,
        transpiler: &dyn ExprTranspiler,
    ) -> Result<Self> {
        for expr in quals.iter().chain(targets.iter().flatten()) {
            if let Some(column) = expr.columns().into_iter().find(|c| *c >= input.len()) {
                return Err(ScanError::Plan(format!(
                    "column {column} is out of range for a {}-column input",
                    input.len()
                )));
            }
        }
        if let Some(q) = quals.iter().find(|q| q.data_type() != DataType::Bool) {
            return Err(ScanError::Plan(format!("qual {} is not boolean", q.display(&input))));
        }

        let (device_quals, host_quals): (Vec<Expr>, Vec<Expr>) =
            quals.into_iter().partition(|q| transpiler.is_device_capable(q));

        let identity = targets.as_ref().map_or(true, |t| {
            t.len() == input.len()
                && t.iter()
                    .enumerate()
                    .all(|(i, e)| matches!(e, Expr::Column { index, .. } if *index == i))
        });

        let (projection, host_quals) = if identity {
            (None, host_quals)
        } else {
            let targets = targets.unwrap_or_default();
            let mut scan_tlist = Vec::new();
            for t in &targets {
                if matches!(t, Expr::Column { .. }) || transpiler.is_device_capable(t) {
                    push_unique(&mut scan_tlist, t.clone());
                } else {
                    for c in t.columns() {
                        push_unique(&mut scan_tlist, Expr::col(c, input.fields()[c].dtype));
                    }
                }
            }
            for q in &host_quals {
                for c in q.columns() {
                    push_unique(&mut scan_tlist, Expr::col(c, input.fields()[c].dtype));
                }
            }

            let over_scan = |e: &Expr| -> Result<Expr> {
                let scan_tlist = &scan_tlist;
                e.remap_columns(&|c| position_of(scan_tlist, &Expr::col(c, input.fields()[c].dtype)))
                    .ok_or_else(|| ScanError::Plan(format!("{} is not covered by the scan targets", e.display(&input))))
            };
            let final_tlist = targets
                .iter()
                .map(|t| match position_of(&scan_tlist, t) {
                    Some(i) => Ok(Expr::col(i, t.data_type())),
                    None => over_scan(t),
                })
                .collect::<Result<Vec<_>>>()?;
            let host_quals = host_quals.iter().map(over_scan).collect::<Result<Vec<_>>>()?;
            let scan_schema = Arc::new(Schema::new(scan_tlist.iter().map(|e| field_for(e, &input)).collect()));
            (
                Some(DeviceProjection {
                    scan_tlist,
                    scan_schema,
                    final_tlist,
                }),
                host_quals,
            )
        };

        let output = match &projection {
            Some(p) => {
                let fields = p
                    .final_tlist
                    .iter()
                    .map(|e| field_for(e, &p.scan_schema))
                    .collect();
                Arc::new(Schema::new(fields))
            }
            None => input.clone(),
        };

        let program = KernelSourceBuilder::new(transpiler).build(
            &input,
            &device_quals,
            projection.as_ref().map(|p| p.scan_tlist.as_slice()),
        )?;
        let widths = ScanWidths {
            base_fixed_width: TupleLayout::new(input.types()).fixed_width(),
            proj_fixed_width: program.projection().map_or(0, |p| p.fixed_width),
            proj_extra_width: program.projection().map_or(0, |p| p.extra_width),
        };

        Ok(Self {
            input,
            output,
            device_quals,
            host_quals,
            projection,
            program: Arc::new(program),
            widths,
            variant: ScanVariant::GpuScan,
        })
    }

    pub fn with_variant(mut self, variant: ScanVariant) -> Self {
        self.variant = variant;
        self
    }

    pub fn variant(&self) -> ScanVariant {
        self.variant
    }

    pub fn input_schema(&self) -> &SchemaRef {
        &self.input
    }

    /// Schema of the rows the scan returns.
    pub fn output_schema(&self) -> &SchemaRef {
        &self.output
    }

    /// Schema of the rows the device stage produces.
    pub fn scan_schema(&self) -> &SchemaRef {
        self.projection.as_ref().map_or(&self.input, |p| &p.scan_schema)
    }

    pub fn device_quals(&self) -> &[Expr] {
        &self.device_quals
    }

    pub fn host_quals(&self) -> &[Expr] {
        &self.host_quals
    }

    pub fn projection(&self) -> Option<&DeviceProjection> {
        self.projection.as_ref()
    }

    pub fn program(&self) -> &Arc<KernelProgram> {
        &self.program
    }

    pub fn widths(&self) -> ScanWidths {
        self.widths
    }

    /// Destination image length for `src`, or `None` without a device
    /// projection. `growth` scales the variable part after the device ran
    /// out of destination space.
    pub fn dst_length(&self, src: &Chunk, format: ChunkFormat, growth: usize) -> Option<usize> {
        let projection = self.program.projection()?;
        let ncols = projection.layout.natts();
        let nitems = src.nitems();
        let w = self.widths;
        let length = match format {
            ChunkFormat::Row => {
                let widening = w.proj_fixed_width.saturating_sub(w.base_fixed_width) * nitems;
                let body = src.usage() + widening + w.proj_extra_width * nitems;
                head_length(ncols) + maxalign(4 * nitems) + maxalign(body * growth.max(1))
            }
            ChunkFormat::Slot => {
                let body = src.usage() + w.proj_extra_width * nitems;
                slot_area_length(ncols, nitems) + maxalign(body * growth.max(1))
            }
        };
        Some(length)
    }

    /// Device stage on the host: the device quals over a source row, then
    /// the scan target list.
    pub fn device_stage(&self, row: &Row, params: &[Datum]) -> Result<Option<Row>> {
        if !eval_quals(&self.device_quals, row, params)? {
            return Ok(None);
        }
        match &self.projection {
            Some(p) => Ok(Some(
                p.scan_tlist
                    .iter()
                    .map(|e| eval(e, row, params))
                    .collect::<Result<Row, _>>()?,
            )),
            None => Ok(Some(row.clone())),
        }
    }

    /// Host quals and the final targets over a device stage row.
    pub fn host_stage(&self, row: Row, params: &[Datum]) -> Result<Option<Row>> {
        if !eval_quals(&self.host_quals, &row, params)? {
            return Ok(None);
        }
        match &self.projection {
            Some(p) => Ok(Some(
                p.final_tlist
                    .iter()
                    .map(|e| eval(e, &row, params))
                    .collect::<Result<Row, _>>()?,
            )),
            None => Ok(Some(row)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transpiler::{ArithOp, CompareOp, CudaTranspiler, ScalarFunc};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64),
            Field::new("name", DataType::Text),
            Field::new("doc", DataType::Json),
        ]))
    }

    fn id() -> Expr {
        Expr::col(0, DataType::Int64)
    }

    fn doc_present() -> Expr {
        Expr::is_not_null(Expr::col(2, DataType::Json))
    }

    #[test]
    fn quals_are_split_by_capability() {
        let q1 = Expr::compare(CompareOp::Gt, id(), Expr::lit(Datum::Int64(3)));
        let plan = ScanPlan::new(schema(), vec![q1.clone(), doc_present()], None, &CudaTranspiler).unwrap();
        assert_eq!(plan.device_quals(), &[q1]);
        assert_eq!(plan.host_quals(), &[doc_present()]);
        assert!(plan.projection().is_none());
        assert!(plan.program().has_quals());
        assert_eq!(plan.output_schema().len(), 3);
    }

    #[test]
    fn identity_targets_need_no_projection() {
        let targets = vec![
            Expr::col(0, DataType::Int64),
            Expr::col(1, DataType::Text),
            Expr::col(2, DataType::Json),
        ];
        let plan = ScanPlan::new(schema(), vec![], Some(targets), &CudaTranspiler).unwrap();
        assert!(plan.projection().is_none());
        assert!(plan.program().projection().is_none());
    }

    #[test]
    fn scan_targets_cover_host_side_needs() {
        let doubled = Expr::arith(ArithOp::Mul, id(), Expr::lit(Datum::Int64(2)));
        // A function over a computed argument cannot run on the device.
        let host_target = Expr::func(
            ScalarFunc::Upper,
            vec![Expr::func(ScalarFunc::Lower, vec![Expr::col(1, DataType::Text)])],
        );
        let plan = ScanPlan::new(
            schema(),
            vec![doc_present()],
            Some(vec![doubled.clone(), host_target]),
            &CudaTranspiler,
        )
        .unwrap();
        let p = plan.projection().unwrap();
        assert_eq!(
            p.scan_tlist,
            vec![doubled, Expr::col(1, DataType::Text), Expr::col(2, DataType::Json)]
        );
        assert_eq!(p.final_tlist[0], Expr::col(0, DataType::Int64));
        assert_eq!(plan.host_quals(), &[Expr::is_not_null(Expr::col(2, DataType::Json))]);
        assert_eq!(plan.output_schema().fields()[0].dtype, DataType::Int64);
        assert_eq!(plan.output_schema().fields()[1].dtype, DataType::Text);
    }

    #[test]
    fn stages_on_the_host_match_the_request() {
        let doubled = Expr::arith(ArithOp::Mul, id(), Expr::lit(Datum::Int64(2)));
        let q = Expr::compare(CompareOp::Lt, id(), Expr::param(0, DataType::Int64));
        let plan = ScanPlan::new(schema(), vec![q, doc_present()], Some(vec![doubled]), &CudaTranspiler).unwrap();
        let params = [Datum::Int64(10)];
        let row = vec![Datum::Int64(4), Datum::Text("a".into()), Datum::Json("{}".into())];
        let mid = plan.device_stage(&row, &params).unwrap().unwrap();
        assert_eq!(plan.host_stage(mid, &params).unwrap(), Some(vec![Datum::Int64(8)]));

        let no_doc = vec![Datum::Int64(4), Datum::Text("a".into()), Datum::Null];
        let mid = plan.device_stage(&no_doc, &params).unwrap().unwrap();
        assert_eq!(plan.host_stage(mid, &params).unwrap(), None);

        let too_big = vec![Datum::Int64(40), Datum::Null, Datum::Null];
        assert_eq!(plan.device_stage(&too_big, &params).unwrap(), None);
    }

    #[test]
    fn bad_plans_are_rejected() {
        let out_of_range = Expr::is_null(Expr::col(9, DataType::Int64));
        assert!(ScanPlan::new(schema(), vec![out_of_range], None, &CudaTranspiler).is_err());
        assert!(ScanPlan::new(schema(), vec![id()], None, &CudaTranspiler).is_err());
    }

    #[test]
    fn destination_grows_with_the_factor() {
        let upper = Expr::func(ScalarFunc::Upper, vec![Expr::col(1, DataType::Text)]);
        let plan = ScanPlan::new(schema(), vec![], Some(vec![id(), upper]), &CudaTranspiler).unwrap();
        let rows: Vec<Row> = (0..10)
            .map(|i| vec![Datum::Int64(i), Datum::Text(format!("row {i}")), Datum::Null])
            .collect();
        let chunk = Chunk::from_rows(schema(), &rows).unwrap();
        for format in [ChunkFormat::Row, ChunkFormat::Slot] {
            let one = plan.dst_length(&chunk, format, 1).unwrap();
            let two = plan.dst_length(&chunk, format, 2).unwrap();
            assert!(two > one);
        }
        let plain = ScanPlan::new(schema(), vec![], None, &CudaTranspiler).unwrap();
        assert!(plain.dst_length(&chunk, ChunkFormat::Row, 1).is_none());
    }
}
