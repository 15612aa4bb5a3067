//! Arrow interop: read chunks from `RecordBatch`es and hand results back as one.

use std::sync::Arc;

use datafusion::arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float32Array, Float64Array, Int16Array, Int32Array,
    Int64Array, LargeStringArray, StringArray,
};
use datafusion::arrow::datatypes::{DataType as ArrowType, Field as ArrowField, Schema as ArrowSchema};
use datafusion::arrow::record_batch::RecordBatch;

use crate::chunk::{ChunkBudget, ChunkBuilder, ChunkCursor, ChunkRead, ChunkStore};
use crate::error::{Result, ScanError};
use crate::types::{DataType, Datum, Field, Row, Schema, SchemaRef};

pub fn from_arrow_type(t: &ArrowType) -> Option<DataType> {
    Some(match t {
        ArrowType::Boolean => DataType::Bool,
        ArrowType::Int16 => DataType::Int16,
        ArrowType::Int32 => DataType::Int32,
        ArrowType::Int64 => DataType::Int64,
        ArrowType::Float32 => DataType::Float32,
        ArrowType::Float64 => DataType::Float64,
        ArrowType::Date32 => DataType::Date,
        ArrowType::Utf8 | ArrowType::LargeUtf8 => DataType::Text,
        _ => return None,
    })
}

pub fn to_arrow_type(t: DataType) -> ArrowType {
    match t {
        DataType::Bool => ArrowType::Boolean,
        DataType::Int16 => ArrowType::Int16,
        DataType::Int32 => ArrowType::Int32,
        DataType::Int64 => ArrowType::Int64,
        DataType::Float32 => ArrowType::Float32,
        DataType::Float64 => ArrowType::Float64,
        DataType::Date => ArrowType::Date32,
        DataType::Text | DataType::Json => ArrowType::Utf8,
    }
}

pub fn schema_from_arrow(schema: &ArrowSchema) -> Result<Schema> {
    let fields = schema
        .fields()
        .iter()
        .map(|f| {
            from_arrow_type(f.data_type())
                .map(|t| Field::new(f.name().clone(), t))
                .ok_or_else(|| {
                    ScanError::Storage(format!(
                        "column {} has unsupported type {}",
                        f.name(),
                        f.data_type()
                    ))
                })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Schema::new(fields))
}

pub fn schema_to_arrow(schema: &Schema) -> ArrowSchema {
    ArrowSchema::new(
        schema
            .fields()
            .iter()
            .map(|f| ArrowField::new(f.name.clone(), to_arrow_type(f.dtype), true))
            .collect::<Vec<_>>(),
    )
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef) -> Result<&'a T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| ScanError::Storage(format!("unexpected array type {}", array.data_type())))
}

fn datum_at(array: &ArrayRef, row: usize) -> Result<Datum> {
    if array.is_null(row) {
        return Ok(Datum::Null);
    }
    Ok(match array.data_type() {
        ArrowType::Boolean => Datum::Bool(downcast::<BooleanArray>(array)?.value(row)),
        ArrowType::Int16 => Datum::Int16(downcast::<Int16Array>(array)?.value(row)),
        ArrowType::Int32 => Datum::Int32(downcast::<Int32Array>(array)?.value(row)),
        ArrowType::Int64 => Datum::Int64(downcast::<Int64Array>(array)?.value(row)),
        ArrowType::Float32 => Datum::Float32(downcast::<Float32Array>(array)?.value(row)),
        ArrowType::Float64 => Datum::Float64(downcast::<Float64Array>(array)?.value(row)),
        ArrowType::Date32 => Datum::Date(downcast::<Date32Array>(array)?.value(row)),
        ArrowType::Utf8 => Datum::Text(downcast::<StringArray>(array)?.value(row).to_owned()),
        ArrowType::LargeUtf8 => Datum::Text(downcast::<LargeStringArray>(array)?.value(row).to_owned()),
        other => return Err(ScanError::Storage(format!("unsupported array type {other}"))),
    })
}

/// Chunk store over a list of record batches; the cursor is a global row number.
pub struct RecordBatchChunkStore {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
    /// Global row number at which each batch starts.
    starts: Vec<usize>,
    total_rows: usize,
}

impl RecordBatchChunkStore {
    pub fn try_new(batches: Vec<RecordBatch>) -> Result<Self> {
        let Some(first) = batches.first() else {
            return Err(ScanError::Storage("no record batches given".into()));
        };
        let schema = Arc::new(schema_from_arrow(first.schema().as_ref())?);
        let mut starts = Vec::with_capacity(batches.len());
        let mut total_rows = 0;
        for batch in &batches {
            if batch.num_columns() != schema.len() {
                return Err(ScanError::Storage("record batches disagree on column count".into()));
            }
            starts.push(total_rows);
            total_rows += batch.num_rows();
        }
        Ok(Self {
            schema,
            batches,
            starts,
            total_rows,
        })
    }

    fn locate(&self, pos: usize) -> Option<(usize, usize)> {
        let batch = self.starts.partition_point(|&s| s <= pos).checked_sub(1)?;
        let offset = pos - self.starts[batch];
        (offset < self.batches[batch].num_rows()).then_some((batch, offset))
    }

    fn row_at(&self, batch: usize, offset: usize) -> Result<Row> {
        self.batches[batch]
            .columns()
            .iter()
            .map(|col| datum_at(col, offset))
            .collect()
    }
}

impl ChunkStore for RecordBatchChunkStore {
    fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    fn read_chunk(&mut self, cursor: ChunkCursor, budget: ChunkBudget) -> Result<ChunkRead> {
        let mut builder = ChunkBuilder::new(self.schema.clone(), budget);
        let mut pos = cursor.0 as usize;
        while pos < self.total_rows {
            // Empty batches leave holes in `starts`; skip them.
            let Some((batch, offset)) = self.locate(pos) else {
                pos += 1;
                continue;
            };
            if !builder.try_push(&self.row_at(batch, offset)?)? {
                break;
            }
            pos += 1;
        }
        Ok(ChunkRead {
            chunk: builder.finish()?,
            cursor: ChunkCursor(pos as u64),
            end_of_input: pos >= self.total_rows,
        })
    }
}

/// Materialize rows as one record batch with nullable columns.
pub fn rows_to_record_batch(schema: &Schema, rows: &[Row]) -> Result<RecordBatch> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.len());
    for (j, field) in schema.fields().iter().enumerate() {
        let cell = |r: &Row| r.get(j).cloned().unwrap_or(Datum::Null);
        let mismatch = |d: &Datum| {
            ScanError::Storage(format!("value {d} in column {} is not {}", field.name, field.dtype))
        };
        macro_rules! collect {
            ($variant:ident, $array:ty) => {{
                let values = rows
                    .iter()
                    .map(|r| match cell(r) {
                        Datum::Null => Ok(None),
                        Datum::$variant(v) => Ok(Some(v)),
                        other => Err(mismatch(&other)),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Arc::new(<$array>::from(values)) as ArrayRef
            }};
        }
        let array = match field.dtype {
            DataType::Bool => collect!(Bool, BooleanArray),
            DataType::Int16 => collect!(Int16, Int16Array),
            DataType::Int32 => collect!(Int32, Int32Array),
            DataType::Int64 => collect!(Int64, Int64Array),
            DataType::Float32 => collect!(Float32, Float32Array),
            DataType::Float64 => collect!(Float64, Float64Array),
            DataType::Date => collect!(Date, Date32Array),
            DataType::Text => collect!(Text, StringArray),
            DataType::Json => collect!(Json, StringArray),
        };
        columns.push(array);
    }
    Ok(RecordBatch::try_new(Arc::new(schema_to_arrow(schema)), columns)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(ids: Vec<Option<i32>>, names: Vec<Option<&str>>) -> RecordBatch {
        let schema = Arc::new(ArrowSchema::new(vec![
            ArrowField::new("id", ArrowType::Int32, true),
            ArrowField::new("name", ArrowType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(ids)) as ArrayRef,
                Arc::new(StringArray::from(names)) as ArrayRef,
            ],
        )
        .unwrap()
    }

    #[test]
    fn chunks_span_batch_boundaries() {
        let mut store = RecordBatchChunkStore::try_new(vec![
            batch(vec![Some(1), None], vec![Some("a"), Some("b")]),
            batch(vec![], vec![]),
            batch(vec![Some(3)], vec![None]),
        ])
        .unwrap();
        let budget = ChunkBudget {
            max_bytes: 1 << 16,
            max_rows: 1000,
        };
        let read = store.read_chunk(ChunkCursor::default(), budget).unwrap();
        assert!(read.end_of_input);
        assert_eq!(
            read.chunk.rows().unwrap(),
            vec![
                vec![Datum::Int32(1), Datum::Text("a".into())],
                vec![Datum::Null, Datum::Text("b".into())],
                vec![Datum::Int32(3), Datum::Null],
            ]
        );
    }

    #[test]
    fn rows_back_to_batch() {
        let schema = Schema::new(vec![
            Field::new("id", DataType::Int32),
            Field::new("name", DataType::Text),
        ]);
        let rows = vec![
            vec![Datum::Int32(1), Datum::Null],
            vec![Datum::Null, Datum::Text("x".into())],
        ];
        let batch = rows_to_record_batch(&schema, &rows).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.column(0).null_count(), 1);
        assert!(rows_to_record_batch(&schema, &[vec![Datum::Text("bad".into()), Datum::Null]]).is_err());
    }
}
