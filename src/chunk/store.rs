//! The storage side of a scan: something that hands out filled chunks.

use std::sync::Arc;

use crate::chunk::{Chunk, ChunkBuilder};
use crate::error::{Result, ScanError};
use crate::types::{Row, SchemaRef};

/// Opaque read position. A fresh scan starts from `ChunkCursor::default()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ChunkCursor(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkBudget {
    pub max_bytes: usize,
    pub max_rows: usize,
}

impl ChunkBudget {
    pub fn unbounded() -> Self {
        Self {
            max_bytes: usize::MAX,
            max_rows: usize::MAX,
        }
    }
}

#[derive(Debug)]
pub struct ChunkRead {
    pub chunk: Chunk,
    pub cursor: ChunkCursor,
    /// No rows remain past `cursor`.
    pub end_of_input: bool,
}

/// Source of input chunks.
///
/// A read may return an empty chunk without reaching the end (for example
/// when every row it scanned was invisible); the caller keeps reading.
pub trait ChunkStore: Send {
    fn schema(&self) -> &SchemaRef;

    fn read_chunk(&mut self, cursor: ChunkCursor, budget: ChunkBudget) -> Result<ChunkRead>;
}

/// Rows held in memory, optionally with some of them marked invisible.
#[derive(Debug, Clone)]
pub struct MemoryChunkStore {
    schema: SchemaRef,
    rows: Arc<Vec<Row>>,
    visible: Option<Arc<Vec<bool>>>,
}

impl MemoryChunkStore {
    pub fn new(schema: SchemaRef, rows: Vec<Row>) -> Self {
        Self {
            schema,
            rows: Arc::new(rows),
            visible: None,
        }
    }

    /// Rows whose flag is false are scanned (they count against the row
    /// budget) but never returned.
    pub fn with_visibility(mut self, visible: Vec<bool>) -> Result<Self> {
        if visible.len() != self.rows.len() {
            return Err(ScanError::Storage(format!(
                "visibility map has {} entries for {} rows",
                visible.len(),
                self.rows.len()
            )));
        }
        self.visible = Some(Arc::new(visible));
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn is_visible(&self, pos: usize) -> bool {
        self.visible.as_ref().map_or(true, |v| v[pos])
    }
}

impl ChunkStore for MemoryChunkStore {
    fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    fn read_chunk(&mut self, cursor: ChunkCursor, budget: ChunkBudget) -> Result<ChunkRead> {
        let mut builder = ChunkBuilder::new(self.schema.clone(), budget);
        let mut pos = cursor.0 as usize;
        let mut scanned = 0usize;
        while pos < self.rows.len() && scanned < budget.max_rows {
            if self.is_visible(pos) && !builder.try_push(&self.rows[pos])? {
                break;
            }
            pos += 1;
            scanned += 1;
        }
        Ok(ChunkRead {
            chunk: builder.finish()?,
            cursor: ChunkCursor(pos as u64),
            end_of_input: pos >= self.rows.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, Datum, Field, Schema};

    fn store(n: i64) -> MemoryChunkStore {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64)]));
        MemoryChunkStore::new(schema, (0..n).map(|i| vec![Datum::Int64(i)]).collect())
    }

    #[test]
    fn reads_until_end_of_input() {
        let mut s = store(10);
        let budget = ChunkBudget {
            max_bytes: 1 << 16,
            max_rows: 4,
        };
        let mut cursor = ChunkCursor::default();
        let mut sizes = vec![];
        loop {
            let read = s.read_chunk(cursor, budget).unwrap();
            sizes.push(read.chunk.nitems());
            cursor = read.cursor;
            if read.end_of_input {
                break;
            }
        }
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn empty_store_signals_end_immediately() {
        let read = store(0)
            .read_chunk(ChunkCursor::default(), ChunkBudget::unbounded())
            .unwrap();
        assert!(read.end_of_input);
        assert!(read.chunk.is_empty());
    }

    #[test]
    fn invisible_rows_can_yield_empty_chunks() {
        let mut visible = vec![false; 6];
        visible[5] = true;
        let mut s = store(6).with_visibility(visible).unwrap();
        let budget = ChunkBudget {
            max_bytes: 1 << 16,
            max_rows: 3,
        };
        let first = s.read_chunk(ChunkCursor::default(), budget).unwrap();
        assert!(first.chunk.is_empty());
        assert!(!first.end_of_input);
        let second = s.read_chunk(first.cursor, budget).unwrap();
        assert_eq!(second.chunk.rows().unwrap(), vec![vec![Datum::Int64(5)]]);
        assert!(second.end_of_input);
    }
}
