//! Scalar types, values and row schemas shared by the host and device paths.

use std::fmt;
use std::sync::Arc;

/// Column type understood by the chunk format.
///
/// `Json` is stored like `Text` but the device path has no operators for it,
/// so predicates touching it stay on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Bool,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    /// Days since 1970-01-01.
    Date,
    Text,
    Json,
}

impl DataType {
    /// Fixed byte width, or -1 for variable-length types.
    pub fn attlen(&self) -> i16 {
        match self {
            DataType::Bool => 1,
            DataType::Int16 => 2,
            DataType::Int32 | DataType::Float32 | DataType::Date => 4,
            DataType::Int64 | DataType::Float64 => 8,
            DataType::Text | DataType::Json => -1,
        }
    }

    /// Alignment of the value inside a row-format tuple.
    pub fn attalign(&self) -> usize {
        match self {
            DataType::Bool => 1,
            DataType::Int16 => 2,
            DataType::Int32 | DataType::Float32 | DataType::Date => 4,
            DataType::Int64 | DataType::Float64 => 8,
            DataType::Text | DataType::Json => 4,
        }
    }

    pub fn is_varlena(&self) -> bool {
        self.attlen() < 0
    }

    pub fn is_numeric(&self) -> bool {
        self.numeric_rank().is_some()
    }

    /// Promotion order for mixed arithmetic and comparison.
    pub(crate) fn numeric_rank(&self) -> Option<u8> {
        match self {
            DataType::Int16 => Some(0),
            DataType::Int32 => Some(1),
            DataType::Int64 => Some(2),
            DataType::Float32 => Some(3),
            DataType::Float64 => Some(4),
            _ => None,
        }
    }

    /// Wider of two numeric types, `None` if either is not numeric.
    pub fn promote(a: DataType, b: DataType) -> Option<DataType> {
        let (ra, rb) = (a.numeric_rank()?, b.numeric_rank()?);
        Some(if ra >= rb { a } else { b })
    }

    /// Tag stored in chunk column descriptors.
    pub(crate) fn type_id(&self) -> u32 {
        match self {
            DataType::Bool => 1,
            DataType::Int16 => 2,
            DataType::Int32 => 3,
            DataType::Int64 => 4,
            DataType::Float32 => 5,
            DataType::Float64 => 6,
            DataType::Date => 7,
            DataType::Text => 8,
            DataType::Json => 9,
        }
    }

    pub(crate) fn from_type_id(id: u32) -> Option<DataType> {
        Some(match id {
            1 => DataType::Bool,
            2 => DataType::Int16,
            3 => DataType::Int32,
            4 => DataType::Int64,
            5 => DataType::Float32,
            6 => DataType::Float64,
            7 => DataType::Date,
            8 => DataType::Text,
            9 => DataType::Json,
            _ => return None,
        })
    }

    /// Type name used in generated device code (`pg_int4_t`, `pgfn_int4_add`, ...).
    pub fn device_name(&self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::Int16 => "int2",
            DataType::Int32 => "int4",
            DataType::Int64 => "int8",
            DataType::Float32 => "float4",
            DataType::Float64 => "float8",
            DataType::Date => "date",
            DataType::Text => "text",
            DataType::Json => "json",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DataType::Bool => "boolean",
            DataType::Int16 => "smallint",
            DataType::Int32 => "integer",
            DataType::Int64 => "bigint",
            DataType::Float32 => "real",
            DataType::Float64 => "double precision",
            DataType::Date => "date",
            DataType::Text => "text",
            DataType::Json => "json",
        })
    }
}

/// A single value. `Null` is untyped; the column or expression type gives it one.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Date(i32),
    Text(String),
    Json(String),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn data_type(&self) -> Option<DataType> {
        Some(match self {
            Datum::Null => return None,
            Datum::Bool(_) => DataType::Bool,
            Datum::Int16(_) => DataType::Int16,
            Datum::Int32(_) => DataType::Int32,
            Datum::Int64(_) => DataType::Int64,
            Datum::Float32(_) => DataType::Float32,
            Datum::Float64(_) => DataType::Float64,
            Datum::Date(_) => DataType::Date,
            Datum::Text(_) => DataType::Text,
            Datum::Json(_) => DataType::Json,
        })
    }

    /// Whether this value can live in a column of type `dtype`.
    pub fn conforms_to(&self, dtype: DataType) -> bool {
        self.data_type().map_or(true, |t| t == dtype)
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => f.write_str("NULL"),
            Datum::Bool(v) => write!(f, "{v}"),
            Datum::Int16(v) => write!(f, "{v}"),
            Datum::Int32(v) => write!(f, "{v}"),
            Datum::Int64(v) => write!(f, "{v}"),
            Datum::Float32(v) => write!(f, "{v}"),
            Datum::Float64(v) => write!(f, "{v}"),
            Datum::Date(v) => write!(f, "date({v})"),
            Datum::Text(v) | Datum::Json(v) => write!(f, "'{}'", v.replace('\'', "''")),
        }
    }
}

/// One row, one datum per column.
pub type Row = Vec<Datum>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub dtype: DataType,
}

impl Field {
    pub fn new(name: impl Into<String>, dtype: DataType) -> Self {
        Self {
            name: name.into(),
            dtype,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schema {
    fields: Vec<Field>,
}

pub type SchemaRef = Arc<Schema>;

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn types(&self) -> impl Iterator<Item = DataType> + '_ {
        self.fields.iter().map(|f| f.dtype)
    }
}
