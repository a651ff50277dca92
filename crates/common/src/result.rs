//! Row and schema types returned by backends.

use crate::request::BackendId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Type of a column that carried no typed value, e.g. an empty or all-null result.
    Null,
    Bool,
    Int,
    Float,
    Text,
    Bytes,
}

impl DataType {
    /// Two column types can be merged if they are equal or one of them is untyped.
    pub fn is_compatible(&self, other: &DataType) -> bool {
        self == other || *self == DataType::Null || *other == DataType::Null
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Null => DataType::Null,
            Value::Bool(_) => DataType::Bool,
            Value::Int(_) => DataType::Int,
            Value::Float(_) => DataType::Float,
            Value::Text(_) => DataType::Text,
            Value::Bytes(_) => DataType::Bytes,
        }
    }
}

pub type Row = Vec<Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

/// Ordered field descriptor of a result set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Describes the first structural difference with `other`, if any.
    ///
    /// Schemas match when they have the same field count and compatible types
    /// position by position. Field names are not compared.
    pub fn mismatch(&self, other: &Schema) -> Option<String> {
        if self.len() != other.len() {
            return Some(format!(
                "field count differs: {} vs {}",
                self.len(),
                other.len()
            ));
        }
        self.fields
            .iter()
            .zip(other.fields.iter())
            .enumerate()
            .find(|(_, (a, b))| !a.data_type.is_compatible(&b.data_type))
            .map(|(position, (a, b))| {
                format!(
                    "field {} ({}) has type {:?} vs {:?}",
                    position, a.name, a.data_type, b.data_type
                )
            })
    }
}

/// Result of one backend invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub schema: Schema,
    pub rows: Vec<Row>,
    /// Rows changed by a DML statement. Zero for queries.
    pub rows_affected: u64,
}

impl QueryResult {
    pub fn new(schema: Schema, rows: Vec<Row>) -> Self {
        Self {
            schema,
            rows,
            rows_affected: 0,
        }
    }

    /// Result of a statement that returns no rows.
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            schema: Schema::empty(),
            rows: Vec::new(),
            rows_affected,
        }
    }
}

/// Merged result of every backend touched by one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateResult {
    pub schema: Schema,
    pub rows: Vec<Row>,
    pub rows_affected: u64,
    /// Contributing backends, in fragment order.
    pub sources: Vec<BackendId>,
}
