//! Row batches
//!
//! A batch is a set of equally long, typed column vectors. Rows may arrive in
//! any timestamp order; the writer sorts them before analysis.

use super::schema::{ColumnType, TableMeta};
use crate::o3::OooColumnData;
use crate::{Result, StoreError};

/// Values of one column
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValues {
    Byte(Vec<i8>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    Symbol(Vec<i32>),
    Long(Vec<i64>),
    Double(Vec<f64>),
    Timestamp(Vec<i64>),
    Str(Vec<String>),
    Binary(Vec<Vec<u8>>),
}

impl ColumnValues {
    pub fn len(&self) -> usize {
        match self {
            ColumnValues::Byte(v) => v.len(),
            ColumnValues::Short(v) => v.len(),
            ColumnValues::Int(v) | ColumnValues::Symbol(v) => v.len(),
            ColumnValues::Long(v) | ColumnValues::Timestamp(v) => v.len(),
            ColumnValues::Double(v) => v.len(),
            ColumnValues::Str(v) => v.len(),
            ColumnValues::Binary(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            ColumnValues::Byte(_) => ColumnType::Byte,
            ColumnValues::Short(_) => ColumnType::Short,
            ColumnValues::Int(_) => ColumnType::Int,
            ColumnValues::Symbol(_) => ColumnType::Symbol,
            ColumnValues::Long(_) => ColumnType::Long,
            ColumnValues::Double(_) => ColumnType::Double,
            ColumnValues::Timestamp(_) => ColumnType::Timestamp,
            ColumnValues::Str(_) => ColumnType::String,
            ColumnValues::Binary(_) => ColumnType::Binary,
        }
    }

    /// Copy `rows`, in that order, into the on-disk encoding
    pub fn gather(&self, rows: &[usize]) -> OooColumnData {
        macro_rules! packed {
            ($v:expr) => {{
                let mut out = Vec::with_capacity(rows.len() * 8);
                for &row in rows {
                    out.extend_from_slice(&$v[row].to_le_bytes());
                }
                OooColumnData::fixed(out)
            }};
        }

        if rows.is_empty() {
            return OooColumnData::default();
        }
        match self {
            ColumnValues::Byte(v) => packed!(v),
            ColumnValues::Short(v) => packed!(v),
            ColumnValues::Int(v) | ColumnValues::Symbol(v) => packed!(v),
            ColumnValues::Long(v) | ColumnValues::Timestamp(v) => packed!(v),
            ColumnValues::Double(v) => packed!(v),
            ColumnValues::Str(v) => gather_var(rows, |row| v[row].as_bytes()),
            ColumnValues::Binary(v) => gather_var(rows, |row| v[row].as_slice()),
        }
    }
}

fn gather_var<'a, F>(rows: &[usize], value: F) -> OooColumnData
where
    F: Fn(usize) -> &'a [u8],
{
    let mut offsets = Vec::with_capacity(rows.len() * 8);
    let mut payload = Vec::new();
    for &row in rows {
        offsets.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        payload.extend_from_slice(value(row));
    }
    OooColumnData::variable(offsets, payload)
}

/// Named column vectors forming one commit
#[derive(Debug, Clone, Default)]
pub struct RowBatch {
    columns: Vec<(String, ColumnValues)>,
}

impl RowBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column(mut self, name: impl Into<String>, values: ColumnValues) -> Self {
        self.push_column(name, values);
        self
    }

    pub fn push_column(&mut self, name: impl Into<String>, values: ColumnValues) {
        self.columns.push((name.into(), values));
    }

    /// Row count (of the first column; `validate` checks the rest)
    pub fn len(&self) -> usize {
        self.columns.first().map_or(0, |(_, v)| v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column(&self, name: &str) -> Result<&ColumnValues> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .ok_or_else(|| StoreError::ColumnNotFound(name.to_string()))
    }

    /// Designated timestamp values
    pub fn timestamps(&self, meta: &TableMeta) -> Result<&[i64]> {
        match self.column(&meta.timestamp)? {
            ColumnValues::Timestamp(v) => Ok(v),
            other => Err(StoreError::InvalidBatch(format!(
                "timestamp column '{}' holds {:?} values",
                meta.timestamp,
                other.column_type()
            ))),
        }
    }

    /// Check the batch against the table schema: every column present once,
    /// matching types, equal lengths
    pub fn validate(&self, meta: &TableMeta) -> Result<()> {
        let rows = self.len();
        for (name, values) in &self.columns {
            let def = meta
                .column(name)
                .map_err(|_| StoreError::InvalidBatch(format!("column '{}' is not in the table", name)))?;
            if def.column_type != values.column_type() {
                return Err(StoreError::InvalidBatch(format!(
                    "column '{}' expects {:?}, batch has {:?}",
                    name,
                    def.column_type,
                    values.column_type()
                )));
            }
            if values.len() != rows {
                return Err(StoreError::InvalidBatch(format!(
                    "column '{}' has {} rows, expected {}",
                    name,
                    values.len(),
                    rows
                )));
            }
        }
        for def in &meta.columns {
            let count = self.columns.iter().filter(|(n, _)| *n == def.name).count();
            if count != 1 {
                return Err(StoreError::InvalidBatch(format!(
                    "column '{}' supplied {} times",
                    def.name, count
                )));
            }
        }
        Ok(())
    }
}
