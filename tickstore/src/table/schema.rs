//! Table schema and metadata (`_meta.json`)

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::txn::{read_json, write_json_atomic};
use crate::storage::PartitionBy;
use crate::{Result, StoreError};

pub const META_FILE: &str = "_meta.json";

/// Column data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Byte,
    Short,
    Int,
    /// 4-byte key into a symbol table; indexable
    Symbol,
    Long,
    Double,
    /// Microseconds since the Unix epoch
    Timestamp,
    String,
    Binary,
}

impl ColumnType {
    /// Record width, or `None` for variable-length types
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            ColumnType::Byte => Some(1),
            ColumnType::Short => Some(2),
            ColumnType::Int | ColumnType::Symbol => Some(4),
            ColumnType::Long | ColumnType::Double | ColumnType::Timestamp => Some(8),
            ColumnType::String | ColumnType::Binary => None,
        }
    }

    #[inline]
    pub fn is_var(self) -> bool {
        self.fixed_width().is_none()
    }

    /// Types a key index can be built over
    pub fn is_indexable(self) -> bool {
        matches!(
            self,
            ColumnType::Int | ColumnType::Symbol | ColumnType::Long | ColumnType::Timestamp
        )
    }
}

/// Column definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    #[serde(default)]
    pub indexed: bool,
    /// Expected distinct keys; sizes the index bucket table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distinct_hint: Option<u64>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            indexed: false,
            distinct_hint: None,
        }
    }

    /// Maintain a key index sized for `distinct_hint` keys
    pub fn with_index(mut self, distinct_hint: u64) -> Self {
        self.indexed = true;
        self.distinct_hint = Some(distinct_hint);
        self
    }

    /// Records of a fixed column, payload of a variable one
    pub fn data_file(&self) -> String {
        format!("{}.d", self.name)
    }

    /// Offset file of a variable-length column
    pub fn offsets_file(&self) -> String {
        format!("{}.i", self.name)
    }

    pub fn index_file(&self) -> String {
        format!("{}.k", self.name)
    }
}

/// Table metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    pub columns: Vec<ColumnDef>,
    /// Name of the designated timestamp column
    pub timestamp: String,
    pub partition_by: PartitionBy,
}

impl TableMeta {
    pub fn new(columns: Vec<ColumnDef>, timestamp: impl Into<String>, partition_by: PartitionBy) -> Self {
        Self {
            columns,
            timestamp: timestamp.into(),
            partition_by,
        }
    }

    pub fn column(&self, name: &str) -> Result<&ColumnDef> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| StoreError::ColumnNotFound(name.to_string()))
    }

    pub fn timestamp_column(&self) -> Result<&ColumnDef> {
        self.column(&self.timestamp)
    }

    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(StoreError::SchemaMismatch("table has no columns".into()));
        }
        let mut seen = HashSet::new();
        for column in &self.columns {
            let valid_name = !column.name.is_empty()
                && column
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if !valid_name {
                return Err(StoreError::SchemaMismatch(format!("invalid column name '{}'", column.name)));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(StoreError::SchemaMismatch(format!("duplicate column '{}'", column.name)));
            }
            if column.indexed && !column.column_type.is_indexable() {
                return Err(StoreError::SchemaMismatch(format!(
                    "column '{}' of type {:?} cannot be indexed",
                    column.name, column.column_type
                )));
            }
        }
        let ts = self.timestamp_column()?;
        if ts.column_type != ColumnType::Timestamp {
            return Err(StoreError::SchemaMismatch(format!(
                "designated timestamp '{}' has type {:?}",
                ts.name, ts.column_type
            )));
        }
        Ok(())
    }

    pub fn load(table_dir: &Path) -> Result<Self> {
        let meta: TableMeta = read_json(&table_dir.join(META_FILE))?;
        meta.validate()?;
        Ok(meta)
    }

    pub fn save(&self, table_dir: &Path) -> Result<()> {
        write_json_atomic(&table_dir.join(META_FILE), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn trades() -> TableMeta {
        TableMeta::new(
            vec![
                ColumnDef::new("ts", ColumnType::Timestamp),
                ColumnDef::new("sym", ColumnType::Symbol).with_index(64),
                ColumnDef::new("price", ColumnType::Double),
                ColumnDef::new("venue", ColumnType::String),
            ],
            "ts",
            PartitionBy::Day,
        )
    }

    #[test]
    fn test_widths_and_files() {
        assert_eq!(ColumnType::Symbol.fixed_width(), Some(4));
        assert_eq!(ColumnType::Timestamp.fixed_width(), Some(8));
        assert!(ColumnType::Binary.is_var());
        let col = ColumnDef::new("venue", ColumnType::String);
        assert_eq!(col.data_file(), "venue.d");
        assert_eq!(col.offsets_file(), "venue.i");
        assert_eq!(col.index_file(), "venue.k");
    }

    #[test]
    fn test_validate() {
        trades().validate().unwrap();

        let mut meta = trades();
        meta.timestamp = "price".into();
        assert!(matches!(meta.validate(), Err(StoreError::SchemaMismatch(_))));

        let mut meta = trades();
        meta.timestamp = "missing".into();
        assert!(matches!(meta.validate(), Err(StoreError::ColumnNotFound(_))));

        let mut meta = trades();
        meta.columns.push(ColumnDef::new("price", ColumnType::Long));
        assert!(meta.validate().is_err());

        let mut meta = trades();
        meta.columns.push(ColumnDef::new("note", ColumnType::String).with_index(4));
        assert!(meta.validate().is_err());

        let mut meta = trades();
        meta.columns.push(ColumnDef::new("../x", ColumnType::Long));
        assert!(meta.validate().is_err());
    }

    #[test]
    fn test_save_load() {
        let dir = tempdir().unwrap();
        let meta = trades();
        meta.save(dir.path()).unwrap();
        assert_eq!(TableMeta::load(dir.path()).unwrap(), meta);
    }
}
