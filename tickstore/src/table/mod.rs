//! Table layer
//!
//! A table is a directory holding `_meta.json`, `_txn.json` and one
//! subdirectory per time partition. [`TableWriter`] drives commits through
//! the O3 engine; [`TableReader`] serves committed partitions.

pub mod batch;
pub mod reader;
pub mod schema;
pub mod txn;
pub mod writer;

pub use batch::{ColumnValues, RowBatch};
pub use reader::{PartitionReader, TableReader};
pub use schema::{ColumnDef, ColumnType, TableMeta};
pub use txn::{PartitionState, TxnState};
pub use writer::{CommitSummary, TableWriter};
