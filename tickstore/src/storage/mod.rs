//! Storage module - on-disk column and index primitives
//!
//! Everything the O3 merge engine reads and writes lives here:
//! memory-mapped column files (fixed-width and fix/var pairs), the paged
//! arena and the bucketed key index built on it, the process-wide partition
//! lock registry, and time partitioning rules.

pub mod arena;
pub mod column;
pub mod file;
pub mod header;
pub mod index;
pub mod lock_manager;
pub mod partition;
pub mod var_column;

pub use arena::PagedArena;
pub use column::{edge_insertion_point, BSearchType, FixedColumn, FixedValue};
pub use file::MappedFile;
pub use header::{ColumnHeader, COLUMN_HEADER_SIZE};
pub use index::{IndexCursor, KeyIndex};
pub use lock_manager::{LockManager, LockMode, PartitionLock};
pub use partition::PartitionBy;
pub use var_column::VarColumn;
