//! Out-of-order (O3) commit engine
//!
//! ```text
//!  RowBatch ──► sort_permutation ──► analyze ──► CommitPlan
//!                                                  │
//!                 ┌────────────────────────────────┤ per partition
//!                 ▼                                ▼
//!          Append (writer, in place)     Merge / Create: PartitionJob
//!                                                  │ one CopyTask per column
//!                                                  ▼
//!                                     O3Engine worker pool
//!                                                  │ column counter → partition counter
//!                                                  ▼
//!                                      CompletionSignal ──► writer publishes
//! ```

pub mod analyze;
pub mod engine;
pub mod merge_index;
pub mod progress;
pub mod task;

pub use analyze::{analyze, CommitClass, CommitPlan, PartitionAction, PartitionPlan, PartitionSource};
pub use engine::O3Engine;
pub use merge_index::{sort_permutation, MergeEntry, MergeIndex, MergeSource};
pub use progress::{CommitProgress, CompletionSignal, PartitionProgress};
pub use task::{CopyBlock, CopyTask, OooColumnData, PartitionJob};
