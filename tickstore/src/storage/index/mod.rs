//! Key index subsystem
//!
//! Maps integer keys (symbol ids, ints, longs) to the row ids carrying them.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ KeyIndex                                 │
//! │  bucket table: (head, tail) per bucket   │
//! ├──────────────────────────────────────────┤
//! │ PagedArena                               │
//! │  [key | row id | next] chained entries   │
//! └──────────────────────────────────────────┘
//! ```

pub mod key_index;

pub use key_index::{IndexCursor, KeyIndex, ENTRY_SIZE};
