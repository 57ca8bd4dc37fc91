//! Record models
//!
//! Domain types for the memory store plus the raw row shapes
//! the Postgres queries map into.

mod memory_record;

pub use memory_record::{
    format_vector_literal, parse_vector_literal, MemoryRecord, MemoryRow, ScoredMemoryRow,
};
