//! Persistence layer: the memory store and workflow checkpoints on libSQL.

pub mod libsql_backend;
pub mod migrations;
pub mod model;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use model::*;
pub use traits::{CheckpointResolution, CheckpointStore, MemoryStore, StoredCheckpoint};
