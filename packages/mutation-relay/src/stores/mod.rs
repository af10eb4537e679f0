//! Storage backends for the durable queue.
//!
//! Available backends:
//! - `MemoryStore` - In-memory transactional store (always available)
//! - `PgJobStore` / `PgOutboxWriter` - PostgreSQL (requires `postgres` feature)

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{JobState, MemoryStore, MemoryTransaction, StoredJob};

#[cfg(feature = "postgres")]
pub use postgres::{PgJobStore, PgOutboxWriter};
