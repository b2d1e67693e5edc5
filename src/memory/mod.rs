//! # In-Memory Server
//!
//! A `Connector` that serves document tables from process memory. Backs the
//! integration tests and the `watch` command.

mod server;
mod table;

pub use server::{MemoryServer, TABLE_UNAVAILABLE};
pub use table::{TableData, WriteOutcome, PRIMARY_KEY};
