//! Durable offline buffer
//!
//! This module handles:
//! - Spooling messages while the queue backend is unreachable
//! - Per-entry TTL and flush attempt bookkeeping
//! - Priority-then-age replay through a pluggable send handler
//! - SQLite persistence, with an in-memory store for tests

mod offline;
mod sqlite;
mod store;

pub use offline::{BufferConfig, BufferStatistics, FlushResult, OfflineBuffer};
pub use sqlite::SqliteStore;
pub use store::{BufferStore, BufferedEntry, InsertOutcome, MemoryStore};
