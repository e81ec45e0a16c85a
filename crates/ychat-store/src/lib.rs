//! # ychat-store
//!
//! Persistence contract consumed by the chat core, plus two implementations:
//!
//! - [`MemoryStore`]: process-local tables, used by tests and embedders that
//!   bring their own persistence.
//! - [`SqliteStore`]: a `rusqlite` database with versioned migrations.
//!
//! The core only ever talks to the [`Storage`] trait. Every call is
//! synchronous and each implementation serializes its own writes.

pub mod chats;
pub mod connection_requests;
pub mod database;
pub mod memory;
pub mod migrations;
pub mod models;
pub mod peers;
pub mod sqlite;
pub mod storage;
pub mod user_metadata;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use models::*;
pub use sqlite::SqliteStore;
pub use storage::Storage;
