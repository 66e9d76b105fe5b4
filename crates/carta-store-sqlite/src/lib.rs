//! SQLite backend for the Carta conversation store.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. Deleting a conversation row cascades
//! to its nodes, pairs and ancestry rows through foreign keys.

mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteStore;

#[cfg(test)]
mod tests;
