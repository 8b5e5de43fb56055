//! Parley storage crate - conversation persistence and turn handoff.
//!
//! Provides a WAL-mode SQLite database with migrations, the
//! `ConversationStore` and `HandoffStore` contracts, and both SQLite and
//! in-memory implementations of them.

pub mod db;
pub mod memory;
pub mod migrations;
pub mod repository;
pub mod store;

pub use db::Database;
pub use memory::{InMemoryConversationStore, InMemoryHandoffStore};
pub use repository::{SqliteConversationStore, SqliteHandoffStore};
pub use store::{ConversationStore, HandoffStore, UpdateOutcome};
