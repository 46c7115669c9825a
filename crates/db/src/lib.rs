//! SQLite persistence for conversation sessions.

pub mod connection;
pub mod migrations;
pub mod sessions;

pub use connection::{connect, DbPool};
pub use sessions::SqlSessionStore;
