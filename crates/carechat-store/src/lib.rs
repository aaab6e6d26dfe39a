//! # carechat-store
//!
//! SQLite storage for the reference chat server.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for users, bearer
//! sessions and messages. Callers running on an async runtime are expected
//! to serialise access (the server keeps it behind a mutex).

pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
