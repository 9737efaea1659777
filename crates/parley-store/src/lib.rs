//! # parley-store
//!
//! Durable storage for two-party conversations and their messages, backed by
//! SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for every domain model,
//! including the composite queries the delivery layer depends on
//! (find-or-create by participant pair, idempotent message insert, pending
//! messages for resynchronization).

pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod users;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
