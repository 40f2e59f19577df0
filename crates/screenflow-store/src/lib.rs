//! SQLite persistence for workflow sessions and their audit trail.
//!
//! Sessions are stored as one JSON document per row with a few indexed
//! columns. Every mutation is a single transaction that rewrites the
//! session row under an optimistic version check and appends exactly one
//! activity row.

pub mod activity;
pub mod database;
pub mod error;
pub mod row_helpers;
pub mod schema;
pub mod sessions;

pub use activity::ActivityRepo;
pub use database::Database;
pub use error::StoreError;
pub use sessions::{SessionFilter, SessionRepo};
