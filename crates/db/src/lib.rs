//! `db` crate: pure persistence layer.
//!
//! Provides a SQLite connection pool, typed row structs, and repository
//! functions for every table of the workspace execution schema. No business
//! logic lives here: state-machine decisions belong to the `pipeline` crate.

pub mod error;
pub mod pool;
pub mod repository;
pub mod models;

pub use pool::DbPool;
pub use error::DbError;

#[cfg(test)]
mod repository_tests;
