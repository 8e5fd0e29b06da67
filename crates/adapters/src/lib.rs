//! `adapters` crate: the collaborators the execution pipeline calls out to.
//!
//! The pipeline only depends on the [`RepoAccess`] and [`CredentialStore`]
//! traits. SQL-backed and permissive implementations live in [`sql`];
//! programmable test doubles live in [`mock`].

pub mod error;
pub mod traits;
pub mod sql;
pub mod mock;

pub use error::AdapterError;
pub use sql::{AllowAllRepoAccess, SqlCredentialStore};
pub use traits::{CredentialStore, RepoAccess};
