//! Adapter-level error type.

use thiserror::Error;

/// Errors returned by an external collaborator.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The credential store could not mint or revoke a token.
    #[error("credential store error: {0}")]
    Credential(String),

    /// The repository authorization backend could not answer.
    #[error("repository access check failed: {0}")]
    RepoAccess(String),

    #[error(transparent)]
    Db(#[from] db::DbError),
}
