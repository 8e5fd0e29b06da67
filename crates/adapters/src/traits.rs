//! Contracts for the pipeline's external collaborators.

use async_trait::async_trait;
use sqlx::SqliteConnection;

use crate::AdapterError;

/// Repository authorization check.
///
/// Consulted again at completion time, so a user who lost access while a job
/// ran cannot publish changes to that repository.
#[async_trait]
pub trait RepoAccess: Send + Sync {
    async fn can_read(&self, user_id: i64, repo_id: i64) -> Result<bool, AdapterError>;
}

/// Ephemeral credential store.
///
/// Both methods receive the caller's connection so that minting happens in
/// the dequeue transaction and revocation in the finalization transaction.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Mint a credential for `user_id`. Returns its id.
    async fn create(&self, conn: &mut SqliteConnection, user_id: i64, note: &str) -> Result<i64, AdapterError>;

    /// Revoke a credential. Must succeed when the credential is already gone.
    async fn hard_delete(&self, conn: &mut SqliteConnection, id: i64) -> Result<(), AdapterError>;
}
