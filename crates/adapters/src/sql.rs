//! Production implementations backed by the local database.

use async_trait::async_trait;
use sqlx::SqliteConnection;
use tracing::debug;

use db::repository::access_tokens;

use crate::{AdapterError, CredentialStore, RepoAccess};

/// Stores credentials in the `access_tokens` table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlCredentialStore;

#[async_trait]
impl CredentialStore for SqlCredentialStore {
    async fn create(&self, conn: &mut SqliteConnection, user_id: i64, note: &str) -> Result<i64, AdapterError> {
        let token = access_tokens::create_access_token(conn, user_id, note).await?;
        debug!(token_id = token.id, user_id, "minted access token");
        Ok(token.id)
    }

    async fn hard_delete(&self, conn: &mut SqliteConnection, id: i64) -> Result<(), AdapterError> {
        if !access_tokens::hard_delete_access_token(conn, id).await? {
            debug!(token_id = id, "access token already deleted");
        }
        Ok(())
    }
}

/// Grants every user read access to every repository.
///
/// For deployments where repository permissions are enforced upstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllRepoAccess;

#[async_trait]
impl RepoAccess for AllowAllRepoAccess {
    async fn can_read(&self, _user_id: i64, _repo_id: i64) -> Result<bool, AdapterError> {
        Ok(true)
    }
}
