//! Pipeline-level error types.

use thiserror::Error;

/// Errors produced by the execution pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ------ Request errors ------

    /// The caller supplied an unusable request, e.g. no filter at all.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    // ------ Finalization errors ------

    /// The batch spec's owner can no longer read the repository.
    #[error("user {user_id} no longer has access to repository {repo_id}")]
    RepoAccessRevoked { user_id: i64, repo_id: i64 },

    /// The execution log lacks the driver entry, so no results can be extracted.
    #[error("job {0} has no execution log entry for the batch driver")]
    NoDriverLog(i64),

    #[error("found {0} whole-execution cache results, expected at most one")]
    MultipleExecutionResults(usize),

    /// A cache payload could not be decoded.
    #[error("malformed cache result: {0}")]
    MalformedCacheValue(String),

    // ------ Cancellation ------

    #[error("cancellation deadline exceeded with {remaining} job(s) still processing")]
    CancelDeadlineExceeded { remaining: i64 },

    // ------ Collaborators ------

    #[error("database error: {0}")]
    Db(db::DbError),

    #[error(transparent)]
    Adapter(#[from] adapters::AdapterError),
}

impl PipelineError {
    /// Store contention (a locked database, an exhausted pool) rather than a
    /// problem with the job. The operation can be repeated later.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Db(err) | Self::Adapter(adapters::AdapterError::Db(err)) => err.is_transient(),
            _ => false,
        }
    }
}

impl From<db::DbError> for PipelineError {
    fn from(err: db::DbError) -> Self {
        match err {
            db::DbError::NotFound { entity, id } => Self::NotFound { entity, id },
            other => Self::Db(other),
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(db::DbError::Sqlx(err))
    }
}
