//! Repository functions: one function per database operation.
//!
//! Every function takes a `&mut SqliteConnection` so callers decide whether it
//! runs on a pooled connection or inside an open transaction (`&mut *tx`).
//! No business logic, no domain types: pure SQL.

pub mod access_tokens;
pub mod batch_specs;
pub mod cache_entries;
pub mod changeset_specs;
pub mod jobs;
pub mod queue;
pub mod workspaces;

/// Encode a list as a JSON array for `IN (SELECT value FROM json_each(?))`.
///
/// An empty list encodes as `None` so the filter can be written as
/// `(?n IS NULL OR col IN (...))`.
pub(crate) fn json_list<T: serde::Serialize>(items: &[T]) -> Result<Option<String>, crate::DbError> {
    if items.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(items)?))
}
