//! Test doubles for [`RepoAccess`] and [`CredentialStore`].
//!
//! Both record every call they receive so tests can assert on the side
//! effects the pipeline performed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use sqlx::SqliteConnection;

use crate::{AdapterError, CredentialStore, RepoAccess, SqlCredentialStore};

// ---------------------------------------------------------------------------
// repository access
// ---------------------------------------------------------------------------

/// Allows everything except the `(user_id, repo_id)` pairs explicitly denied.
#[derive(Debug, Clone, Default)]
pub struct MockRepoAccess {
    denied: Arc<Mutex<HashSet<(i64, i64)>>>,
    /// Every `(user_id, repo_id)` checked, in call order.
    pub calls: Arc<Mutex<Vec<(i64, i64)>>>,
}

impl MockRepoAccess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Revoke `user_id`'s access to `repo_id`.
    pub fn deny(&self, user_id: i64, repo_id: i64) {
        self.denied.lock().unwrap_or_else(PoisonError::into_inner).insert((user_id, repo_id));
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl RepoAccess for MockRepoAccess {
    async fn can_read(&self, user_id: i64, repo_id: i64) -> Result<bool, AdapterError> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push((user_id, repo_id));
        let denied = self.denied.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(!denied.contains(&(user_id, repo_id)))
    }
}

// ---------------------------------------------------------------------------
// credential store
// ---------------------------------------------------------------------------

/// Behaviour injected into [`MockCredentialStore`] at construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialBehaviour {
    /// Delegate to [`SqlCredentialStore`].
    Passthrough,
    /// Mint normally, fail every revocation with the given message.
    FailDelete(String),
    /// Fail every mint with the given message.
    FailCreate(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialCall {
    Create { user_id: i64 },
    HardDelete { id: i64 },
}

#[derive(Debug, Clone)]
pub struct MockCredentialStore {
    pub behaviour: CredentialBehaviour,
    pub calls: Arc<Mutex<Vec<CredentialCall>>>,
}

impl MockCredentialStore {
    pub fn passthrough() -> Self {
        Self::with_behaviour(CredentialBehaviour::Passthrough)
    }

    pub fn failing_delete(msg: impl Into<String>) -> Self {
        Self::with_behaviour(CredentialBehaviour::FailDelete(msg.into()))
    }

    pub fn failing_create(msg: impl Into<String>) -> Self {
        Self::with_behaviour(CredentialBehaviour::FailCreate(msg.into()))
    }

    fn with_behaviour(behaviour: CredentialBehaviour) -> Self {
        Self { behaviour, calls: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn calls(&self) -> Vec<CredentialCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Ids passed to `hard_delete`, in call order.
    pub fn deleted_ids(&self) -> Vec<i64> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                CredentialCall::HardDelete { id } => Some(id),
                CredentialCall::Create { .. } => None,
            })
            .collect()
    }

    fn record(&self, call: CredentialCall) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(call);
    }
}

#[async_trait]
impl CredentialStore for MockCredentialStore {
    async fn create(&self, conn: &mut SqliteConnection, user_id: i64, note: &str) -> Result<i64, AdapterError> {
        self.record(CredentialCall::Create { user_id });
        match &self.behaviour {
            CredentialBehaviour::FailCreate(msg) => Err(AdapterError::Credential(msg.clone())),
            _ => SqlCredentialStore.create(conn, user_id, note).await,
        }
    }

    async fn hard_delete(&self, conn: &mut SqliteConnection, id: i64) -> Result<(), AdapterError> {
        self.record(CredentialCall::HardDelete { id });
        match &self.behaviour {
            CredentialBehaviour::FailDelete(msg) => Err(AdapterError::Credential(msg.clone())),
            _ => SqlCredentialStore.hard_delete(conn, id).await,
        }
    }
}
