//! Fixtures shared by the pipeline tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tempfile::TempDir;

use adapters::mock::{MockCredentialStore, MockRepoAccess};
use db::models::{BatchSpecRow, ExecutionLogEntry, NewBatchSpec, NewWorkspace, WorkspaceRow};
use db::pool::{create_in_memory_pool, create_pool_with_busy_timeout, run_migrations};
use db::repository::{batch_specs, jobs, workspaces};
use db::DbPool;

use crate::logs::DRIVER_LOG_KEY;
use crate::{ExecutionController, LifecycleConfig};

pub(crate) struct Harness {
    pub pool: DbPool,
    pub controller: ExecutionController,
    pub repo_access: MockRepoAccess,
    pub credentials: MockCredentialStore,
    /// Keeps the database file of [`file_harness`] alive.
    _dir: Option<TempDir>,
}

pub(crate) async fn harness_with(config: LifecycleConfig) -> Harness {
    harness_with_credentials(config, MockCredentialStore::passthrough()).await
}

pub(crate) async fn harness() -> Harness {
    harness_with(LifecycleConfig::default()).await
}

pub(crate) async fn harness_with_credentials(config: LifecycleConfig, credentials: MockCredentialStore) -> Harness {
    let pool = create_in_memory_pool().await.unwrap();
    build_harness(pool, config, credentials, None)
}

/// Harness over a database file in a fresh temporary directory. Unlike the
/// in-memory pool it holds several connections, so concurrent callers
/// contend for SQLite's write lock for real.
pub(crate) async fn file_harness(busy_timeout: Duration) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("batches.db").display());
    let pool = create_pool_with_busy_timeout(&url, 8, busy_timeout).await.unwrap();
    run_migrations(&pool).await.unwrap();
    build_harness(pool, LifecycleConfig::default(), MockCredentialStore::passthrough(), Some(dir))
}

fn build_harness(
    pool: DbPool,
    config: LifecycleConfig,
    credentials: MockCredentialStore,
    dir: Option<TempDir>,
) -> Harness {
    let repo_access = MockRepoAccess::new();
    let controller = ExecutionController::new(
        pool.clone(),
        config,
        Arc::new(repo_access.clone()),
        Arc::new(credentials.clone()),
    );
    Harness { pool, controller, repo_access, credentials, _dir: dir }
}

pub(crate) async fn seed_batch_spec(pool: &DbPool, user_id: i64, template: Value) -> BatchSpecRow {
    seed_batch_spec_with(pool, NewBatchSpec { user_id, changeset_template: template, ..Default::default() }).await
}

pub(crate) async fn seed_batch_spec_with(pool: &DbPool, spec: NewBatchSpec) -> BatchSpecRow {
    let mut conn = pool.acquire().await.unwrap();
    batch_specs::create_batch_spec(&mut conn, &spec).await.unwrap()
}

/// Workspace on `refs/heads/main` of repository `repo_id`; `tweak` adjusts flags.
pub(crate) async fn seed_workspace(
    pool: &DbPool,
    batch_spec_id: i64,
    repo_id: i64,
    tweak: impl FnOnce(&mut NewWorkspace),
) -> WorkspaceRow {
    let mut ws = NewWorkspace {
        batch_spec_id,
        repo_id,
        repo_name: format!("github.com/acme/repo-{repo_id}"),
        branch: "refs/heads/main".into(),
        commit_sha: "f00dfeed".into(),
        ..Default::default()
    };
    tweak(&mut ws);
    let mut conn = pool.acquire().await.unwrap();
    workspaces::create_workspace(&mut conn, &ws).await.unwrap()
}

pub(crate) async fn set_logs(pool: &DbPool, job_id: i64, entries: &[ExecutionLogEntry]) {
    let mut conn = pool.acquire().await.unwrap();
    jobs::set_execution_logs(&mut conn, job_id, entries).await.unwrap();
}

pub(crate) fn cache_event(operation: &str, key: &str, value: Value) -> String {
    let event = json!({
        "operation": operation,
        "timestamp": "2021-11-04T12:43:19.551Z",
        "status": "SUCCESS",
        "metadata": {"key": key, "value": value},
    });
    format!("stdout: {event}")
}

pub(crate) fn log_entry(key: &str, lines: &[String]) -> ExecutionLogEntry {
    ExecutionLogEntry {
        key: key.to_string(),
        command: vec!["src".into(), "batch".into(), "exec".into()],
        start_time: Utc::now(),
        exit_code: Some(0),
        out: format!("\n{}", lines.join("\n")),
        duration_ms: Some(200),
    }
}

pub(crate) fn driver_log(lines: &[String]) -> ExecutionLogEntry {
    log_entry(DRIVER_LOG_KEY, lines)
}

/// Two step results and one whole-execution result with the given diff.
pub(crate) fn standard_driver_output(diff: &str) -> Vec<String> {
    vec![
        cache_event("CACHE_AFTER_STEP_RESULT", "key-step-0", json!({"stepIndex": 0, "diff": "c3RlcCAw", "outputs": {}})),
        cache_event("CACHE_AFTER_STEP_RESULT", "key-step-1", json!({"stepIndex": 1, "diff": "c3RlcCAx", "outputs": {}})),
        cache_event(
            "CACHE_RESULT",
            "key-execution",
            json!({
                "diff": diff,
                "changedFiles": {"modified": ["README.md"], "added": null, "deleted": null, "renamed": null},
                "outputs": {"name": "docs"},
                "path": ""
            }),
        ),
    ]
}

pub(crate) const README_DIFF: &str = "diff --git a/README.md b/README.md\nindex 1914491..cd2ccbf 100644\n--- a/README.md\n+++ b/README.md\n@@ -1 +1,2 @@\n-Hello\n+Hello world\n+More\n";

pub(crate) fn changeset_template() -> Value {
    json!({
        "title": "Update ${{ outputs.name }}",
        "body": "Automated change to ${{ repository.name }}",
        "branch": "batch/update-docs",
        "commit": {"message": "Update docs", "author": {"name": "Batch Bot", "email": "bot@example.com"}},
        "published": false
    })
}
