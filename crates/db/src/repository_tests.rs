use chrono::Utc;
use sqlx::pool::PoolConnection;
use sqlx::Sqlite;

use crate::models::{ExecutionLogEntry, JobState, NewBatchSpec, NewCacheEntry, NewWorkspace};
use crate::pool::create_in_memory_pool;
use crate::repository::{
    access_tokens, batch_specs, cache_entries, changeset_specs, jobs, queue, workspaces,
};
use crate::DbPool;

async fn setup() -> (DbPool, PoolConnection<Sqlite>) {
    let pool = create_in_memory_pool().await.unwrap();
    let conn = pool.acquire().await.unwrap();
    (pool, conn)
}

async fn seed_batch_spec(conn: &mut PoolConnection<Sqlite>, user_id: i64, workspaces_n: usize) -> (i64, Vec<i64>) {
    let spec = batch_specs::create_batch_spec(
        conn,
        &NewBatchSpec { user_id, ..Default::default() },
    )
    .await
    .unwrap();

    let mut ids = Vec::new();
    for i in 0..workspaces_n {
        let ws = workspaces::create_workspace(
            conn,
            &NewWorkspace {
                batch_spec_id: spec.id,
                repo_id: i as i64 + 1,
                repo_name: format!("github.com/acme/repo-{i}"),
                branch: "refs/heads/main".into(),
                commit_sha: "d34db33f".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        ids.push(ws.id);
    }
    (spec.id, ids)
}

#[tokio::test]
async fn round_robin_rank_across_users() {
    let (_pool, mut conn) = setup().await;
    for user in 1..=3 {
        let (spec_id, _) = seed_batch_spec(&mut conn, user, 2).await;
        jobs::create_jobs_for_batch_spec(&mut conn, spec_id, 2).await.unwrap();
    }

    let opts = queue::ListJobsOpts { with_rank: true, ..Default::default() };
    let mut ranked = queue::list_jobs(&mut conn, &opts).await.unwrap();
    ranked.sort_by_key(|j| j.place_in_global_queue);

    let order: Vec<i64> = ranked.iter().map(|j| j.id).collect();
    assert_eq!(order, vec![1, 3, 5, 2, 4, 6]);

    let job2 = ranked.iter().find(|j| j.id == 2).unwrap();
    assert_eq!(job2.place_in_user_queue, Some(2));
    assert_eq!(job2.place_in_global_queue, Some(4));
}

#[tokio::test]
async fn unranked_list_leaves_positions_empty() {
    let (_pool, mut conn) = setup().await;
    let (spec_id, _) = seed_batch_spec(&mut conn, 1, 2).await;
    jobs::create_jobs_for_batch_spec(&mut conn, spec_id, 2).await.unwrap();

    let rows = queue::list_jobs(&mut conn, &queue::ListJobsOpts::default()).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|j| j.place_in_global_queue.is_none()));
}

#[tokio::test]
async fn dequeue_order_rotates_between_users() {
    let (_pool, mut conn) = setup().await;
    for user in 1..=3 {
        let (spec_id, _) = seed_batch_spec(&mut conn, user, 2).await;
        jobs::create_jobs_for_batch_spec(&mut conn, spec_id, 2).await.unwrap();
    }

    let mut order = Vec::new();
    while let Some(job) = queue::claim_next(&mut conn, "worker-a").await.unwrap() {
        queue::record_dequeue(&mut conn, job.user_id).await.unwrap();
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.worker_hostname, "worker-a");
        order.push(job.id);
    }
    assert_eq!(order, vec![1, 3, 5, 2, 4, 6]);
}

#[tokio::test]
async fn non_queued_jobs_have_no_rank() {
    let (_pool, mut conn) = setup().await;
    let (spec_id, _) = seed_batch_spec(&mut conn, 1, 2).await;
    jobs::create_jobs_for_batch_spec(&mut conn, spec_id, 2).await.unwrap();
    let claimed = queue::claim_next(&mut conn, "w").await.unwrap().unwrap();

    let claimed = queue::get_job(&mut conn, claimed.id).await.unwrap();
    assert_eq!(claimed.place_in_global_queue, None);

    let other = queue::get_job(&mut conn, 2).await.unwrap();
    assert_eq!(other.place_in_global_queue, Some(1));
    assert_eq!(other.place_in_user_queue, Some(1));
}

#[tokio::test]
async fn jobs_are_created_once_per_workspace() {
    let (_pool, mut conn) = setup().await;
    let (spec_id, _) = seed_batch_spec(&mut conn, 1, 3).await;

    let first = jobs::create_jobs_for_batch_spec(&mut conn, spec_id, 2).await.unwrap();
    assert_eq!(first.len(), 3);
    assert!(first.iter().all(|j| j.state == JobState::Queued && j.version == 2 && j.user_id == 1));

    let second = jobs::create_jobs_for_batch_spec(&mut conn, spec_id, 2).await.unwrap();
    assert!(second.is_empty());
}

#[tokio::test]
async fn live_job_index_rejects_second_queued_job() {
    let (_pool, mut conn) = setup().await;
    let (_, ws) = seed_batch_spec(&mut conn, 1, 1).await;
    jobs::insert_job(&mut conn, ws[0], 1, 2).await.unwrap();

    let err = jobs::insert_job(&mut conn, ws[0], 1, 2).await.unwrap_err();
    assert!(err.is_constraint_violation(), "unexpected error: {err}");
}

#[tokio::test]
async fn heartbeat_only_returns_owned_processing_jobs() {
    let (_pool, mut conn) = setup().await;
    let (spec_id, _) = seed_batch_spec(&mut conn, 1, 2).await;
    jobs::create_jobs_for_batch_spec(&mut conn, spec_id, 2).await.unwrap();
    let mine = queue::claim_next(&mut conn, "worker-a").await.unwrap().unwrap();
    let theirs = queue::claim_next(&mut conn, "worker-b").await.unwrap().unwrap();

    let alive = jobs::heartbeat(&mut conn, "worker-a", &[mine.id, theirs.id, 99]).await.unwrap();
    assert_eq!(alive, vec![mine.id]);
    assert!(jobs::heartbeat(&mut conn, "worker-a", &[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn append_log_returns_entry_index() {
    let (_pool, mut conn) = setup().await;
    let (spec_id, _) = seed_batch_spec(&mut conn, 1, 1).await;
    jobs::create_jobs_for_batch_spec(&mut conn, spec_id, 2).await.unwrap();
    let job = queue::claim_next(&mut conn, "w").await.unwrap().unwrap();

    let entry = ExecutionLogEntry {
        key: "setup.fs".into(),
        command: vec!["mkdir".into()],
        start_time: Utc::now(),
        exit_code: Some(0),
        out: "ok".into(),
        duration_ms: Some(3),
    };
    assert_eq!(jobs::append_execution_log(&mut conn, job.id, "w", &entry).await.unwrap(), Some(0));
    assert_eq!(jobs::append_execution_log(&mut conn, job.id, "w", &entry).await.unwrap(), Some(1));
    assert_eq!(jobs::append_execution_log(&mut conn, job.id, "other", &entry).await.unwrap(), None);

    let stored = jobs::get_job_unranked(&mut conn, job.id).await.unwrap();
    assert_eq!(stored.execution_logs.0.len(), 2);
    assert_eq!(stored.execution_logs.0[1], entry);
}

#[tokio::test]
async fn cache_upsert_keeps_value_and_touches_last_used() {
    let (_pool, mut conn) = setup().await;
    let entry = NewCacheEntry { user_id: 7, key: "k1".into(), value: "first".into(), version: 2 };
    let first = cache_entries::upsert_cache_entry(&mut conn, &entry).await.unwrap();

    let rewrite = NewCacheEntry { value: "second".into(), ..entry.clone() };
    let second = cache_entries::upsert_cache_entry(&mut conn, &rewrite).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.value, "first");
    assert!(second.last_used_at >= first.last_used_at);
    assert_eq!(cache_entries::count_cache_entries(&mut conn, 7).await.unwrap(), 1);

    // Same key under another version is a distinct entry.
    let v3 = NewCacheEntry { version: 3, ..entry };
    cache_entries::upsert_cache_entry(&mut conn, &v3).await.unwrap();
    assert_eq!(cache_entries::count_cache_entries(&mut conn, 7).await.unwrap(), 2);

    let listed = cache_entries::list_cache_entries(&mut conn, 7, &["k1".into()], 2).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(cache_entries::mark_used(&mut conn, 7, &["k1".into()], 2).await.unwrap(), 1);
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let (_pool, mut conn) = setup().await;
    let (spec_id, _) = seed_batch_spec(&mut conn, 1, 2).await;
    jobs::create_jobs_for_batch_spec(&mut conn, spec_id, 2).await.unwrap();
    let processing = queue::claim_next(&mut conn, "w").await.unwrap().unwrap();

    let changed = jobs::cancel_jobs(&mut conn, Some(spec_id), &[]).await.unwrap();
    assert_eq!(changed.len(), 2);
    let flagged = changed.iter().find(|j| j.id == processing.id).unwrap();
    assert_eq!(flagged.state, JobState::Processing);
    assert!(flagged.cancel);
    let canceled = changed.iter().find(|j| j.id != processing.id).unwrap();
    assert_eq!(canceled.state, JobState::Canceled);
    assert!(canceled.finished_at.is_some());

    let again = jobs::cancel_jobs(&mut conn, Some(spec_id), &[]).await.unwrap();
    assert!(again.is_empty());
    assert_eq!(jobs::list_canceled_ids(&mut conn, "w").await.unwrap(), vec![processing.id]);
}

#[tokio::test]
async fn flagged_queued_jobs_are_neither_ranked_nor_claimed() {
    let (_pool, mut conn) = setup().await;
    let (spec_id, _) = seed_batch_spec(&mut conn, 1, 2).await;
    let created = jobs::create_jobs_for_batch_spec(&mut conn, spec_id, 2).await.unwrap();
    sqlx::query("UPDATE workspace_execution_jobs SET cancel = TRUE WHERE id = ?1")
        .bind(created[0].id)
        .execute(&mut *conn)
        .await
        .unwrap();

    let flagged = queue::get_job(&mut conn, created[0].id).await.unwrap();
    assert_eq!(flagged.place_in_global_queue, None);

    let claimed = queue::claim_next(&mut conn, "w").await.unwrap().unwrap();
    assert_eq!(claimed.id, created[1].id);
    assert!(queue::claim_next(&mut conn, "w").await.unwrap().is_none());
}

#[tokio::test]
async fn stalled_flagged_jobs_are_canceled_even_without_resets_left() {
    let (_pool, mut conn) = setup().await;
    let (spec_id, _) = seed_batch_spec(&mut conn, 1, 2).await;
    jobs::create_jobs_for_batch_spec(&mut conn, spec_id, 2).await.unwrap();
    let flagged = queue::claim_next(&mut conn, "w").await.unwrap().unwrap();
    let plain = queue::claim_next(&mut conn, "w").await.unwrap().unwrap();
    jobs::cancel_jobs(&mut conn, None, &[flagged.id]).await.unwrap();

    let stalled_before = Utc::now() + chrono::Duration::seconds(1);
    let reset = jobs::reset_stalled(&mut conn, stalled_before, 0).await.unwrap();
    assert_eq!(reset.len(), 1);
    assert_eq!(reset[0].id, flagged.id);
    assert_eq!(reset[0].state, JobState::Canceled);
    assert_eq!(reset[0].num_resets, 0);
    assert!(reset[0].finished_at.is_some());

    let failed = jobs::fail_stalled(&mut conn, stalled_before, 0, "stalled").await.unwrap();
    let failed_ids: Vec<i64> = failed.iter().map(|j| j.id).collect();
    assert_eq!(failed_ids, vec![plain.id]);
}

#[tokio::test]
async fn changeset_specs_and_tokens_round_trip() {
    let (_pool, mut conn) = setup().await;
    let (spec_id, ws) = seed_batch_spec(&mut conn, 1, 1).await;

    let spec = crate::models::NewChangesetSpec {
        batch_spec_id: spec_id,
        repo_id: 1,
        user_id: 1,
        base_ref: "refs/heads/main".into(),
        base_rev: "d34db33f".into(),
        head_ref: "refs/heads/fix".into(),
        title: "t".into(),
        body: "b".into(),
        commit_message: "m".into(),
        commit_author_name: "n".into(),
        commit_author_email: "e@example.com".into(),
        published: Some(serde_json::json!(false)),
        diff: "diff".into(),
        diff_stat_added: 1,
        diff_stat_deleted: 0,
    };
    let a = changeset_specs::insert_changeset_spec(&mut conn, &spec).await.unwrap();
    let b = changeset_specs::insert_changeset_spec(&mut conn, &spec).await.unwrap();
    assert_ne!(a.rand_id, b.rand_id);

    workspaces::set_changeset_spec_ids(&mut conn, ws[0], &[a.id, b.id]).await.unwrap();
    let stored = workspaces::get_workspace(&mut conn, ws[0]).await.unwrap();
    assert_eq!(stored.changeset_spec_ids.0, vec![a.id, b.id]);

    assert_eq!(changeset_specs::delete_changeset_specs(&mut conn, &[a.id, b.id]).await.unwrap(), 2);
    assert!(changeset_specs::list_changeset_specs(&mut conn, spec_id).await.unwrap().is_empty());

    let token = access_tokens::create_access_token(&mut conn, 1, "job 1").await.unwrap();
    assert!(access_tokens::hard_delete_access_token(&mut conn, token.id).await.unwrap());
    assert!(!access_tokens::hard_delete_access_token(&mut conn, token.id).await.unwrap());
}
