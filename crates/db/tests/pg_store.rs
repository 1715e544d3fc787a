//! PostgreSQL store tests. Require `DATABASE_URL`; run with `--ignored`.

use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use conductor_core::idempotency::{IdempotencyRecord, Reservation};
use conductor_core::job::{CancelOutcome, Job, JobError, JobErrorKind, JobOutcome, JobStatus};
use conductor_core::rate_limit::Quota;
use conductor_db::repositories::PgStore;
use conductor_db::{IdempotencyStore, JobStore, RateLimitStore, StoreError, WorkQueue, WorkerRegistry};
use sqlx::PgPool;

fn queued(id: &str) -> Job {
    Job::new_queued(id.into(), "owner-1".into(), b"{\"prompt\":\"x\"}".to_vec(), Utc::now())
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn claim_is_exclusive(pool: PgPool) {
    let store = PgStore::new(pool);
    store.insert(&queued("j1")).await.unwrap();

    let now = Utc::now();
    let (a, b) = tokio::join!(store.claim("j1", "w1", now), store.claim("j1", "w2", now));
    let winners = [a.unwrap(), b.unwrap()].into_iter().flatten().count();
    assert_eq!(winners, 1);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn duplicate_insert_is_rejected(pool: PgPool) {
    let store = PgStore::new(pool);
    store.insert(&queued("j1")).await.unwrap();
    assert_matches!(store.insert(&queued("j1")).await, Err(StoreError::Duplicate(_)));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn full_success_lifecycle_round_trips(pool: PgPool) {
    let store = PgStore::new(pool);
    store.insert(&queued("j1")).await.unwrap();
    let now = Utc::now();
    store.claim("j1", "w1", now).await.unwrap().unwrap();
    store.record_backend_task("j1", "w1", "task-9", 1).await.unwrap();
    store.record_progress("j1", "w1", 0.5).await.unwrap();

    let done = store
        .complete("j1", "w1", JobOutcome::Succeeded(vec![]), Utc::now())
        .await
        .unwrap();
    assert_eq!(done.status, JobStatus::Succeeded);

    let loaded = store.get("j1").await.unwrap().unwrap();
    assert_eq!(loaded.status, JobStatus::Succeeded);
    assert_eq!(loaded.attempts, 1);
    assert_eq!(loaded.backend_task_id.as_deref(), Some("task-9"));
    assert_eq!(loaded.result, Some(vec![]));
    assert!(loaded.worker_owner.is_none());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn heartbeat_reports_lost_ownership(pool: PgPool) {
    let store = PgStore::new(pool);
    store.insert(&queued("j1")).await.unwrap();
    let t0 = Utc::now();
    store.claim("j1", "w1", t0).await.unwrap();

    let err = store.heartbeat("j1", "w2", t0).await.unwrap_err();
    assert!(err.is_ownership_lost());
    assert_matches!(
        store.heartbeat("missing", "w1", t0).await,
        Err(StoreError::JobNotFound(_))
    );
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn cancel_follows_status(pool: PgPool) {
    let store = PgStore::new(pool);
    store.insert(&queued("q")).await.unwrap();
    store.insert(&queued("r")).await.unwrap();
    let now = Utc::now();
    store.claim("r", "w1", now).await.unwrap();

    assert_eq!(store.request_cancel("q", now).await.unwrap(), CancelOutcome::Canceled);
    assert_eq!(
        store.request_cancel("r", now).await.unwrap(),
        CancelOutcome::CancelRequested
    );
    assert!(store.heartbeat("r", "w1", now).await.unwrap().cancel_requested);
    assert_eq!(
        store.request_cancel("q", now).await.unwrap(),
        CancelOutcome::AlreadyTerminal(JobStatus::Canceled)
    );
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn requeue_cas_respects_heartbeat(pool: PgPool) {
    let store = PgStore::new(pool);
    store.insert(&queued("j1")).await.unwrap();
    let t0 = Utc::now();
    let claimed = store.claim("j1", "w1", t0).await.unwrap().unwrap();
    let observed = claimed.heartbeat_at.unwrap();

    store
        .heartbeat("j1", "w1", observed + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(store.requeue_abandoned("j1", "w1", observed, t0).await.unwrap(), None);

    let fresh = store.get("j1").await.unwrap().unwrap().heartbeat_at.unwrap();
    assert_eq!(
        store.requeue_abandoned("j1", "w1", fresh, t0).await.unwrap(),
        Some(JobStatus::Queued)
    );
    let job = store.get("j1").await.unwrap().unwrap();
    assert_eq!(job.retry_count, 1);
    assert!(job.worker_owner.is_none());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn fail_abandoned_records_worker_lost(pool: PgPool) {
    let store = PgStore::new(pool);
    store.insert(&queued("j1")).await.unwrap();
    let t0 = Utc::now();
    let hb = store.claim("j1", "w1", t0).await.unwrap().unwrap().heartbeat_at.unwrap();

    let err = JobError::new(JobErrorKind::WorkerLost, "worker w1 stopped heartbeating");
    assert!(store.fail_abandoned("j1", "w1", hb, err.clone(), t0).await.unwrap());
    let job = store.get("j1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error, Some(err));
}

// ---------------------------------------------------------------------------
// Idempotency, rate limits, queue, workers
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn idempotency_reserve_is_first_writer_wins(pool: PgPool) {
    let store = PgStore::new(pool);
    let now = Utc::now();
    let ttl = Duration::from_secs(3600);
    let a = IdempotencyRecord::new("u1", "k1", "job-a", now, ttl);
    let b = IdempotencyRecord::new("u1", "k1", "job-b", now, ttl);

    assert_eq!(store.reserve(a, now).await.unwrap(), Reservation::Reserved);
    assert_eq!(
        store.reserve(b, now).await.unwrap(),
        Reservation::Existing("job-a".into())
    );
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn rate_limit_denies_after_capacity(pool: PgPool) {
    let store = PgStore::new(pool);
    let now = Utc::now();
    let quota = Quota::per_hour(2);
    assert!(store.try_acquire("u1", quota, 1, now).await.unwrap().allowed);
    assert!(store.try_acquire("u1", quota, 1, now).await.unwrap().allowed);
    let denied = store.try_acquire("u1", quota, 1, now).await.unwrap();
    assert!(!denied.allowed);
    assert!(denied.retry_after.is_some());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn queue_hides_received_until_ack(pool: PgPool) {
    let store = PgStore::new(pool).with_visibility_timeout(Duration::from_secs(60));
    store.push("j1").await.unwrap();
    assert_eq!(store.depth().await.unwrap(), 1);

    let delivery = store.receive(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(delivery.job_id, "j1");
    assert_eq!(delivery.delivery_count, 1);
    assert!(store.receive(Duration::ZERO).await.unwrap().is_none());

    assert!(store.contains("j1").await.unwrap());
    store.ack(&delivery.receipt).await.unwrap();
    assert!(!store.contains("j1").await.unwrap());
    assert!(!store.remove("j1").await.unwrap());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn queued_scan_skips_jobs_with_a_message(pool: PgPool) {
    let store = PgStore::new(pool);
    store.insert(&queued("waiting")).await.unwrap();
    store.insert(&queued("lost")).await.unwrap();
    store.push("waiting").await.unwrap();

    let cutoff = Utc::now() + chrono::Duration::seconds(1);
    let ids: Vec<_> = store
        .list_queued_before(cutoff)
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(ids, vec!["lost".to_string()]);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn worker_registry_tracks_liveness(pool: PgPool) {
    let store = PgStore::new(pool);
    let now = Utc::now();
    store.beat("w1", now).await.unwrap();
    store.beat("w2", now - chrono::Duration::minutes(10)).await.unwrap();

    let live = store.live_workers(now, Duration::from_secs(60)).await.unwrap();
    assert!(live.contains("w1"));
    assert!(!live.contains("w2"));

    assert_eq!(store.prune(now - chrono::Duration::minutes(5)).await.unwrap(), 1);
    let everyone = store.live_workers(now, Duration::from_secs(3600)).await.unwrap();
    assert_eq!(everyone.len(), 1);
}
