mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{insert_job, seed_definition, setup_db};
use serial_test::serial;
use sqlx::PgPool;
use std::collections::HashSet;
use std::time::Duration;
use taskforge_core::{store::PgStore, NewJob};
use uuid::Uuid;

async fn insert_job_with(
    pool: &PgPool,
    key: &str,
    scheduled_offset_secs: i64,
    priority: i32,
) -> Uuid {
    seed_definition(pool, key, 1).await;
    let store = PgStore::new(pool.clone());
    let scheduled_at = if scheduled_offset_secs == 0 {
        None
    } else {
        Some(Utc::now() + ChronoDuration::seconds(scheduled_offset_secs))
    };
    let job = store
        .insert_job(NewJob {
            definition_key: key.to_string(),
            definition_version: 1,
            params: serde_json::json!({}),
            priority,
            max_attempts: 5,
            scheduled_at,
            idempotency_key: None,
        })
        .await
        .unwrap();
    job.id
}

#[tokio::test]
#[serial]
async fn two_workers_never_claim_the_same_job() {
    let pool = setup_db().await;
    let store = PgStore::new(pool.clone());
    let _job_id = insert_job(&pool, "demo.ok").await;

    let store_a = store.clone();
    let store_b = store.clone();

    let (a, b) = tokio::join!(
        async move { store_a.claim_one("worker-a", 30).await.unwrap() },
        async move { store_b.claim_one("worker-b", 30).await.unwrap() },
    );

    let got_a = a.is_some();
    let got_b = b.is_some();
    assert!(
        got_a ^ got_b,
        "expected exactly one worker to claim the job, got_a={got_a}, got_b={got_b}"
    );

    let (status, worker_id): (String, Option<String>) =
        sqlx::query_as("SELECT status, worker_id FROM jobs LIMIT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "running");
    assert!(worker_id.as_deref() == Some("worker-a") || worker_id.as_deref() == Some("worker-b"));
}

#[tokio::test]
#[serial]
async fn expired_lease_is_reclaimed_then_reclaimable_by_another_worker() {
    let pool = setup_db().await;
    let store = PgStore::new(pool.clone());
    let job_id = insert_job(&pool, "demo.ok").await;

    let leased_a = store.claim_one("worker-a", 1).await.unwrap().expect("worker-a should claim");
    assert_eq!(leased_a.id, job_id);

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let reclaimed = store.reclaim_orphans().await.unwrap();
    assert_eq!(reclaimed, 1, "expected to reclaim exactly one expired lease");

    let leased_b = store
        .claim_one("worker-b", 30)
        .await
        .unwrap()
        .expect("worker-b should claim after reclaim");
    assert_eq!(leased_b.id, job_id);
    assert_eq!(leased_b.worker_id.as_deref(), Some("worker-b"));
}

#[tokio::test]
#[serial]
async fn claims_respect_priority_then_queued_at() {
    let pool = setup_db().await;
    let store = PgStore::new(pool.clone());

    let low = insert_job_with(&pool, "demo.ok", 0, 0).await;
    let high = insert_job_with(&pool, "demo.ok", 0, 10).await;
    let future = insert_job_with(&pool, "demo.ok", 30, 100).await;

    let j1 = store.claim_one("worker-a", 30).await.unwrap().expect("expected a job");
    assert_eq!(j1.id, high);

    let j2 = store.claim_one("worker-a", 30).await.unwrap().expect("expected second job");
    assert_eq!(j2.id, low);

    let still_queued = store.get_job(future).await.unwrap().unwrap();
    assert_eq!(still_queued.status, "queued");
    assert!(still_queued.worker_id.is_none());
}

#[tokio::test]
#[serial]
async fn scheduled_job_is_not_claimed_before_its_time() {
    let pool = setup_db().await;
    let store = PgStore::new(pool.clone());
    let delayed = insert_job_with(&pool, "demo.ok", 2, 0).await;

    let claimed = store.claim_one("worker-a", 30).await.unwrap();
    assert!(claimed.is_none(), "should not claim before scheduled_at");

    tokio::time::sleep(Duration::from_millis(2200)).await;

    let claimed2 = store
        .claim_one("worker-a", 30)
        .await
        .unwrap()
        .expect("should claim after scheduled_at passes");
    assert_eq!(claimed2.id, delayed);
}

#[tokio::test]
#[serial]
async fn reclaim_leaves_active_leases_alone() {
    let pool = setup_db().await;
    let store = PgStore::new(pool.clone());
    let job_id = insert_job(&pool, "demo.ok").await;

    let _leased = store.claim_one("worker-a", 30).await.unwrap().expect("should claim");

    let reclaimed = store.reclaim_orphans().await.unwrap();
    assert_eq!(reclaimed, 0, "should not reclaim active leases");

    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, "running");
    assert_eq!(job.worker_id.as_deref(), Some("worker-a"));
}

#[tokio::test]
#[serial]
async fn claiming_drains_the_queue_without_duplicates() {
    let pool = setup_db().await;
    let store = PgStore::new(pool.clone());

    for _ in 0..5 {
        let _ = insert_job(&pool, "demo.ok").await;
    }

    let mut claimed_ids = HashSet::new();
    for _ in 0..5 {
        let job = store.claim_one("worker-a", 30).await.unwrap().expect("expected a job");
        assert!(claimed_ids.insert(job.id), "job claimed twice");
    }

    assert!(store.claim_one("worker-a", 30).await.unwrap().is_none());
}
