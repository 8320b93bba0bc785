mod common;

use common::insert_job;
use common::setup_db;
use serial_test::serial;
use taskforge_core::store::PgStore;

#[tokio::test]
#[serial]
async fn cancelling_a_queued_job_finishes_it_immediately() {
    let pool = setup_db().await;
    let store = PgStore::new(pool.clone());
    let job_id = insert_job(&pool, "demo.ok").await;

    store.request_cancel(job_id).await.unwrap();

    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, "cancelled");
    assert!(job.finished_at.is_some());
    assert!(job.cancel_requested_at.is_some());
}

#[tokio::test]
#[serial]
async fn cancelling_a_running_job_marks_it_cancelling_not_cancelled() {
    let pool = setup_db().await;
    let store = PgStore::new(pool.clone());
    let job_id = insert_job(&pool, "demo.ok").await;

    let _claimed = store.claim_one("worker-a", 30).await.unwrap().unwrap();
    store.request_cancel(job_id).await.unwrap();

    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, "cancelling");
    assert!(job.cancel_requested_at.is_some());
    assert!(job.finished_at.is_none(), "cancelling is not terminal by itself");
}

#[tokio::test]
#[serial]
async fn cancelling_a_terminal_job_is_rejected() {
    let pool = setup_db().await;
    let store = PgStore::new(pool.clone());
    let job_id = insert_job(&pool, "demo.ok").await;

    let _claimed = store.claim_one("worker-a", 30).await.unwrap().unwrap();
    store
        .set_status(job_id, taskforge_core::JobStatus::Succeeded, None)
        .await
        .unwrap();

    let result = store.request_cancel(job_id).await;
    assert!(result.is_err(), "cancelling a succeeded job should fail");
}

#[tokio::test]
#[serial]
async fn is_cancel_requested_reflects_store_state() {
    let pool = setup_db().await;
    let store = PgStore::new(pool.clone());
    let job_id = insert_job(&pool, "demo.ok").await;

    assert!(!store.is_cancel_requested(job_id).await.unwrap());
    store.request_cancel(job_id).await.unwrap();
    assert!(store.is_cancel_requested(job_id).await.unwrap());
}
