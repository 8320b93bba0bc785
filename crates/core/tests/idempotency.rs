mod common;

use common::{seed_definition, setup_db};
use serial_test::serial;
use taskforge_core::store::PgStore;
use taskforge_core::{JobStatus, NewJob};

fn new_job(key: &str, idempotency_key: Option<&str>) -> NewJob {
    NewJob {
        definition_key: key.to_string(),
        definition_version: 1,
        params: serde_json::json!({}),
        priority: 0,
        max_attempts: 3,
        scheduled_at: None,
        idempotency_key: idempotency_key.map(str::to_string),
    }
}

#[tokio::test]
#[serial]
async fn duplicate_submission_with_same_key_returns_same_job() {
    let pool = setup_db().await;
    seed_definition(&pool, "demo.ok", 1).await;
    let store = PgStore::new(pool.clone());

    let first = store.insert_job(new_job("demo.ok", Some("order-42"))).await.unwrap();
    let second = store.insert_job(new_job("demo.ok", Some("order-42"))).await.unwrap();

    assert_eq!(first.id, second.id, "same idempotency key must not create a second job");
}

#[tokio::test]
#[serial]
async fn concurrent_duplicate_submissions_converge_on_one_winner() {
    let pool = setup_db().await;
    seed_definition(&pool, "demo.ok", 1).await;
    let store = PgStore::new(pool.clone());

    let store_a = store.clone();
    let store_b = store.clone();

    let (a, b) = tokio::join!(
        async move { store_a.insert_job(new_job("demo.ok", Some("race-key"))).await.unwrap() },
        async move { store_b.insert_job(new_job("demo.ok", Some("race-key"))).await.unwrap() },
    );

    assert_eq!(a.id, b.id);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE idempotency_key = 'race-key'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
#[serial]
async fn new_submission_after_terminal_state_gets_a_fresh_job() {
    let pool = setup_db().await;
    seed_definition(&pool, "demo.ok", 1).await;
    let store = PgStore::new(pool.clone());

    let first = store.insert_job(new_job("demo.ok", Some("retry-me"))).await.unwrap();
    store.set_status(first.id, JobStatus::Succeeded, None).await.unwrap();

    let second = store.insert_job(new_job("demo.ok", Some("retry-me"))).await.unwrap();
    assert_ne!(first.id, second.id, "a terminal job must not block reuse of its idempotency key");
}

#[tokio::test]
#[serial]
async fn submission_against_unknown_definition_is_rejected() {
    let pool = setup_db().await;
    let store = PgStore::new(pool.clone());

    let result = store.insert_job(new_job("does.not.exist", None)).await;
    assert!(matches!(result, Err(taskforge_core::CoreError::UnknownDefinition { .. })));
}
