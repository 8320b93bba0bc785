mod common;

use common::{seed_definition, setup_db};
use serial_test::serial;
use sqlx::PgPool;
use std::time::Duration;
use taskforge_core::scheduler::Scheduler;
use taskforge_core::store::PgStore;
use uuid::Uuid;

async fn insert_schedule(pool: &PgPool, key: &str, cron_expr: &str) -> Uuid {
    seed_definition(pool, key, 1).await;
    sqlx::query_scalar(
        r#"
        INSERT INTO schedules (definition_key, definition_version, cron_expression, params, priority, enabled)
        VALUES ($1, 1, $2, '{}'::jsonb, 0, true)
        RETURNING id
        "#,
    )
    .bind(key)
    .bind(cron_expr)
    .fetch_one(pool)
    .await
    .unwrap()
}

#[tokio::test]
#[serial]
async fn due_schedule_enqueues_a_job_and_stamps_last_enqueued_at() {
    let pool = setup_db().await;
    let store = PgStore::new(pool.clone());
    let scheduler = Scheduler::new(store.clone(), pool.clone(), Duration::from_secs(5));

    // fires every second, so it is always immediately due against a fresh schedule row.
    let schedule_id = insert_schedule(&pool, "demo.ok", "* * * * * *").await;

    scheduler.tick_once().await.unwrap();

    let jobs = store.list_jobs(Some("queued"), 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].definition_key, "demo.ok");

    let last_enqueued: Option<chrono::DateTime<chrono::Utc>> =
        sqlx::query_scalar("SELECT last_enqueued_at FROM schedules WHERE id = $1")
            .bind(schedule_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(last_enqueued.is_some());
}

#[tokio::test]
#[serial]
async fn a_schedule_does_not_fire_twice_in_the_same_tick() {
    let pool = setup_db().await;
    let store = PgStore::new(pool.clone());
    let scheduler = Scheduler::new(store.clone(), pool.clone(), Duration::from_secs(5));

    let _schedule_id = insert_schedule(&pool, "demo.ok", "* * * * * *").await;

    scheduler.tick_once().await.unwrap();
    scheduler.tick_once().await.unwrap();

    let jobs = store.list_jobs(Some("queued"), 10).await.unwrap();
    assert_eq!(jobs.len(), 1, "a second immediate tick must not double-fire");
}

#[tokio::test]
#[serial]
async fn disabled_schedule_never_fires() {
    let pool = setup_db().await;
    let store = PgStore::new(pool.clone());
    let scheduler = Scheduler::new(store.clone(), pool.clone(), Duration::from_secs(5));

    seed_definition(&pool, "demo.ok", 1).await;
    sqlx::query(
        r#"
        INSERT INTO schedules (definition_key, definition_version, cron_expression, params, priority, enabled)
        VALUES ('demo.ok', 1, '* * * * * *', '{}'::jsonb, 0, false)
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();

    scheduler.tick_once().await.unwrap();

    let jobs = store.list_jobs(None, 10).await.unwrap();
    assert!(jobs.is_empty());
}
