use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use std::env;
use taskforge_core::facade::JobForge;
use taskforge_core::store::PgStore;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!(
            "taskforgectl <command>\n\
             Commands:\n\
             - reset\n\
             - seed <n>\n\
             - demo\n\
             - timeline <job_id>\n\
             - dlq\n\
             - retry-dlq <dlq_id>\n\
             \n\
             Uses DATABASE_URL or TEST_DATABASE_URL.\n"
        );
        std::process::exit(2);
    }

    let url = env::var("DATABASE_URL")
        .or_else(|_| env::var("TEST_DATABASE_URL"))
        .expect("DATABASE_URL or TEST_DATABASE_URL must be set");

    let pool = PgPoolOptions::new().max_connections(5).connect(&url).await?;
    let store = PgStore::new(pool.clone());
    let app = JobForge::new(store.clone());

    match args[1].as_str() {
        "reset" => reset(&pool).await?,
        "seed" => {
            let n: i64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(10);
            seed(&pool, &app, n).await?;
        }
        "demo" => {
            reset(&pool).await?;
            seed(&pool, &app, 5).await?;
            show_counts(&pool).await?;
        }
        "timeline" => {
            let id = args.get(2).expect("usage: taskforgectl timeline <job_id>");
            let job_id: Uuid = id.parse()?;
            print_timeline(&app, job_id).await?;
        }
        "dlq" => print_dlq(&app).await?,
        "retry-dlq" => {
            let id = args.get(2).expect("usage: taskforgectl retry-dlq <dlq_id>");
            let dlq_id: Uuid = id.parse()?;
            let job_id = app.retry_dlq(dlq_id, None).await?;
            println!("resubmitted as job {job_id}");
        }
        other => {
            eprintln!("unknown command: {other}");
            std::process::exit(2);
        }
    }

    Ok(())
}

async fn reset(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    sqlx::query("TRUNCATE TABLE job_events, jobs_dlq, jobs RESTART IDENTITY CASCADE")
        .execute(pool)
        .await?;
    println!("reset OK");
    Ok(())
}

async fn ensure_demo_definitions(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    let store = PgStore::new(pool.clone());
    store.upsert_definition("demo.ok", 1, 5, 30, 0).await?;
    store.upsert_definition("demo.fail", 1, 5, 30, 0).await?;
    Ok(())
}

async fn seed(pool: &sqlx::PgPool, app: &JobForge, n: i64) -> anyhow::Result<()> {
    ensure_demo_definitions(pool).await?;
    for i in 0..n {
        let (key, version) = if i % 2 == 0 {
            ("demo.ok", 1)
        } else {
            ("demo.fail", 1)
        };
        let job = app
            .submit(key, version, json!({}), 0, None, None, None)
            .await?;
        println!("+ inserted job {key} id={}", job.id);
    }
    Ok(())
}

async fn show_counts(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    let queued: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status='queued'")
        .fetch_one(pool)
        .await?;
    let running: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status='running'")
        .fetch_one(pool)
        .await?;
    let dlq: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs_dlq")
        .fetch_one(pool)
        .await?;
    println!("jobs: queued={queued} running={running} dlq={dlq}");
    Ok(())
}

async fn print_timeline(app: &JobForge, job_id: Uuid) -> anyhow::Result<()> {
    let job = app
        .get_job(job_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job {job_id} not found"))?;

    println!(
        "JOB: id={} definition={}@{} status={} attempts={}/{} queued_at={} worker={:?}",
        job.id,
        job.definition_key,
        job.definition_version,
        job.status,
        job.attempts,
        job.max_attempts,
        job.queued_at,
        job.worker_id,
    );

    for event in app.get_events(job_id).await? {
        let at: DateTime<Utc> = event.at;
        println!(
            "{} | {} | {}",
            at.to_rfc3339(),
            event.event_type,
            event.payload.map(|v| v.to_string()).unwrap_or_default()
        );
    }

    Ok(())
}

async fn print_dlq(app: &JobForge) -> anyhow::Result<()> {
    for row in app.list_dlq(50).await? {
        println!(
            "{} | {}@{} | attempts={}/{} | {}",
            row.id,
            row.definition_key,
            row.definition_version,
            row.attempts,
            row.max_attempts,
            row.error_summary.unwrap_or_default()
        );
    }
    Ok(())
}
