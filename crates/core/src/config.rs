// Central, typed runtime configuration loaded from environment variables.
// Every knob has a `JOBFORGE_<NAME>` primary var and a bare `<NAME>` fallback,
// following the teacher repo's env_or_fallback convention.

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,

    pub max_concurrent: usize,
    pub lease_duration_seconds: i64,
    pub heartbeat_interval_seconds: i64,
    pub cancel_grace_ms: u64,
    pub poll_interval_seconds: u64,
    pub cancel_check_interval_ms: u64,

    pub backoff_base_seconds: f64,
    pub backoff_max_seconds: f64,
    pub backoff_jitter: f64,

    pub process_isolation: bool,
    pub migrate_on_startup: bool,
    pub admin_addr: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let worker_id = env_or_fallback("JOBFORGE_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()));

        let max_concurrent = env_or_fallback("JOBFORGE_MAX_CONCURRENT", "MAX_CONCURRENT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let lease_duration_seconds =
            env_or_fallback("JOBFORGE_LEASE_DURATION", "LEASE_DURATION")
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);

        let heartbeat_interval_seconds =
            env_or_fallback("JOBFORGE_HEARTBEAT_INTERVAL", "HEARTBEAT_INTERVAL")
                .and_then(|s| s.parse().ok())
                .unwrap_or(10);

        let cancel_grace_ms = env_or_fallback("JOBFORGE_CANCEL_GRACE_MS", "CANCEL_GRACE_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);

        let poll_interval_seconds =
            env_or_fallback("JOBFORGE_POLL_INTERVAL", "POLL_INTERVAL")
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);

        let cancel_check_interval_ms = env_or_fallback(
            "JOBFORGE_CANCEL_CHECK_INTERVAL_MS",
            "CANCEL_CHECK_INTERVAL_MS",
        )
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);

        let backoff_base_seconds =
            env_or_fallback("JOBFORGE_BACKOFF_BASE_SECONDS", "BACKOFF_BASE_SECONDS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(1.0);

        let backoff_max_seconds =
            env_or_fallback("JOBFORGE_BACKOFF_MAX_SECONDS", "BACKOFF_MAX_SECONDS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(3600.0);

        let backoff_jitter = env_or_fallback("JOBFORGE_BACKOFF_JITTER", "BACKOFF_JITTER")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.3);

        let process_isolation = env_bool("JOBFORGE_PROCESS_ISOLATION").unwrap_or(false);
        let migrate_on_startup = env_bool("JOBFORGE_MIGRATE_ON_STARTUP").unwrap_or(false);

        let admin_addr = env_or_fallback("JOBFORGE_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        Ok(Self {
            database_url,
            worker_id,
            max_concurrent,
            lease_duration_seconds,
            heartbeat_interval_seconds,
            cancel_grace_ms,
            poll_interval_seconds,
            cancel_check_interval_ms,
            backoff_base_seconds,
            backoff_max_seconds,
            backoff_jitter,
            process_isolation,
            migrate_on_startup,
            admin_addr,
        })
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
