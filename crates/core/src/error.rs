use uuid::Uuid;

/// Error kinds from spec §7. `sqlx::Error` is captured, not swallowed, so
/// callers that need the underlying driver error (retry heuristics, logging)
/// can still get at it via `source()`.
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown definition: {key}@{version}")]
    UnknownDefinition { key: String, version: i32 },

    #[error("transient store error: {0}")]
    TransientStore(#[source] sqlx::Error),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("cancellation")]
    Cancellation,

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("lease lost for job {job_id}")]
    LeaseLost { job_id: Uuid },
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db_err) => {
                // Postgres unique_violation on the idempotency partial index.
                if db_err.code().as_deref() == Some("23505") {
                    return CoreError::Validation(
                        "duplicate idempotency_key for definition".to_string(),
                    );
                }
                // foreign_key_violation: definition_ref doesn't exist.
                if db_err.code().as_deref() == Some("23503") {
                    return CoreError::UnknownDefinition {
                        key: String::new(),
                        version: 0,
                    };
                }
                CoreError::TransientStore(e)
            }
            _ => CoreError::TransientStore(e),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
