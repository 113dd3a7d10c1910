pub mod calendar;
pub mod entities;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod sync;
pub mod tokens;
pub mod webhooks;

use opsdesk_common::error::{OpsError, OpsResult};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Create a Postgres connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> OpsResult<PgPool> {
    tracing::info!("connecting to database");
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|e| OpsError::Database(e.to_string()))
}

/// Apply the embedded, versioned schema migrations.
pub async fn run_migrations(pool: &PgPool) -> OpsResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| OpsError::Database(format!("migration failed: {e}")))?;
    tracing::info!("database migrations applied");
    Ok(())
}

/// Map a write error, surfacing unique-constraint violations as conflicts.
pub(crate) fn map_write_error(err: sqlx::Error, conflict_msg: &str) -> OpsError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            OpsError::Conflict(conflict_msg.to_string())
        }
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            OpsError::NotFound(db.message().to_string())
        }
        _ => OpsError::Database(err.to_string()),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Connect to `TEST_DATABASE_URL` and migrate, or `None` to skip the test.
    pub async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = create_pool(&url).await.expect("db should connect");
        run_migrations(&pool).await.expect("migrations should apply");
        Some(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_pool_fails_with_invalid_url() {
        let result = create_pool("postgres://invalid:5432/nonexistent").await;
        assert!(result.is_err());
    }
}
