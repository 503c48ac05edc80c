//! PostgreSQL access layer for job persistence.
//!
//! All SQL lives in the repositories below. Callers outside this module go
//! through [`Storage`] so the schema can evolve without touching dispatch
//! logic.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::info;

pub mod jobs;
mod schema;

use crate::error::Result;

/// Container for repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for job records.
    pub jobs: Arc<jobs::Repository>,
}

impl Storage {
    /// Creates a storage instance over the given pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self { jobs: Arc::new(jobs::Repository::new(pool)) }
    }

    /// Creates the `jobs` table and its indexes when missing.
    ///
    /// # Errors
    ///
    /// Returns an error if any DDL statement fails.
    pub async fn migrate(&self) -> Result<()> {
        let pool = self.jobs.pool();

        for statement in schema::STATEMENTS {
            sqlx::query(statement).execute(&*pool).await?;
        }

        info!(statements = schema::STATEMENTS.len(), "job schema is up to date");
        Ok(())
    }

    /// Verifies the database answers a trivial query.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::StoreUnavailable` when the pool cannot hand out a
    /// working connection.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.jobs.pool()).await?;

        Ok(())
    }

    /// Closes every pooled connection. Later queries fail with
    /// `StoreUnavailable`.
    pub async fn close(&self) {
        self.jobs.pool().close().await;
    }

    /// Whether [`Storage::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.jobs.pool().is_closed()
    }
}
