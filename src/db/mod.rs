//! Durable store bootstrap
//!
//! Both services refuse to serve traffic over a half-provisioned
//! database, so the pool, the idempotent DDL, and the schema check
//! are one startup step: `Database::bootstrap` either returns a
//! ready pool or an error the binary turns into a non-zero exit.

pub mod schema;

use std::time::Duration;

use anyhow::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};

const MAX_CONNECTIONS: u32 = 20;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared PostgreSQL pool, schema-verified before anyone queries it
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect, apply the DDL, and verify every required table
    /// exists.
    pub async fn bootstrap(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await?;
        schema::init_schema(&pool).await?;
        schema::verify_schema(&pool).await?;
        tracing::info!("Durable store ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
