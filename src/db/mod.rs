//! PostgreSQL access
//!
//! Loads fragment registry snapshots and runs validated queries read-only.
//! The pool is created by the caller and passed in; there is no global pool.

pub mod executor;
pub mod fragment_repo;

pub use executor::{PgQueryExecutor, QueryExecutor, QueryRows, Row};
pub use fragment_repo::FragmentRepository;

use crate::error::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

pub type DbPool = PgPool;

/// Open a pool and check it with `SELECT 1`
pub async fn connect(database_url: &str, max_connections: u32) -> Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;
    info!("Connected to PostgreSQL (max {} connections)", max_connections);

    Ok(pool)
}
