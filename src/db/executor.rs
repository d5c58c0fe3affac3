//! Query executor
//!
//! Runs already-validated SQL inside a read-only transaction with a
//! statement timeout and a row cap. Rows come back as JSON objects.

use crate::error::{QueryBuilderError, Result};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::{PgPool, Row as _};
use std::time::Duration;
use tracing::{debug, info};

pub type Row = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRows {
    pub rows: Vec<Row>,
    pub row_count: usize,
    /// More rows existed than the cap allowed
    pub truncated: bool,
}

impl QueryRows {
    pub fn from_rows(mut rows: Vec<Row>, max_rows: usize) -> Self {
        let truncated = rows.len() > max_rows;
        rows.truncate(max_rows);
        Self {
            row_count: rows.len(),
            rows,
            truncated,
        }
    }
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<QueryRows>;
}

pub struct PgQueryExecutor {
    pool: PgPool,
    max_rows: usize,
    statement_timeout: Duration,
}

impl PgQueryExecutor {
    pub fn new(pool: PgPool, max_rows: usize, statement_timeout: Duration) -> Self {
        Self {
            pool,
            max_rows,
            statement_timeout,
        }
    }
}

/// Wrap the statement so each row arrives as one JSON text column. One extra
/// row is fetched to detect truncation. The inner SQL sits on its own lines
/// so a trailing `--` comment cannot swallow the closing parenthesis.
fn wrap_for_json(sql: &str, max_rows: usize) -> String {
    let inner = sql.trim().trim_end_matches(';').trim_end();
    format!(
        "SELECT row_to_json(q)::text AS row_json FROM (\n{}\n) AS q LIMIT {}",
        inner,
        max_rows + 1
    )
}

#[async_trait]
impl QueryExecutor for PgQueryExecutor {
    async fn execute(&self, sql: &str) -> Result<QueryRows> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SET TRANSACTION READ ONLY").execute(&mut *tx).await?;
        let timeout = format!("SET LOCAL statement_timeout = {}", self.statement_timeout.as_millis());
        sqlx::query(&timeout).execute(&mut *tx).await?;

        let wrapped = wrap_for_json(sql, self.max_rows);
        debug!("Executing: {}", wrapped);
        let fetched = sqlx::query(&wrapped)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| QueryBuilderError::Execution(e.to_string()))?;
        tx.rollback().await?;

        let mut rows = Vec::with_capacity(fetched.len());
        for record in fetched {
            let text: String = record.try_get("row_json")?;
            rows.push(serde_json::from_str::<Row>(&text)?);
        }

        let result = QueryRows::from_rows(rows, self.max_rows);
        info!(
            "Query returned {} rows{}",
            result.row_count,
            if result.truncated { " (truncated)" } else { "" }
        );
        Ok(result)
    }
}
