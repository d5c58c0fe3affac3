//! Fragment repository
//!
//! Reads the `query_fragments` table into an immutable registry snapshot.
//! List columns may be `text[]`, `jsonb`, or text holding a JSON array;
//! `to_jsonb` normalizes all three so the record decoder handles them.

use crate::error::{QueryBuilderError, Result};
use crate::fragment::{EncodedList, FragmentRecord, FragmentRegistry};
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::info;

const LOAD_FRAGMENTS: &str = r#"
    SELECT id,
           name,
           COALESCE(description, '') AS description,
           type AS fragment_type,
           snippet,
           COALESCE(category, '') AS category,
           subcategory,
           to_jsonb(tables) AS tables,
           to_jsonb(dependencies) AS dependencies,
           to_jsonb(conflicts) AS conflicts,
           to_jsonb(tags) AS tags,
           COALESCE(is_active, true) AS is_active,
           COALESCE(sort_order, 0) AS sort_order
    FROM query_fragments
    ORDER BY id
"#;

pub struct FragmentRepository {
    pool: PgPool,
}

impl FragmentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Load every row (active or not) as a new snapshot
    pub async fn load_snapshot(&self) -> Result<FragmentRegistry> {
        let rows = sqlx::query(LOAD_FRAGMENTS)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QueryBuilderError::Metadata(format!("Failed to load fragments: {}", e)))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(FragmentRecord {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                description: row.try_get("description")?,
                fragment_type: row.try_get("fragment_type")?,
                snippet: row.try_get("snippet")?,
                category: row.try_get("category")?,
                subcategory: row.try_get("subcategory")?,
                tables: list_column(&row, "tables")?,
                dependencies: list_column(&row, "dependencies")?,
                conflicts: list_column(&row, "conflicts")?,
                tags: list_column(&row, "tags")?,
                is_active: row.try_get("is_active")?,
                sort_order: row.try_get("sort_order")?,
            });
        }

        let version = format!("db-{}", Utc::now().format("%Y%m%dT%H%M%S"));
        let registry = FragmentRegistry::from_records(records, version)?;
        info!(
            "📦 Loaded {} fragments from database (snapshot {})",
            registry.len(),
            registry.version()
        );
        Ok(registry)
    }
}

fn list_column(row: &sqlx::postgres::PgRow, column: &str) -> Result<Option<EncodedList>> {
    let value: Option<serde_json::Value> = row.try_get(column)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value).map(Some).map_err(|e| {
            QueryBuilderError::Metadata(format!("Column '{}' is not a list: {}", column, e))
        }),
    }
}
