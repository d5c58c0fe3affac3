//! Query Builder Service
//!
//! Entry point used by the CLI and the HTTP server. Wraps the orchestrator
//! with the current registry snapshot, the view catalog and an optional
//! executor, and shapes results into the API responses.

use crate::cancel::CancellationToken;
use crate::catalog::{ViewCatalog, ViewDefinition};
use crate::config::EngineConfig;
use crate::db::{self, FragmentRepository, PgQueryExecutor, QueryExecutor, Row};
use crate::error::{QueryBuilderError, Result};
use crate::format::format_sql;
use crate::fragment::{Fragment, FragmentRegistry, RegistryHandle, ResolvedQuery};
use crate::generation::{
    Enhancement, GeneratedQuery, GenerationAttempt, GenerationOrchestrator, GenerationRequest,
    StructuredFilter,
};
use crate::llm::LlmClient;
use crate::validator::{QueryMode, SafetyValidator, ValidatorPolicy};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentQueryRequest {
    pub prompt: String,
    #[serde(default)]
    pub filters: Vec<StructuredFilter>,
    #[serde(default)]
    pub enhancements: Vec<Enhancement>,
    #[serde(default)]
    pub paginate: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewQueryRequest {
    pub prompt: String,
    #[serde(default)]
    pub execute: bool,
    #[serde(default)]
    pub filters: Vec<StructuredFilter>,
    #[serde(default)]
    pub enhancements: Vec<Enhancement>,
    #[serde(default)]
    pub paginate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExplanationSection {
    pub name: String,
    pub description: String,
    pub sql: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryExplanation {
    pub summary: String,
    pub sections: Vec<ExplanationSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentMetadata {
    pub fragments_used: Vec<String>,
    pub warnings: Vec<String>,
    pub attempt_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewMetadata {
    pub referenced_views: Vec<String>,
    pub warnings: Vec<String>,
    pub attempt_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugInfo {
    pub attempts: Vec<GenerationAttempt>,
    pub total_attempts: usize,
}

impl DebugInfo {
    fn new(attempts: Vec<GenerationAttempt>) -> Self {
        Self {
            total_attempts: attempts.len(),
            attempts,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentQueryResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<QueryExplanation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FragmentMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<DebugInfo>,
}

impl FragmentQueryResponse {
    pub fn from_error(error: &QueryBuilderError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            details: failure_details(error),
            debug_info: error.attempt_trace().map(|a| DebugInfo::new(a.to_vec())),
            ..Default::default()
        }
    }

    pub fn without_debug_info(mut self) -> Self {
        self.debug_info = None;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewQueryResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Row>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ViewMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<DebugInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
}

impl ViewQueryResponse {
    pub fn from_error(error: &QueryBuilderError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            details: failure_details(error),
            debug_info: error.attempt_trace().map(|a| DebugInfo::new(a.to_vec())),
            ..Default::default()
        }
    }

    pub fn without_debug_info(mut self) -> Self {
        self.debug_info = None;
        self
    }
}

/// Validation errors of the last recorded attempt
fn failure_details(error: &QueryBuilderError) -> Option<Vec<String>> {
    error
        .attempt_trace()
        .and_then(|attempts| attempts.last())
        .map(|last| last.validation.errors.clone())
        .filter(|errors| !errors.is_empty())
}

fn explain(generated: &GeneratedQuery, resolved: &ResolvedQuery) -> QueryExplanation {
    let summary = generated.explanation.clone().unwrap_or_else(|| {
        format!(
            "Combined {} fragments: {}",
            resolved.fragments.len(),
            resolved.fragment_ids().join(", ")
        )
    });
    QueryExplanation {
        summary,
        sections: resolved
            .fragments
            .iter()
            .map(|f| ExplanationSection {
                name: f.name.clone(),
                description: f.description.clone(),
                sql: f.snippet.trim().to_string(),
            })
            .collect(),
    }
}

pub struct QueryBuilderService {
    registry: RegistryHandle,
    catalog: Arc<ViewCatalog>,
    orchestrator: GenerationOrchestrator,
    executor: Option<Arc<dyn QueryExecutor>>,
}

impl QueryBuilderService {
    pub fn new(registry: RegistryHandle, catalog: ViewCatalog, orchestrator: GenerationOrchestrator) -> Self {
        Self {
            registry,
            catalog: Arc::new(catalog),
            orchestrator,
            executor: None,
        }
    }

    /// Wire up the production components described by `config`.
    ///
    /// Fragments come from `FRAGMENTS_PATH` when set, else from the database;
    /// the executor is only attached when a database is configured.
    pub async fn from_config(config: &EngineConfig) -> Result<Self> {
        let pool = match &config.database_url {
            Some(url) => Some(db::connect(url, 10).await?),
            None => None,
        };

        let registry = match (&config.fragments_path, &pool) {
            (Some(path), _) => FragmentRegistry::load(path)?,
            (None, Some(pool)) => FragmentRepository::new(pool.clone()).load_snapshot().await?,
            (None, None) => {
                warn!("No FRAGMENTS_PATH or DATABASE_URL configured; fragment mode has no fragments");
                FragmentRegistry::new(Vec::new(), "empty")?
            }
        };

        let catalog = match &config.view_catalog_path {
            Some(path) => ViewCatalog::load(path)?,
            None => ViewCatalog::default_catalog(),
        };

        let collaborator = Arc::new(LlmClient::from_settings(&config.llm)?);
        info!("Using model {}", collaborator.model());
        let orchestrator = GenerationOrchestrator::new(
            collaborator,
            SafetyValidator::new(ValidatorPolicy {
                strict: config.strict_blocklist,
            }),
            config.generation,
        );

        let service = Self::new(RegistryHandle::new(registry), catalog, orchestrator);
        Ok(match pool {
            Some(pool) => service.with_executor(Arc::new(PgQueryExecutor::new(
                pool,
                config.max_rows,
                config.statement_timeout,
            ))),
            None => service,
        })
    }

    pub fn with_executor(mut self, executor: Arc<dyn QueryExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn active_fragments(&self) -> Vec<Fragment> {
        self.registry.snapshot().active().cloned().collect()
    }

    pub fn views(&self) -> Vec<ViewDefinition> {
        self.catalog.views().cloned().collect()
    }

    pub async fn generate_fragment(
        &self,
        request: &FragmentQueryRequest,
        cancel: &CancellationToken,
    ) -> Result<FragmentQueryResponse> {
        let generation = GenerationRequest {
            prompt: request.prompt.clone(),
            mode: QueryMode::Fragment,
            filters: request.filters.clone(),
            enhancements: request.enhancements.clone(),
            paginate: request.paginate,
        };
        // One snapshot for the whole request, even if a reload lands midway.
        let registry = self.registry.snapshot();
        let generated = self
            .orchestrator
            .run(&generation, &registry, &self.catalog, cancel)
            .await?;

        let resolved = generated.resolved.as_ref().ok_or_else(|| {
            QueryBuilderError::Composition("Fragment generation produced no resolved fragments".to_string())
        })?;
        info!(
            "Fragment query built from {} fragments (registry {})",
            resolved.fragments.len(),
            registry.version()
        );

        Ok(FragmentQueryResponse {
            success: true,
            sql: Some(generated.sql.clone()),
            formatted_sql: Some(format_sql(&generated.sql)),
            explanation: Some(explain(&generated, resolved)),
            metadata: Some(FragmentMetadata {
                fragments_used: resolved.fragment_ids(),
                warnings: generated.validation.warnings.clone(),
                attempt_count: generated.attempts.len(),
            }),
            error: None,
            details: None,
            debug_info: Some(DebugInfo::new(generated.attempts.clone())),
        })
    }

    /// View-mode generation. An execution failure after successful
    /// generation still returns the validated SQL and trace, with
    /// `success: false`.
    pub async fn generate_view(
        &self,
        request: &ViewQueryRequest,
        cancel: &CancellationToken,
    ) -> Result<ViewQueryResponse> {
        let (response, _) = self.run_view(request, cancel).await?;
        Ok(response)
    }

    async fn run_view(
        &self,
        request: &ViewQueryRequest,
        cancel: &CancellationToken,
    ) -> Result<(ViewQueryResponse, Option<QueryBuilderError>)> {
        let generation = GenerationRequest {
            prompt: request.prompt.clone(),
            mode: QueryMode::View,
            filters: request.filters.clone(),
            enhancements: request.enhancements.clone(),
            paginate: request.paginate,
        };
        let registry = self.registry.snapshot();
        let generated = self
            .orchestrator
            .run(&generation, &registry, &self.catalog, cancel)
            .await?;

        let mut response = ViewQueryResponse {
            success: true,
            sql: Some(generated.sql.clone()),
            formatted_sql: Some(format_sql(&generated.sql)),
            explanation: generated.explanation.clone(),
            data: None,
            metadata: Some(ViewMetadata {
                referenced_views: generated.validation.referenced_views.clone(),
                warnings: generated.validation.warnings.clone(),
                attempt_count: generated.attempts.len(),
                row_count: None,
                truncated: None,
            }),
            debug_info: Some(DebugInfo::new(generated.attempts)),
            error: None,
            details: None,
        };

        if !request.execute {
            return Ok((response, None));
        }

        // Only SQL that passed validation reaches this point.
        let executed = match &self.executor {
            Some(executor) => executor.execute(&generated.sql).await,
            None => Err(QueryBuilderError::Config(
                "Execution requested but no database is configured".to_string(),
            )),
        };

        match executed {
            Ok(rows) => {
                if let Some(metadata) = response.metadata.as_mut() {
                    metadata.row_count = Some(rows.row_count);
                    metadata.truncated = Some(rows.truncated);
                }
                response.data = Some(rows.rows);
                Ok((response, None))
            }
            Err(e) => {
                warn!("Execution failed: {}", e);
                response.success = false;
                response.error = Some(e.to_string());
                Ok((response, Some(e)))
            }
        }
    }

    /// Status code and body for a fragment request; failures become bodies.
    pub async fn respond_fragment(
        &self,
        request: &FragmentQueryRequest,
        cancel: &CancellationToken,
    ) -> (u16, FragmentQueryResponse) {
        match self.generate_fragment(request, cancel).await {
            Ok(response) => (200, response),
            Err(e) => {
                warn!("Fragment generation failed: {}", e);
                (e.status_code(), FragmentQueryResponse::from_error(&e))
            }
        }
    }

    pub async fn respond_view(
        &self,
        request: &ViewQueryRequest,
        cancel: &CancellationToken,
    ) -> (u16, ViewQueryResponse) {
        match self.run_view(request, cancel).await {
            Ok((response, None)) => (200, response),
            Ok((response, Some(e))) => (e.status_code(), response),
            Err(e) => {
                warn!("View generation failed: {}", e);
                (e.status_code(), ViewQueryResponse::from_error(&e))
            }
        }
    }
}
