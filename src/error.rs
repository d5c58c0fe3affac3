use crate::generation::attempt::GenerationAttempt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryBuilderError {
    #[error("Unknown fragment '{id}'{hint}")]
    UnknownFragment { id: String, hint: String },

    #[error("Fragments '{first}' and '{second}' conflict and cannot be used together")]
    Conflict { first: String, second: String },

    #[error("Dependency cycle among fragments: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("Composition error: {0}")]
    Composition(String),

    #[error("Generation service unavailable: {reason}")]
    CollaboratorUnavailable {
        reason: String,
        attempts: Vec<GenerationAttempt>,
    },

    #[error("No valid SQL was produced after {max_attempts} attempts")]
    AttemptsExhausted {
        max_attempts: u32,
        attempts: Vec<GenerationAttempt>,
    },

    #[error("Request cancelled")]
    Cancelled,

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueryBuilderError {
    /// Attempt trace attached to a terminal generation failure.
    pub fn attempt_trace(&self) -> Option<&[GenerationAttempt]> {
        match self {
            QueryBuilderError::CollaboratorUnavailable { attempts, .. }
            | QueryBuilderError::AttemptsExhausted { attempts, .. } => Some(attempts),
            _ => None,
        }
    }

    /// Errors caused by the request itself rather than by generation quality.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            QueryBuilderError::UnknownFragment { .. }
                | QueryBuilderError::Conflict { .. }
                | QueryBuilderError::DependencyCycle { .. }
                | QueryBuilderError::Composition(_)
        )
    }

    pub fn status_code(&self) -> u16 {
        match self {
            e if e.is_client_error() => 400,
            QueryBuilderError::AttemptsExhausted { .. } => 422,
            QueryBuilderError::CollaboratorUnavailable { .. } => 503,
            QueryBuilderError::Cancelled => 499,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, QueryBuilderError>;
