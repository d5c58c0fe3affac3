use crate::validator::ValidationResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One generate-then-validate cycle, kept for the debug trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationAttempt {
    /// 1-based
    pub attempt_number: u32,
    pub sql: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fragment_ids: Vec<String>,
    pub validation: ValidationResult,
    /// Prompt sent for the next attempt when this one failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction_prompt: Option<String>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl GenerationAttempt {
    pub fn succeeded(&self) -> bool {
        self.validation.valid
    }
}
