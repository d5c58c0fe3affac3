//! Correction prompt
//!
//! Built after a failed attempt and sent as the next attempt's prompt. The
//! collaborator is stateless, so the original prompt is repeated in full
//! after the failure report.

use crate::generation::attempt::GenerationAttempt;
use crate::validator::QueryMode;
use itertools::Itertools;
use std::collections::BTreeSet;

pub fn build_correction_prompt(
    initial_prompt: &str,
    failed: &GenerationAttempt,
    mode: QueryMode,
    allowed_objects: &BTreeSet<String>,
) -> String {
    let mut prompt_parts = Vec::new();

    prompt_parts.push(format!(
        "RETRY ATTEMPT {}: the query from attempt {} failed validation.",
        failed.attempt_number + 1,
        failed.attempt_number
    ));
    prompt_parts.push(String::new());

    prompt_parts.push("FAILED SQL:".to_string());
    if failed.sql.trim().is_empty() {
        prompt_parts.push("(no SQL was produced)".to_string());
    } else {
        prompt_parts.push(failed.sql.trim().to_string());
    }
    if mode == QueryMode::Fragment && !failed.fragment_ids.is_empty() {
        prompt_parts.push(format!("SELECTED FRAGMENTS: {}", failed.fragment_ids.join(", ")));
    }
    prompt_parts.push(String::new());

    prompt_parts.push("VALIDATION ERRORS:".to_string());
    for error in &failed.validation.errors {
        prompt_parts.push(format!("- {}", error));
    }
    prompt_parts.push(String::new());

    prompt_parts.push(
        "Regenerate a corrected query that fixes every error above and answers the same original request."
            .to_string(),
    );
    match mode {
        QueryMode::View => prompt_parts.push(format!(
            "Reference only these views: {}",
            allowed_objects.iter().join(", ")
        )),
        QueryMode::Fragment => prompt_parts.push(format!(
            "Select only from these fragment ids: {}",
            allowed_objects.iter().join(", ")
        )),
    }

    prompt_parts.push(String::new());
    prompt_parts.push("ORIGINAL PROMPT:".to_string());
    prompt_parts.push(initial_prompt.to_string());

    prompt_parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::ValidationResult;
    use chrono::Utc;

    fn failed_attempt(sql: &str, errors: &[&str]) -> GenerationAttempt {
        GenerationAttempt {
            attempt_number: 1,
            sql: sql.to_string(),
            fragment_ids: Vec::new(),
            validation: ValidationResult::failed(errors.iter().map(|e| e.to_string()).collect()),
            correction_prompt: None,
            started_at: Utc::now(),
            elapsed_ms: 5,
        }
    }

    #[test]
    fn test_contains_sql_and_errors_verbatim() {
        let allowed: BTreeSet<String> = ["llm_school_directory".to_string()].into_iter().collect();
        let attempt = failed_attempt(
            "SELECT * FROM secret_table",
            &["Unknown view 'secret_table': only approved catalog views may be referenced"],
        );
        let prompt = build_correction_prompt("REQUEST: schools", &attempt, QueryMode::View, &allowed);

        assert!(prompt.starts_with("RETRY ATTEMPT 2"));
        assert!(prompt.contains("SELECT * FROM secret_table"));
        assert!(prompt.contains(
            "- Unknown view 'secret_table': only approved catalog views may be referenced"
        ));
        assert!(prompt.contains("Reference only these views: llm_school_directory"));
        assert!(prompt.ends_with("REQUEST: schools"));
    }

    #[test]
    fn test_deterministic_and_handles_missing_sql() {
        let allowed = BTreeSet::new();
        let attempt = failed_attempt("", &["SQL is empty"]);
        let first = build_correction_prompt("p", &attempt, QueryMode::Fragment, &allowed);
        let second = build_correction_prompt("p", &attempt, QueryMode::Fragment, &allowed);
        assert_eq!(first, second);
        assert!(first.contains("(no SQL was produced)"));
    }
}
