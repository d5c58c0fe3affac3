//! Safety Validator
//!
//! Checks a candidate SQL string before anything may execute it. Every
//! candidate is treated as untrusted text, including SQL composed from
//! fragments. Validation is a pure function of its inputs.

use crate::error::QueryBuilderError;
use crate::sql_scan;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Keywords rejected in every context
pub const DESTRUCTIVE_KEYWORDS: &[&str] = &["drop", "update", "insert", "delete"];

/// Additional keywords rejected under the strict policy
pub const STRICT_KEYWORDS: &[&str] = &[
    "alter", "create", "truncate", "exec", "execute", "grant", "revoke",
];

fn keyword_pattern(keywords: &[&str]) -> Regex {
    // Word boundaries keep identifiers such as update_date or created_at legal.
    Regex::new(&format!(r"\b({})\b", keywords.join("|"))).unwrap()
}

lazy_static! {
    static ref STANDARD_BLOCKLIST: Regex = keyword_pattern(DESTRUCTIVE_KEYWORDS);
    static ref STRICT_BLOCKLIST: Regex = keyword_pattern(
        &DESTRUCTIVE_KEYWORDS
            .iter()
            .chain(STRICT_KEYWORDS.iter())
            .copied()
            .collect::<Vec<_>>()
    );
}

/// How a request composes its SQL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    #[default]
    Fragment,
    View,
}

impl QueryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMode::Fragment => "fragment",
            QueryMode::View => "view",
        }
    }
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryMode {
    type Err = QueryBuilderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fragment" | "fragments" => Ok(QueryMode::Fragment),
            "view" | "views" => Ok(QueryMode::View),
            other => Err(QueryBuilderError::Config(format!(
                "Unknown query mode '{}' (expected 'fragment' or 'view')",
                other
            ))),
        }
    }
}

/// Outcome of validating one candidate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub referenced_views: Vec<String>,
}

impl ValidationResult {
    /// `valid` is derived from `errors`; warnings never affect it.
    pub fn from_parts(errors: Vec<String>, warnings: Vec<String>, referenced_views: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
            referenced_views,
        }
    }

    pub fn failed(errors: Vec<String>) -> Self {
        Self::from_parts(errors, Vec::new(), Vec::new())
    }
}

/// Request context that only drives warnings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationHints {
    /// Results will be paged, so row order should be stable
    pub expects_pagination: bool,
    /// Objects some filter or enhancement asked for; joins outside it are flagged
    pub requested_objects: Option<BTreeSet<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorPolicy {
    pub strict: bool,
}

impl Default for ValidatorPolicy {
    fn default() -> Self {
        Self { strict: true }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SafetyValidator {
    policy: ValidatorPolicy,
}

impl SafetyValidator {
    pub fn new(policy: ValidatorPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ValidatorPolicy {
        self.policy
    }

    pub fn validate(&self, sql: &str, mode: QueryMode, known_objects: &BTreeSet<String>) -> ValidationResult {
        self.validate_with(sql, mode, known_objects, &ValidationHints::default())
    }

    pub fn validate_with(
        &self,
        sql: &str,
        mode: QueryMode,
        known_objects: &BTreeSet<String>,
        hints: &ValidationHints,
    ) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        // The blocklist runs before anything else looks at the text.
        for keyword in self.destructive_keywords(sql) {
            errors.push(format!(
                "Forbidden keyword {}: only read-only SELECT queries are allowed",
                keyword.to_uppercase()
            ));
        }

        let tokens = match sql_scan::tokenize(sql) {
            Ok(tokens) => tokens,
            Err(e) => {
                errors.push(format!("SQL could not be tokenized: {}", e));
                return ValidationResult::from_parts(errors, warnings, Vec::new());
            }
        };
        if tokens.is_empty() {
            errors.push("SQL is empty".to_string());
            return ValidationResult::from_parts(errors, warnings, Vec::new());
        }

        match sql_scan::leading_keyword(&tokens).as_deref() {
            Some("select") | Some("with") => {}
            Some(other) => errors.push(format!(
                "Only SELECT queries are allowed (statement starts with {})",
                other.to_uppercase()
            )),
            None => errors.push("Only SELECT queries are allowed".to_string()),
        }
        if sql_scan::statement_count(&tokens) > 1 {
            errors.push("Multiple SQL statements are not allowed".to_string());
        }
        if !sql_scan::parentheses_balanced(&tokens) {
            errors.push("Unbalanced parentheses".to_string());
        }
        if sql_scan::has_select_into(&tokens) {
            errors.push("SELECT INTO creates a table: only read-only SELECT queries are allowed".to_string());
        }

        // Without a parse there is no trustworthy object list, so the
        // candidate cannot pass.
        let scan = match sql_scan::scan_objects(sql) {
            Ok(scan) => scan,
            Err(e) => {
                if errors.is_empty() {
                    errors.push(format!("SQL could not be parsed: {}", e));
                }
                sql_scan::ObjectScan {
                    objects: sql_scan::fallback_objects(&tokens),
                    ..Default::default()
                }
            }
        };

        for name in &scan.objects {
            if !is_known(name, known_objects) {
                errors.push(match mode {
                    QueryMode::View => format!(
                        "Unknown view '{}': only approved catalog views may be referenced",
                        name
                    ),
                    QueryMode::Fragment => format!(
                        "Unknown table '{}': not provided by the selected fragments",
                        name
                    ),
                });
            }
        }
        for function in scan.disallowed_functions() {
            errors.push(format!(
                "Table function '{}' is not allowed as a FROM item",
                function
            ));
        }

        if sql_scan::has_select_star(&tokens) {
            warnings.push("Query uses SELECT *; list the needed columns explicitly".to_string());
        }
        if hints.expects_pagination && !sql_scan::has_order_by(&tokens) {
            warnings.push(
                "Query has no ORDER BY; paginated results may come back in an unstable order"
                    .to_string(),
            );
        }
        if let Some(requested) = &hints.requested_objects {
            for joined in &scan.joined {
                if is_known(joined, known_objects) && !is_known(joined, requested) {
                    warnings.push(format!(
                        "Join introduces '{}', which no filter or enhancement requested",
                        joined
                    ));
                }
            }
        }

        ValidationResult::from_parts(errors, warnings, scan.objects)
    }

    /// Distinct blocklisted keywords in order of first appearance
    pub fn destructive_keywords(&self, sql: &str) -> Vec<String> {
        let pattern: &Regex = if self.policy.strict {
            &*STRICT_BLOCKLIST
        } else {
            &*STANDARD_BLOCKLIST
        };

        let lowered = sql.to_lowercase();
        let mut found: Vec<String> = Vec::new();
        for m in pattern.find_iter(&lowered) {
            let keyword = m.as_str().to_string();
            if !found.contains(&keyword) {
                found.push(keyword);
            }
        }
        found
    }
}

/// Membership test; `public.x` matches a known `x`
fn is_known(name: &str, known: &BTreeSet<String>) -> bool {
    let name = name.to_lowercase();
    let unqualified = name.strip_prefix("public.").unwrap_or(&name);
    known
        .iter()
        .any(|k| k.eq_ignore_ascii_case(&name) || k.eq_ignore_ascii_case(unqualified))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_drop_rejected_in_every_mode() {
        let validator = SafetyValidator::default();
        let known = set(&["stu"]);
        for mode in [QueryMode::Fragment, QueryMode::View] {
            let result = validator.validate("SELECT * FROM STU; DROP TABLE STU", mode, &known);
            assert!(!result.valid);
            assert!(result.errors.iter().any(|e| e.contains("DROP")));
            assert!(result.errors.iter().any(|e| e.contains("Multiple SQL statements")));
        }
    }

    #[test]
    fn test_whitelisted_view_is_valid() {
        let validator = SafetyValidator::default();
        let result = validator.validate(
            "SELECT id FROM llm_student_demographics",
            QueryMode::View,
            &set(&["llm_student_demographics"]),
        );
        assert!(result.valid, "{:?}", result.errors);
        assert_eq!(result.referenced_views, vec!["llm_student_demographics"]);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_unknown_view_rejected() {
        let validator = SafetyValidator::default();
        let result = validator.validate(
            "SELECT id FROM secret_table",
            QueryMode::View,
            &set(&["llm_student_demographics"]),
        );
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("secret_table")));
        assert_eq!(result.referenced_views, vec!["secret_table"]);
    }

    #[test]
    fn test_whitelist_cannot_be_bypassed() {
        let validator = SafetyValidator::default();
        let known = set(&["llm_student_demographics"]);
        for sql in [
            r"SELECT E'\'' AS a FROM secret_table --'",
            "SELECT d.id FROM llm_student_demographics AS d(id), secret_table",
            "SELECT 1 FROM llm_student_demographics d, (SELECT 1) s, secret_table",
            "SELECT id FROM llm_student_demographics WHERE id IN (SELECT id FROM secret_table)",
        ] {
            let result = validator.validate(sql, QueryMode::View, &known);
            assert!(!result.valid, "{}", sql);
            assert!(result.referenced_views.contains(&"secret_table".to_string()), "{}", sql);
            assert!(result.errors.iter().any(|e| e.contains("secret_table")), "{}", sql);
        }
    }

    #[test]
    fn test_table_functions_need_allowance() {
        let validator = SafetyValidator::default();
        let result = validator.validate("SELECT * FROM pg_catalog.pg_ls_dir('.')", QueryMode::View, &set(&[]));
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("pg_catalog.pg_ls_dir")));

        let result = validator.validate(
            "SELECT d.id, g FROM llm_student_demographics d CROSS JOIN generate_series(1, 3) g",
            QueryMode::View,
            &set(&["llm_student_demographics"]),
        );
        assert!(result.valid, "{:?}", result.errors);
    }

    #[test]
    fn test_select_into_rejected() {
        let validator = SafetyValidator::default();
        let result = validator.validate(
            "SELECT id INTO new_table FROM llm_student_demographics",
            QueryMode::View,
            &set(&["llm_student_demographics"]),
        );
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("SELECT INTO")));
    }

    #[test]
    fn test_unparseable_sql_fails_closed() {
        let validator = SafetyValidator::default();
        let result = validator.validate(
            "SELECT id FROM llm_student_demographics WHERE",
            QueryMode::View,
            &set(&["llm_student_demographics"]),
        );
        assert!(!result.valid);
        assert!(result.errors[0].starts_with("SQL could not be parsed"));
        assert_eq!(result.referenced_views, vec!["llm_student_demographics"]);
    }

    #[test]
    fn test_whole_word_matching_avoids_column_names() {
        let validator = SafetyValidator::default();
        let result = validator.validate(
            "SELECT update_date, created_at, is_deleted FROM llm_student_enrollment",
            QueryMode::View,
            &set(&["llm_student_enrollment"]),
        );
        assert!(result.valid, "{:?}", result.errors);
    }

    #[test]
    fn test_strict_policy_controls_extended_keywords() {
        let sql = "SELECT 1 FROM t WHERE EXISTS (SELECT 1) AND x = 'truncate'";
        let strict = SafetyValidator::new(ValidatorPolicy { strict: true });
        let standard = SafetyValidator::new(ValidatorPolicy { strict: false });
        assert!(!strict.validate(sql, QueryMode::View, &set(&["t"])).valid);
        assert!(standard.validate(sql, QueryMode::View, &set(&["t"])).valid);
    }

    #[test]
    fn test_keywords_reported_once_in_order() {
        let validator = SafetyValidator::default();
        assert_eq!(
            validator.destructive_keywords("DELETE FROM a; Drop table b; delete from c"),
            vec!["delete", "drop"]
        );
    }

    #[test]
    fn test_empty_sql_rejected() {
        let validator = SafetyValidator::default();
        for sql in ["", "   \n\t", "-- nothing here"] {
            let result = validator.validate(sql, QueryMode::View, &set(&[]));
            assert!(!result.valid);
            assert_eq!(result.errors, vec!["SQL is empty"]);
        }
    }

    #[test]
    fn test_non_select_statement_rejected() {
        let validator = SafetyValidator::new(ValidatorPolicy { strict: false });
        let result = validator.validate("VACUUM students", QueryMode::Fragment, &set(&["students"]));
        assert!(!result.valid);
        assert!(result.errors[0].contains("VACUUM"));
    }

    #[test]
    fn test_fragment_mode_uses_fragment_tables() {
        let validator = SafetyValidator::default();
        let known = set(&["students", "schools"]);
        let ok = validator.validate(
            "SELECT s.id FROM students s JOIN public.schools sch ON sch.id = s.school_id",
            QueryMode::Fragment,
            &known,
        );
        assert!(ok.valid, "{:?}", ok.errors);

        let bad = validator.validate("SELECT s.id FROM staff s", QueryMode::Fragment, &known);
        assert!(bad.errors[0].contains("not provided by the selected fragments"));
    }

    #[test]
    fn test_warnings_never_affect_validity() {
        let validator = SafetyValidator::default();
        let hints = ValidationHints {
            expects_pagination: true,
            requested_objects: Some(set(&["llm_student_demographics"])),
        };
        let result = validator.validate_with(
            "SELECT * FROM llm_student_demographics d JOIN llm_student_discipline x ON x.student_id = d.student_id",
            QueryMode::View,
            &set(&["llm_student_demographics", "llm_student_discipline"]),
            &hints,
        );
        assert!(result.valid);
        assert_eq!(result.warnings.len(), 3);
        assert!(result.warnings[2].contains("llm_student_discipline"));
    }

    #[test]
    fn test_validation_is_deterministic() {
        let validator = SafetyValidator::default();
        let known = set(&["llm_student_demographics"]);
        let sql = "SELECT * FROM llm_student_demographics JOIN other o ON true; DELETE FROM x";
        let first = validator.validate(sql, QueryMode::View, &known);
        let second = validator.validate(sql, QueryMode::View, &known);
        assert_eq!(first, second);
    }

    #[test]
    fn test_query_mode_parse() {
        assert_eq!("View".parse::<QueryMode>().unwrap(), QueryMode::View);
        assert_eq!("fragment".parse::<QueryMode>().unwrap(), QueryMode::Fragment);
        assert!("graph".parse::<QueryMode>().is_err());
    }
}
