//! View Catalog
//!
//! The fixed set of pre-approved reporting views usable in view mode.
//! Used for whitelist membership only; nothing is composed from it.

use crate::error::{QueryBuilderError, Result};
use crate::sql_scan;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub columns: Vec<String>,
}

impl ViewDefinition {
    fn new(name: &str, description: &str, columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ViewCatalog {
    views: BTreeMap<String, ViewDefinition>,
}

impl ViewCatalog {
    pub fn new(views: Vec<ViewDefinition>) -> Self {
        let views = views
            .into_iter()
            .map(|mut v| {
                v.name = v.name.trim().to_lowercase();
                (v.name.clone(), v)
            })
            .collect();
        Self { views }
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(
            names
                .into_iter()
                .map(|n| ViewDefinition::new(n.as_ref(), "", &[]))
                .collect(),
        )
    }

    /// Built-in reporting views
    pub fn default_catalog() -> Self {
        Self::new(vec![
            ViewDefinition::new(
                "llm_student_demographics",
                "One row per enrolled student: name, grade, gender, ethnicity, home school",
                &["student_id", "first_name", "last_name", "grade_level", "gender", "ethnicity", "school_id"],
            ),
            ViewDefinition::new(
                "llm_student_enrollment",
                "Enrollment spans per student and school year",
                &["student_id", "school_id", "school_year", "entry_date", "exit_date"],
            ),
            ViewDefinition::new(
                "llm_student_attendance",
                "Daily attendance aggregates per student",
                &["student_id", "school_year", "days_enrolled", "days_present", "attendance_rate"],
            ),
            ViewDefinition::new(
                "llm_student_assessments",
                "State and local assessment results",
                &["student_id", "assessment_name", "subject", "test_date", "scale_score", "proficiency_level"],
            ),
            ViewDefinition::new(
                "llm_student_programs",
                "Program participation flags (EL, special education, 504, gifted)",
                &["student_id", "is_el", "is_sped", "has_504", "is_gifted"],
            ),
            ViewDefinition::new(
                "llm_student_discipline",
                "Discipline incidents and resulting actions",
                &["student_id", "incident_date", "incident_type", "action_taken", "days_suspended"],
            ),
            ViewDefinition::new(
                "llm_course_grades",
                "Course marks per grading period",
                &["student_id", "course_name", "term", "mark", "credits_earned"],
            ),
            ViewDefinition::new(
                "llm_school_directory",
                "Schools with their level and principal",
                &["school_id", "school_name", "school_level", "principal_name"],
            ),
        ])
    }

    /// Load view definitions from a JSON array of objects or of plain names
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let value: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
            QueryBuilderError::Metadata(format!("Failed to parse view catalog JSON: {}", e))
        })?;

        let catalog = match value {
            serde_json::Value::Array(items) if items.iter().all(|i| i.is_string()) => {
                Self::from_names(items.iter().filter_map(|i| i.as_str()))
            }
            other => Self::new(serde_json::from_value(other).map_err(|e| {
                QueryBuilderError::Metadata(format!("Invalid view catalog entry: {}", e))
            })?),
        };

        info!("Loaded {} catalog views from {}", catalog.len(), path.display());
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn known_views(&self) -> BTreeSet<String> {
        self.views.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.views.contains_key(&name.to_lowercase())
    }

    pub fn views(&self) -> impl Iterator<Item = &ViewDefinition> {
        self.views.values()
    }

    /// Identifiers following FROM/JOIN in `sql`
    pub fn referenced_names(&self, sql: &str) -> BTreeSet<String> {
        match sql_scan::scan_objects(sql) {
            Ok(scan) => scan.objects.into_iter().collect(),
            Err(_) => sql_scan::tokenize(sql)
                .map(|tokens| sql_scan::fallback_objects(&tokens).into_iter().collect())
                .unwrap_or_default(),
        }
    }

    /// Catalog listing for the generation prompt
    pub fn describe(&self) -> String {
        self.views
            .values()
            .map(|v| {
                let mut line = format!("- {}", v.name);
                if !v.description.is_empty() {
                    line.push_str(&format!(": {}", v.description));
                }
                if !v.columns.is_empty() {
                    line.push_str(&format!(" (columns: {})", v.columns.join(", ")));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_is_llm_views() {
        let catalog = ViewCatalog::default_catalog();
        assert!(!catalog.is_empty());
        assert!(catalog.known_views().iter().all(|v| v.starts_with("llm_")));
        assert!(catalog.contains("LLM_Student_Demographics"));
    }

    #[test]
    fn test_referenced_names() {
        let catalog = ViewCatalog::default_catalog();
        let names = catalog.referenced_names(
            "SELECT d.student_id FROM llm_student_demographics d JOIN secret_table s ON s.id = d.student_id",
        );
        assert_eq!(
            names,
            ["llm_student_demographics", "secret_table"]
                .iter()
                .map(|s| s.to_string())
                .collect()
        );
    }

    #[test]
    fn test_describe_lists_columns() {
        let catalog = ViewCatalog::new(vec![ViewDefinition::new("llm_x", "Example", &["a", "b"])]);
        assert_eq!(catalog.describe(), "- llm_x: Example (columns: a, b)");
    }
}
