//! Generation request types
//!
//! A request is the user's free-text prompt plus optional structured
//! filters and enhancements picked in the UI. Both are appended to the
//! prompt as natural-language hints; in fragment mode they may also seed
//! fragment ids directly.

use crate::validator::QueryMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredFilter {
    /// e.g. "school", "grade", "program"
    pub field: String,
    #[serde(default)]
    pub values: Vec<String>,
    /// Fragment that implements this filter, when the UI knows it
    #[serde(default)]
    pub fragment_id: Option<String>,
    /// Tables or views the filter reads
    #[serde(default)]
    pub objects: Vec<String>,
}

/// Extra data the user asked to see alongside the main result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enhancement {
    pub label: String,
    #[serde(default)]
    pub fragment_id: Option<String>,
    #[serde(default)]
    pub objects: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub mode: QueryMode,
    #[serde(default)]
    pub filters: Vec<StructuredFilter>,
    #[serde(default)]
    pub enhancements: Vec<Enhancement>,
    /// Results will be paged
    #[serde(default)]
    pub paginate: bool,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, mode: QueryMode) -> Self {
        Self {
            prompt: prompt.into(),
            mode,
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: StructuredFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_enhancement(mut self, enhancement: Enhancement) -> Self {
        self.enhancements.push(enhancement);
        self
    }

    pub fn paginated(mut self, paginate: bool) -> Self {
        self.paginate = paginate;
        self
    }

    /// Fragment ids named directly by filters and enhancements
    pub fn seed_fragment_ids(&self) -> BTreeSet<String> {
        self.filters
            .iter()
            .filter_map(|f| f.fragment_id.as_deref())
            .chain(self.enhancements.iter().filter_map(|e| e.fragment_id.as_deref()))
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect()
    }

    /// Objects that filters and enhancements explicitly ask for
    pub fn requested_objects(&self) -> BTreeSet<String> {
        self.filters
            .iter()
            .flat_map(|f| f.objects.iter())
            .chain(self.enhancements.iter().flat_map(|e| e.objects.iter()))
            .map(|o| o.trim().to_lowercase())
            .filter(|o| !o.is_empty())
            .collect()
    }
}
