//! Fragment Model
//!
//! Typed fragment records. Persisted rows carry their list fields as
//! JSON-encoded strings; they are decoded once here and never re-parsed.

use crate::error::{QueryBuilderError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Kind of SQL building block a fragment contributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentType {
    Base,
    Filter,
    Join,
    Aggregation,
    Order,
    Column,
}

impl FragmentType {
    /// Fixed clause emission order: base, join, filter, aggregation, column, order.
    pub fn emission_rank(&self) -> u8 {
        match self {
            FragmentType::Base => 0,
            FragmentType::Join => 1,
            FragmentType::Filter => 2,
            FragmentType::Aggregation => 3,
            FragmentType::Column => 4,
            FragmentType::Order => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FragmentType::Base => "base",
            FragmentType::Filter => "filter",
            FragmentType::Join => "join",
            FragmentType::Aggregation => "aggregation",
            FragmentType::Order => "order",
            FragmentType::Column => "column",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "base" => Some(FragmentType::Base),
            "filter" => Some(FragmentType::Filter),
            "join" => Some(FragmentType::Join),
            "aggregation" => Some(FragmentType::Aggregation),
            "order" => Some(FragmentType::Order),
            "column" => Some(FragmentType::Column),
            _ => None,
        }
    }
}

impl fmt::Display for FragmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, reusable SQL building block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub fragment_type: FragmentType,
    pub snippet: String,
    pub category: String,
    pub subcategory: Option<String>,
    pub tables: BTreeSet<String>,
    pub dependencies: BTreeSet<String>,
    pub conflicts: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub is_active: bool,
    pub sort_order: i32,
}

impl Fragment {
    /// True when either side declares the other as a conflict.
    pub fn conflicts_with(&self, other: &Fragment) -> bool {
        self.conflicts.contains(&other.id) || other.conflicts.contains(&self.id)
    }
}

/// A list column as it appears in persisted data: either a JSON-encoded
/// string (`"[\"students\"]"`) or an actual array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EncodedList {
    Encoded(String),
    List(Vec<String>),
}

impl Default for EncodedList {
    fn default() -> Self {
        EncodedList::List(Vec::new())
    }
}

impl EncodedList {
    fn decode(&self, fragment_id: &str, field: &str) -> Result<BTreeSet<String>> {
        let items = match self {
            EncodedList::List(items) => items.clone(),
            EncodedList::Encoded(raw) if raw.trim().is_empty() => Vec::new(),
            EncodedList::Encoded(raw) => serde_json::from_str::<Vec<String>>(raw).map_err(|e| {
                QueryBuilderError::Metadata(format!(
                    "Fragment '{}' has malformed {} list: {}",
                    fragment_id, field, e
                ))
            })?,
        };

        Ok(items
            .into_iter()
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect())
    }
}

/// Raw fragment row as stored in the registry table or a JSON export
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub fragment_type: String,
    pub snippet: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub subcategory: Option<String>,
    #[serde(default)]
    pub tables: Option<EncodedList>,
    #[serde(default)]
    pub dependencies: Option<EncodedList>,
    #[serde(default)]
    pub conflicts: Option<EncodedList>,
    #[serde(default)]
    pub tags: Option<EncodedList>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub sort_order: i32,
}

fn default_active() -> bool {
    true
}

impl FragmentRecord {
    pub fn into_fragment(self) -> Result<Fragment> {
        let id = self.id.trim().to_string();
        if id.is_empty() {
            return Err(QueryBuilderError::Metadata(
                "Fragment record with empty id".to_string(),
            ));
        }

        let fragment_type = FragmentType::parse(&self.fragment_type).ok_or_else(|| {
            QueryBuilderError::Metadata(format!(
                "Fragment '{}' has unknown type '{}'",
                id, self.fragment_type
            ))
        })?;

        let decode = |list: &Option<EncodedList>, field: &str| -> Result<BTreeSet<String>> {
            match list {
                Some(list) => list.decode(&id, field),
                None => Ok(BTreeSet::new()),
            }
        };

        let tables = decode(&self.tables, "tables")?
            .into_iter()
            .map(|t| t.to_lowercase())
            .collect();
        let dependencies = decode(&self.dependencies, "dependencies")?;
        let conflicts = decode(&self.conflicts, "conflicts")?;
        let tags = decode(&self.tags, "tags")?;

        Ok(Fragment {
            name: self.name,
            description: self.description,
            fragment_type,
            snippet: self.snippet.trim().to_string(),
            category: self.category,
            subcategory: self.subcategory.filter(|s| !s.is_empty()),
            tables,
            dependencies,
            conflicts,
            tags,
            is_active: self.is_active,
            sort_order: self.sort_order,
            id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tables: Option<EncodedList>) -> FragmentRecord {
        FragmentRecord {
            id: "has_el".to_string(),
            name: "English Learners".to_string(),
            description: String::new(),
            fragment_type: "filter".to_string(),
            snippet: "el.is_el = true".to_string(),
            category: "programs".to_string(),
            subcategory: None,
            tables,
            dependencies: None,
            conflicts: None,
            tags: None,
            is_active: true,
            sort_order: 20,
        }
    }

    #[test]
    fn test_decodes_json_encoded_list() {
        let fragment = record(Some(EncodedList::Encoded(r#"["EL_Status", "students"]"#.to_string())))
            .into_fragment()
            .unwrap();
        assert!(fragment.tables.contains("el_status"));
        assert!(fragment.tables.contains("students"));
    }

    #[test]
    fn test_accepts_plain_array_and_empty_string() {
        let fragment = record(Some(EncodedList::List(vec!["el_status".to_string()])))
            .into_fragment()
            .unwrap();
        assert_eq!(fragment.tables.len(), 1);

        let fragment = record(Some(EncodedList::Encoded("  ".to_string())))
            .into_fragment()
            .unwrap();
        assert!(fragment.tables.is_empty());
    }

    #[test]
    fn test_malformed_list_is_metadata_error() {
        let err = record(Some(EncodedList::Encoded("[not json".to_string())))
            .into_fragment()
            .unwrap_err();
        assert!(err.to_string().contains("has_el"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut raw = record(None);
        raw.fragment_type = "window".to_string();
        assert!(raw.into_fragment().is_err());
    }

    #[test]
    fn test_emission_rank_order() {
        let mut types = vec![
            FragmentType::Order,
            FragmentType::Column,
            FragmentType::Filter,
            FragmentType::Base,
            FragmentType::Aggregation,
            FragmentType::Join,
        ];
        types.sort_by_key(|t| t.emission_rank());
        assert_eq!(
            types,
            vec![
                FragmentType::Base,
                FragmentType::Join,
                FragmentType::Filter,
                FragmentType::Aggregation,
                FragmentType::Column,
                FragmentType::Order,
            ]
        );
    }
}
