//! Initial prompt construction
//!
//! The prompt carries everything the collaborator may use: the user's
//! request with filter/enhancement hints, the objects it may reference, and
//! the reply format. Output is deterministic for a given request, registry
//! and catalog.

use crate::catalog::ViewCatalog;
use crate::fragment::{Fragment, FragmentRegistry};
use crate::generation::request::{Enhancement, GenerationRequest, StructuredFilter};
use crate::validator::QueryMode;
use itertools::Itertools;

pub const LEFT_JOIN_HINT: &str =
    "Use LEFT JOIN to include all students, with NULL for those without this data.";

pub const FRAGMENT_REPLY_FORMAT: &str =
    r#"Return JSON only: {"fragments": ["fragment_id", ...], "explanation": "one sentence"}"#;

pub const VIEW_REPLY_FORMAT: &str =
    r#"Return JSON only: {"sql": "SELECT ...", "referencedViews": ["view_name", ...], "explanation": "one sentence"}"#;

/// "Only include students where grade is 3 and school is Jefferson."
pub fn filter_hint(filters: &[StructuredFilter]) -> Option<String> {
    let clauses: Vec<String> = filters
        .iter()
        .filter(|f| !f.values.is_empty())
        .map(|f| match f.values.as_slice() {
            [single] => format!("{} is {}", f.field, single),
            many => format!("{} is one of {}", f.field, many.join(", ")),
        })
        .collect();
    if clauses.is_empty() {
        return None;
    }
    Some(format!("Only include students where {}.", clauses.join(" and ")))
}

pub fn enhancement_hint(enhancements: &[Enhancement]) -> Option<String> {
    if enhancements.is_empty() {
        return None;
    }
    let labels = enhancements.iter().map(|e| e.label.as_str()).join(", ");
    Some(format!("Include additional data: {}. {}", labels, LEFT_JOIN_HINT))
}

/// The user's request with structured hints appended
pub fn user_request(request: &GenerationRequest) -> String {
    let mut parts = vec![request.prompt.trim().to_string()];
    parts.extend(filter_hint(&request.filters));
    parts.extend(enhancement_hint(&request.enhancements));
    parts.join(" ")
}

fn describe_fragment(fragment: &Fragment) -> String {
    let mut line = format!(
        "- {} [{}] {}",
        fragment.id,
        fragment.fragment_type.as_str(),
        fragment.name
    );
    if !fragment.description.is_empty() {
        line.push_str(&format!(": {}", fragment.description));
    }
    if !fragment.dependencies.is_empty() {
        line.push_str(&format!(" (requires: {})", fragment.dependencies.iter().join(", ")));
    }
    if !fragment.conflicts.is_empty() {
        line.push_str(&format!(" (conflicts with: {})", fragment.conflicts.iter().join(", ")));
    }
    line
}

pub fn initial_prompt(
    request: &GenerationRequest,
    registry: &FragmentRegistry,
    catalog: &ViewCatalog,
) -> String {
    let mut prompt_parts = Vec::new();

    match request.mode {
        QueryMode::Fragment => {
            prompt_parts.push(
                "You compose SQL for a school district reporting tool by selecting pre-approved query fragments."
                    .to_string(),
            );
            prompt_parts.push(
                "Pick the fragment ids that together answer the request. Required fragments are added automatically. Never pick two fragments that conflict."
                    .to_string(),
            );
            prompt_parts.push(String::new());
            prompt_parts.push("AVAILABLE FRAGMENTS:".to_string());
            prompt_parts.extend(registry.active().map(describe_fragment));
            let seeds = request.seed_fragment_ids();
            if !seeds.is_empty() {
                prompt_parts.push(String::new());
                prompt_parts.push(format!("ALREADY SELECTED: {}", seeds.iter().join(", ")));
            }
        }
        QueryMode::View => {
            prompt_parts.push(
                "You write read-only PostgreSQL queries for a school district reporting tool.".to_string(),
            );
            prompt_parts.push(String::new());
            prompt_parts.push("APPROVED VIEWS (reference no other tables or views):".to_string());
            prompt_parts.push(catalog.describe());
            prompt_parts.push(String::new());
            prompt_parts.push("RULES:".to_string());
            prompt_parts.push("- Write exactly one SELECT statement (a WITH clause is allowed).".to_string());
            prompt_parts.push("- Never modify data or schema.".to_string());
            prompt_parts.push("- List the needed columns instead of SELECT *.".to_string());
            if request.paginate {
                prompt_parts.push("- Include an ORDER BY so results can be paged.".to_string());
            }
        }
    }

    prompt_parts.push(String::new());
    prompt_parts.push(format!("REQUEST: {}", user_request(request)));
    prompt_parts.push(String::new());
    prompt_parts.push(
        match request.mode {
            QueryMode::Fragment => FRAGMENT_REPLY_FORMAT,
            QueryMode::View => VIEW_REPLY_FORMAT,
        }
        .to_string(),
    );

    prompt_parts.join("\n")
}
