//! Fragment Resolver
//!
//! Computes the dependency closure of a requested fragment set, rejects
//! conflicting combinations, and renders the closure into SQL clauses in a
//! fixed, deterministic order.

use crate::error::{QueryBuilderError, Result};
use crate::fragment::model::{Fragment, FragmentType};
use crate::fragment::registry::FragmentRegistry;
use crate::sql_scan;
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

lazy_static! {
    static ref FILTER_PREFIX: Regex = Regex::new(r"(?i)^\s*(where|and)\s+").unwrap();
    static ref ORDER_PREFIX: Regex = Regex::new(r"(?i)^\s*order\s+by\s+").unwrap();
    static ref OR_KEYWORD: Regex = Regex::new(r"(?i)\bor\b").unwrap();
}

/// Result of resolving a fragment request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedQuery {
    /// Ids the caller asked for, before closure
    pub requested: BTreeSet<String>,
    /// Closure in emission order
    pub fragments: Vec<Fragment>,
    /// Union of `tables` over the closure
    pub tables: BTreeSet<String>,
    pub clause_text: String,
}

impl ResolvedQuery {
    pub fn fragment_ids(&self) -> Vec<String> {
        self.fragments.iter().map(|f| f.id.clone()).collect()
    }

    pub fn of_type(&self, fragment_type: FragmentType) -> impl Iterator<Item = &Fragment> {
        self.fragments
            .iter()
            .filter(move |f| f.fragment_type == fragment_type)
    }

    /// Tables pulled in by anything other than a join fragment. Joined tables
    /// outside this set are surfaced as warnings by the validator.
    pub fn requested_tables(&self) -> BTreeSet<String> {
        self.fragments
            .iter()
            .filter(|f| f.fragment_type != FragmentType::Join)
            .flat_map(|f| f.tables.iter().cloned())
            .collect()
    }

    /// The complete statement. Requires exactly one base fragment.
    pub fn sql(&self) -> Result<String> {
        let bases: Vec<&str> = self
            .of_type(FragmentType::Base)
            .map(|f| f.id.as_str())
            .collect();

        match bases.len() {
            1 => Ok(self.clause_text.clone()),
            0 => Err(QueryBuilderError::Composition(
                "No base fragment selected; a query needs exactly one base".to_string(),
            )),
            _ => Err(QueryBuilderError::Composition(format!(
                "Multiple base fragments selected ({}); a query needs exactly one base",
                bases.join(", ")
            ))),
        }
    }
}

pub struct FragmentResolver<'a> {
    registry: &'a FragmentRegistry,
}

impl<'a> FragmentResolver<'a> {
    pub fn new(registry: &'a FragmentRegistry) -> Self {
        Self { registry }
    }

    /// Resolve a requested set into ordered clauses.
    ///
    /// Unknown or inactive ids, dependency cycles and conflicting pairs are
    /// hard errors; nothing is dropped silently.
    pub fn resolve(&self, requested: &BTreeSet<String>) -> Result<ResolvedQuery> {
        let closed = self.closure(requested)?;
        self.check_conflicts(&closed)?;

        let fragments: Vec<Fragment> = closed
            .into_values()
            .sorted_by(|a, b| {
                (a.fragment_type.emission_rank(), a.sort_order, &a.id).cmp(&(
                    b.fragment_type.emission_rank(),
                    b.sort_order,
                    &b.id,
                ))
            })
            .cloned()
            .collect();

        let tables = fragments
            .iter()
            .flat_map(|f| f.tables.iter().cloned())
            .collect();
        let clause_text = render_clauses(&fragments);

        debug!(
            "Resolved {} requested fragments into {}: {}",
            requested.len(),
            fragments.len(),
            fragments.iter().map(|f| f.id.as_str()).join(", ")
        );

        Ok(ResolvedQuery {
            requested: requested.clone(),
            fragments,
            tables,
            clause_text,
        })
    }

    fn closure(&self, requested: &BTreeSet<String>) -> Result<BTreeMap<String, &'a Fragment>> {
        let mut closed = BTreeMap::new();

        for id in requested {
            let fragment = self
                .registry
                .get(id)
                .ok_or_else(|| self.registry.unknown_fragment(id, None))?;
            let mut path = Vec::new();
            self.visit(fragment, &mut path, &mut closed)?;
        }

        Ok(closed)
    }

    fn visit(
        &self,
        fragment: &'a Fragment,
        path: &mut Vec<String>,
        closed: &mut BTreeMap<String, &'a Fragment>,
    ) -> Result<()> {
        if let Some(pos) = path.iter().position(|p| p == &fragment.id) {
            let mut cycle = path[pos..].to_vec();
            cycle.push(fragment.id.clone());
            return Err(QueryBuilderError::DependencyCycle { cycle });
        }
        if closed.contains_key(&fragment.id) {
            return Ok(());
        }

        path.push(fragment.id.clone());
        for dependency_id in &fragment.dependencies {
            let dependency = self
                .registry
                .get(dependency_id)
                .ok_or_else(|| self.registry.unknown_fragment(dependency_id, Some(&fragment.id)))?;
            self.visit(dependency, path, closed)?;
        }
        path.pop();

        closed.insert(fragment.id.clone(), fragment);
        Ok(())
    }

    /// Pairs are checked in id order so the reported pair is stable.
    fn check_conflicts(&self, closed: &BTreeMap<String, &'a Fragment>) -> Result<()> {
        let members: Vec<&Fragment> = closed.values().copied().collect();

        for (i, first) in members.iter().enumerate() {
            for second in &members[i + 1..] {
                if first.conflicts_with(second) {
                    return Err(QueryBuilderError::Conflict {
                        first: first.id.clone(),
                        second: second.id.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Render ordered fragments as SQL text.
///
/// Column snippets are spliced into the first base's select list; filters
/// share one WHERE; order snippets share one ORDER BY.
pub fn render_clauses(fragments: &[Fragment]) -> String {
    let snippets = |fragment_type: FragmentType| -> Vec<&str> {
        fragments
            .iter()
            .filter(|f| f.fragment_type == fragment_type)
            .map(|f| f.snippet.trim())
            .filter(|s| !s.is_empty())
            .collect()
    };

    let columns: Vec<&str> = snippets(FragmentType::Column)
        .into_iter()
        .map(|c| c.trim_start_matches(',').trim())
        .collect();

    let mut lines: Vec<String> = Vec::new();

    let bases = snippets(FragmentType::Base);
    for (i, base) in bases.iter().enumerate() {
        if i == 0 {
            lines.push(splice_columns(base, &columns));
        } else {
            lines.push(base.to_string());
        }
    }
    if bases.is_empty() && !columns.is_empty() {
        lines.push(columns.join(", "));
    }

    for join in snippets(FragmentType::Join) {
        lines.push(join.to_string());
    }

    let filters: Vec<String> = snippets(FragmentType::Filter)
        .into_iter()
        .map(|f| {
            let predicate = FILTER_PREFIX.replace(f, "").trim().to_string();
            if OR_KEYWORD.is_match(&predicate) {
                format!("({})", predicate)
            } else {
                predicate
            }
        })
        .collect();
    for (i, predicate) in filters.iter().enumerate() {
        if i == 0 {
            lines.push(format!("WHERE {}", predicate));
        } else {
            lines.push(format!("  AND {}", predicate));
        }
    }

    for aggregation in snippets(FragmentType::Aggregation) {
        lines.push(aggregation.to_string());
    }

    let orders: Vec<String> = snippets(FragmentType::Order)
        .into_iter()
        .map(|o| ORDER_PREFIX.replace(o, "").trim().to_string())
        .collect();
    if !orders.is_empty() {
        lines.push(format!("ORDER BY {}", orders.join(", ")));
    }

    lines.join("\n")
}

/// Insert extra select-list columns before the base's top-level FROM.
fn splice_columns(base: &str, columns: &[&str]) -> String {
    if columns.is_empty() {
        return base.to_string();
    }

    let extra = columns.join(", ");
    match sql_scan::top_level_from(base) {
        Some(offset) => {
            let head = &base[..offset];
            let select_list = head.trim_end();
            let gap = match &head[select_list.len()..] {
                "" => " ",
                gap => gap,
            };
            format!("{}, {}{}{}", select_list, extra, gap, &base[offset..])
        }
        None => format!("{}, {}", base, extra),
    }
}
