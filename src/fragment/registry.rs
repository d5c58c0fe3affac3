//! Fragment Registry
//!
//! Immutable snapshot of the fragment catalog. A snapshot is built once,
//! shared through an `Arc`, and replaced wholesale on refresh.

use crate::error::{QueryBuilderError, Result};
use crate::fragment::model::{Fragment, FragmentRecord};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Minimum Jaro-Winkler similarity for a "did you mean" suggestion
const SUGGESTION_THRESHOLD: f64 = 0.85;

#[derive(Debug, Clone, Default)]
pub struct FragmentRegistry {
    fragments: BTreeMap<String, Fragment>,
    version: String,
}

impl FragmentRegistry {
    pub fn new(fragments: Vec<Fragment>, version: impl Into<String>) -> Result<Self> {
        let mut by_id = BTreeMap::new();
        for fragment in fragments {
            if by_id.contains_key(&fragment.id) {
                return Err(QueryBuilderError::Metadata(format!(
                    "Duplicate fragment id '{}'",
                    fragment.id
                )));
            }
            by_id.insert(fragment.id.clone(), fragment);
        }

        for fragment in by_id.values() {
            let references = fragment
                .dependencies
                .iter()
                .map(|id| ("depends on", id))
                .chain(fragment.conflicts.iter().map(|id| ("conflicts with", id)));
            for (relation, id) in references {
                if !by_id.contains_key(id) {
                    return Err(QueryBuilderError::Metadata(format!(
                        "Fragment '{}' {} unknown fragment '{}'",
                        fragment.id, relation, id
                    )));
                }
            }
        }

        let registry = Self {
            fragments: by_id,
            version: version.into(),
        };

        if let Some(cycle) = registry.find_cycle() {
            // Loading still succeeds; resolution touching the cycle fails.
            warn!("Fragment registry contains a dependency cycle: {}", cycle.join(" -> "));
        }

        Ok(registry)
    }

    pub fn from_records(records: Vec<FragmentRecord>, version: impl Into<String>) -> Result<Self> {
        let fragments = records
            .into_iter()
            .map(FragmentRecord::into_fragment)
            .collect::<Result<Vec<_>>>()?;
        Self::new(fragments, version)
    }

    /// Load a registry from a JSON array of fragment records
    pub fn load_from_json(json_str: &str, version: impl Into<String>) -> Result<Self> {
        let records: Vec<FragmentRecord> = serde_json::from_str(json_str).map_err(|e| {
            QueryBuilderError::Metadata(format!("Failed to parse fragment registry JSON: {}", e))
        })?;
        Self::from_records(records, version)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let registry = Self::load_from_json(&content, format!("file:{}", path.display()))?;
        info!(
            "Loaded {} fragments ({} active) from {}",
            registry.len(),
            registry.active().count(),
            path.display()
        );
        Ok(registry)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Active fragment by id. Inactive fragments are invisible to resolution.
    pub fn get(&self, id: &str) -> Option<&Fragment> {
        self.fragments.get(id).filter(|f| f.is_active)
    }

    /// Fragment by id regardless of its active flag
    pub fn lookup(&self, id: &str) -> Option<&Fragment> {
        self.fragments.get(id)
    }

    /// Active fragments in id order
    pub fn active(&self) -> impl Iterator<Item = &Fragment> {
        self.fragments.values().filter(|f| f.is_active)
    }

    pub fn active_ids(&self) -> BTreeSet<String> {
        self.active().map(|f| f.id.clone()).collect()
    }

    /// Closest active id to an unknown one, if any is similar enough
    pub fn suggest(&self, id: &str) -> Option<&str> {
        self.active()
            .map(|f| (f.id.as_str(), strsim::jaro_winkler(id, &f.id)))
            .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(candidate, _)| candidate)
    }

    /// Error for an id that cannot be used, explaining why
    pub fn unknown_fragment(&self, id: &str, required_by: Option<&str>) -> QueryBuilderError {
        let mut hint = String::new();
        if let Some(parent) = required_by {
            hint.push_str(&format!(" (required by '{}')", parent));
        }
        if self.lookup(id).is_some() {
            hint.push_str(" (fragment is inactive)");
        } else if let Some(candidate) = self.suggest(id) {
            hint.push_str(&format!(" (did you mean '{}'?)", candidate));
        }

        QueryBuilderError::UnknownFragment {
            id: id.to_string(),
            hint,
        }
    }

    /// First dependency cycle among active fragments, searched in id order
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut finished: BTreeSet<&str> = BTreeSet::new();

        for start in self.active() {
            if finished.contains(start.id.as_str()) {
                continue;
            }
            let mut path: Vec<&str> = Vec::new();
            if let Some(cycle) = self.cycle_from(&start.id, &mut path, &mut finished) {
                return Some(cycle);
            }
        }

        None
    }

    fn cycle_from<'a>(
        &'a self,
        id: &'a str,
        path: &mut Vec<&'a str>,
        finished: &mut BTreeSet<&'a str>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = path.iter().position(|p| *p == id) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(id.to_string());
            return Some(cycle);
        }
        if finished.contains(id) {
            return None;
        }

        let fragment = self.get(id)?;
        path.push(id);
        for dependency in &fragment.dependencies {
            if let Some(cycle) = self.cycle_from(dependency, path, finished) {
                return Some(cycle);
            }
        }
        path.pop();
        finished.insert(id);
        None
    }
}

/// Shared handle to the current registry snapshot.
///
/// Readers take an `Arc` per request and keep it for the request's lifetime;
/// `replace` swaps in a new snapshot without touching the old one.
#[derive(Debug, Clone, Default)]
pub struct RegistryHandle {
    current: Arc<RwLock<Arc<FragmentRegistry>>>,
}

impl RegistryHandle {
    pub fn new(registry: FragmentRegistry) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(registry))),
        }
    }

    pub fn snapshot(&self) -> Arc<FragmentRegistry> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn replace(&self, registry: FragmentRegistry) {
        let next = Arc::new(registry);
        info!("Fragment registry snapshot replaced (version {})", next.version());
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}
