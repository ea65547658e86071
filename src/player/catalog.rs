use super::types::Scenario;

use rand::Rng;
use serde_json::{Map, Value};

use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Failed to read scenarios file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse scenarios: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Read-only collection of scenarios, in data file order.
#[derive(Debug, Default)]
pub struct ScenarioCatalog {
    entries: Vec<(String, Scenario)>,
    by_id: HashMap<String, usize>,
}

impl ScenarioCatalog {
    pub fn from_entries(entries: Vec<(String, Scenario)>) -> Self {
        let by_id = entries
            .iter()
            .enumerate()
            .map(|(i, (id, _))| (id.clone(), i))
            .collect();
        Self { entries, by_id }
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let raw: Map<String, Value> = serde_json::from_str(json)?;
        let mut entries = Vec::with_capacity(raw.len());
        for (id, value) in raw {
            let scenario: Scenario = serde_json::from_value(value)?;
            entries.push((id, scenario));
        }
        Ok(Self::from_entries(entries))
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Like [`ScenarioCatalog::load`], but a missing or broken file yields an empty catalog.
    pub fn load_or_empty(path: &Path) -> Self {
        match Self::load(path) {
            Ok(catalog) => {
                tracing::info!("Loaded {} scenarios from {}", catalog.len(), path.display());
                catalog
            }
            Err(e) => {
                tracing::error!("Error loading scenarios from {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&Scenario> {
        self.by_id.get(id).map(|&i| &self.entries[i].1)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(id, _)| id.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids whose id, summary or any line contains `query`, ignoring case.
    pub fn search(&self, query: &str) -> Vec<&str> {
        let needle = query.trim().to_lowercase();
        self.entries
            .iter()
            .filter(|(id, s)| {
                needle.is_empty()
                    || id.to_lowercase().contains(&needle)
                    || s.summary.to_lowercase().contains(&needle)
                    || s.lines.iter().any(|l| l.text.to_lowercase().contains(&needle))
            })
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

/// Search query plus the currently selected scenario.
///
/// Navigation walks the filtered list. Callers must reset playback before
/// acting on a new selection.
#[derive(Debug, Clone, Default)]
pub struct ScenarioBrowser {
    query: String,
    selected: Option<String>,
}

impl ScenarioBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn set_query(&mut self, query: &str) {
        self.query = query.to_string();
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn select(&mut self, id: &str) {
        self.selected = Some(id.to_string());
    }

    pub fn close(&mut self) {
        self.selected = None;
    }

    fn position(&self, filtered: &[&str]) -> Option<usize> {
        let current = self.selected.as_deref()?;
        filtered.iter().position(|id| *id == current)
    }

    pub fn has_next(&self, catalog: &ScenarioCatalog) -> bool {
        let filtered = catalog.search(&self.query);
        matches!(self.position(&filtered), Some(i) if i + 1 < filtered.len())
    }

    pub fn has_previous(&self, catalog: &ScenarioCatalog) -> bool {
        let filtered = catalog.search(&self.query);
        matches!(self.position(&filtered), Some(i) if i > 0)
    }

    pub fn next(&mut self, catalog: &ScenarioCatalog) -> Option<String> {
        let filtered = catalog.search(&self.query);
        let i = self.position(&filtered)?;
        let id = filtered.get(i + 1)?.to_string();
        self.selected = Some(id.clone());
        Some(id)
    }

    pub fn previous(&mut self, catalog: &ScenarioCatalog) -> Option<String> {
        let filtered = catalog.search(&self.query);
        let i = self.position(&filtered)?.checked_sub(1)?;
        let id = filtered[i].to_string();
        self.selected = Some(id.clone());
        Some(id)
    }

    /// Picks a filtered scenario other than the current one when possible.
    pub fn random<R: Rng>(&mut self, catalog: &ScenarioCatalog, rng: &mut R) -> Option<String> {
        let filtered = catalog.search(&self.query);
        let id = match filtered.len() {
            0 => return None,
            1 => filtered[0],
            len => {
                let current = self.position(&filtered);
                let mut pick = rng.random_range(0..len);
                if Some(pick) == current {
                    pick = (pick + 1 + rng.random_range(0..len - 1)) % len;
                }
                filtered[pick]
            }
        };
        self.selected = Some(id.to_string());
        Some(id.to_string())
    }
}
