use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactId;
use crate::error::StoreError;
use crate::files;

/// Trim and lowercase a keyword. Empty keywords are rejected.
pub fn normalize_keyword(raw: &str) -> Option<String> {
    let keyword = raw.trim().to_lowercase();
    (!keyword.is_empty()).then_some(keyword)
}

/// Persistent map from keyword to the artifacts tagged with it.
///
/// Serialized as a flat JSON object of keyword to id list. A keyword never
/// maps to an empty set: entries are dropped as their last id goes away.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeywordIndex {
    entries: BTreeMap<String, BTreeSet<ArtifactId>>,
}

impl KeywordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from disk. A missing file yields an empty index.
    pub async fn load(path: &Path) -> Result<Self, StoreError> {
        let text = match files::read_text(path).await {
            Ok(text) => text,
            Err(e) if e.is_not_found() => return Ok(Self::new()),
            Err(e) => return Err(e),
        };
        if text.trim().is_empty() {
            return Ok(Self::new());
        }
        let mut index: Self = serde_json::from_str(&text).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
        index.entries.retain(|_, ids| !ids.is_empty());
        Ok(index)
    }

    pub async fn save(&self, path: &Path) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
        files::write_text(path, &json).await
    }

    /// Tag `id` with every keyword. Returns how many keywords were applied.
    pub fn put<'a>(&mut self, keywords: impl IntoIterator<Item = &'a str>, id: &ArtifactId) -> usize {
        let mut applied = 0;
        for keyword in keywords.into_iter().filter_map(normalize_keyword) {
            self.entries.entry(keyword).or_default().insert(id.clone());
            applied += 1;
        }
        applied
    }

    /// Union of artifacts tagged with any of `keywords`.
    pub fn search<'a>(&self, keywords: impl IntoIterator<Item = &'a str>) -> BTreeSet<ArtifactId> {
        keywords
            .into_iter()
            .filter_map(normalize_keyword)
            .filter_map(|k| self.entries.get(&k))
            .flat_map(|ids| ids.iter().cloned())
            .collect()
    }

    /// Remove keywords entirely. Unknown keywords are ignored.
    pub fn forget<'a>(&mut self, keywords: impl IntoIterator<Item = &'a str>) -> usize {
        keywords
            .into_iter()
            .filter_map(normalize_keyword)
            .filter(|k| self.entries.remove(k).is_some())
            .count()
    }

    pub fn all_keywords(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn ids_for(&self, keyword: &str) -> Option<&BTreeSet<ArtifactId>> {
        normalize_keyword(keyword).and_then(|k| self.entries.get(&k))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
