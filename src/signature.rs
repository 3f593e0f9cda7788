//! Change detection over the tracked repositories' heads

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

/// Latest commit of one tracked repository
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RepositoryHead {
    pub name: String,
    pub commit: String,
}

impl RepositoryHead {
    pub fn new(name: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            commit: commit.into(),
        }
    }
}

/// Deterministic summary of a set of repository heads
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Signature(String);

impl Signature {
    /// SHA-256 over the heads sorted by name, each field length-prefixed
    pub fn compute(heads: &[RepositoryHead]) -> Self {
        let mut sorted: Vec<&RepositoryHead> = heads.iter().collect();
        sorted.sort();

        let mut hasher = Sha256::new();
        for head in sorted {
            for field in [&head.name, &head.commit] {
                hasher.update((field.len() as u64).to_le_bytes());
                hasher.update(field.as_bytes());
            }
        }
        Signature(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for log lines
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl From<&str> for Signature {
    fn from(s: &str) -> Self {
        Signature(s.to_string())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pick the tracked repositories out of a fetched head map.
///
/// Entries that are not tracked are ignored. Returns `None` when a tracked
/// repository is missing, since a partial set cannot describe a build.
pub fn select_heads(
    fetched: &HashMap<String, String>,
    tracked: &[String],
) -> Option<Vec<RepositoryHead>> {
    let mut heads = tracked
        .iter()
        .map(|name| {
            fetched
                .get(name)
                .map(|commit| RepositoryHead::new(name.as_str(), commit.as_str()))
        })
        .collect::<Option<Vec<_>>>()?;
    heads.sort();
    Some(heads)
}

/// Whether `new` warrants a build; always true before the first build
pub fn has_changed(new: &Signature, last_applied: Option<&Signature>) -> bool {
    last_applied != Some(new)
}
