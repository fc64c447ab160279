//! Rule document loading and caching.
//!
//! Documents live as JSON files named `<name_lowercase>.<version>.json`
//! inside a configured directory. A parsed document is validated once and
//! then cached, together with its eligibility key set, for the process
//! lifetime. The cache is read-mostly and safe under concurrent readers;
//! documents are never mutated after caching.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::model::RuleSetKey;

use super::document::{RuleDocument, RuleDocumentError};

/// Errors raised while loading a rule document.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuleLoadError {
    /// No file exists for the requested rule set.
    #[error("rule set {key} not found at {path}")]
    NotFound {
        /// The requested rule set.
        key: RuleSetKey,
        /// Path that was probed.
        path: PathBuf,
    },

    /// The file could not be read.
    #[error("failed to read rule set {key}: {source}")]
    Io {
        /// The requested rule set.
        key: RuleSetKey,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON for the document shape.
    #[error("failed to parse rule set {key}: {source}")]
    Parse {
        /// The requested rule set.
        key: RuleSetKey,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// The document parsed but failed validation.
    #[error("invalid rule set {key}: {source}")]
    Invalid {
        /// The requested rule set.
        key: RuleSetKey,
        /// Underlying validation error.
        #[source]
        source: RuleDocumentError,
    },
}

/// A cached rule document plus its precomputed eligibility key set.
#[derive(Debug)]
pub struct LoadedRuleSet {
    /// The validated, immutable document.
    pub document: RuleDocument,
    /// Union of enabled rule keys, `questionKeysAny` and ignored keys.
    pub eligibility_keys: BTreeSet<String>,
}

/// File-backed rule set cache keyed by `(name_lowercase, version)`.
pub struct RuleSetCache {
    dir: PathBuf,
    cache: RwLock<HashMap<RuleSetKey, Arc<LoadedRuleSet>>>,
}

impl RuleSetCache {
    /// Creates a cache over the given rule document directory.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// The directory this cache reads from.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the cached rule set, loading and validating it on first
    /// access.
    ///
    /// # Errors
    ///
    /// Returns [`RuleLoadError`] when the file is absent, unreadable,
    /// unparseable, or fails validation. Failures are not cached; a
    /// corrected file is picked up on the next call.
    pub fn load(&self, key: &RuleSetKey) -> Result<Arc<LoadedRuleSet>, RuleLoadError> {
        let cache_key = RuleSetKey::new(key.name.to_lowercase(), key.version.clone());

        {
            let cache = self.cache.read().expect("rule cache lock poisoned");
            if let Some(loaded) = cache.get(&cache_key) {
                return Ok(Arc::clone(loaded));
            }
        }

        let loaded = Arc::new(self.load_uncached(key, &cache_key)?);

        let mut cache = self.cache.write().expect("rule cache lock poisoned");
        // A concurrent loader may have won the race; keep the first entry so
        // every reader observes one immutable instance.
        let entry = cache
            .entry(cache_key)
            .or_insert_with(|| Arc::clone(&loaded));
        Ok(Arc::clone(entry))
    }

    fn load_uncached(
        &self,
        key: &RuleSetKey,
        cache_key: &RuleSetKey,
    ) -> Result<LoadedRuleSet, RuleLoadError> {
        let path = self
            .dir
            .join(format!("{}.{}.json", cache_key.name, cache_key.version));

        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                return Err(RuleLoadError::NotFound {
                    key: key.clone(),
                    path,
                });
            },
            Err(source) => {
                return Err(RuleLoadError::Io {
                    key: key.clone(),
                    source,
                });
            },
        };

        let document: RuleDocument =
            serde_json::from_str(&raw).map_err(|source| RuleLoadError::Parse {
                key: key.clone(),
                source,
            })?;

        document
            .validate(&key.name, &key.version)
            .map_err(|source| RuleLoadError::Invalid {
                key: key.clone(),
                source,
            })?;

        let eligibility_keys = document.eligibility_keys();
        Ok(LoadedRuleSet {
            document,
            eligibility_keys,
        })
    }
}

impl std::fmt::Debug for RuleSetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cached: Vec<String> = self
            .cache
            .read()
            .map(|cache| cache.keys().map(ToString::to_string).collect())
            .unwrap_or_default();
        f.debug_struct("RuleSetCache")
            .field("dir", &self.dir)
            .field("cached", &cached)
            .finish()
    }
}
