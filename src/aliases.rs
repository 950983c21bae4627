// 🏷️ Alias Table - reviewed overrides as data
//
// Names normalization cannot reconcile on its own (abbreviations, partial
// names, omitted conjunctions) are listed in config/aliases.toml. The table
// is never learned at runtime: every new exception is a reviewed diff.

use crate::entities::NeighborhoodRegistry;
use crate::error::{ReconcileError, ReconcileResult};
use crate::normalizer::NameNormalizer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

// ============================================================================
// ALIAS FILE
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AliasFile {
    /// Version of the reviewed list (recorded with every run)
    version: String,

    #[serde(default)]
    aliases: BTreeMap<String, String>,
}

/// One `(normalized_alias) → canonical_name` pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasOverride {
    pub normalized_alias: String,
    pub canonical_name: String,
}

// ============================================================================
// ALIAS TABLE
// ============================================================================

#[derive(Debug, Clone)]
pub struct AliasTable {
    version: String,
    entries: BTreeMap<String, String>,
}

impl AliasTable {
    /// Empty table (every lookup misses)
    pub fn empty() -> Self {
        AliasTable {
            version: "empty".to_string(),
            entries: BTreeMap::new(),
        }
    }

    /// Load aliases from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P, normalizer: &NameNormalizer) -> ReconcileResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ReconcileError::config(format!("cannot read alias table {:?}: {}", path, e))
        })?;
        Self::from_toml_str(&content, normalizer)
    }

    pub fn from_toml_str(content: &str, normalizer: &NameNormalizer) -> ReconcileResult<Self> {
        let file: AliasFile = toml::from_str(content)
            .map_err(|e| ReconcileError::config(format!("corrupt alias table: {}", e)))?;

        let mut table = AliasTable {
            version: file.version,
            entries: BTreeMap::new(),
        };
        for (alias, canonical) in file.aliases {
            table.insert(&alias, &canonical, normalizer)?;
        }
        Ok(table)
    }

    /// Build from raw `(alias, canonical_name)` pairs
    pub fn from_pairs(
        version: &str,
        pairs: &[(&str, &str)],
        normalizer: &NameNormalizer,
    ) -> ReconcileResult<Self> {
        let mut table = AliasTable {
            version: version.to_string(),
            entries: BTreeMap::new(),
        };
        for (alias, canonical) in pairs {
            table.insert(alias, canonical, normalizer)?;
        }
        Ok(table)
    }

    fn insert(&mut self, alias: &str, canonical: &str, normalizer: &NameNormalizer) -> ReconcileResult<()> {
        let key = normalizer.normalize(alias);
        if key.is_empty() {
            return Err(ReconcileError::config(format!(
                "alias '{}' normalizes to an empty string",
                alias
            )));
        }

        let canonical = canonical.trim().to_string();
        if let Some(existing) = self.entries.get(&key) {
            if existing != &canonical {
                return Err(ReconcileError::config(format!(
                    "alias '{}' maps to both '{}' and '{}'",
                    alias, existing, canonical
                )));
            }
        }
        self.entries.insert(key, canonical);
        Ok(())
    }

    /// Every alias target must be a known barrio or district
    pub fn validate_against(
        &self,
        registry: &NeighborhoodRegistry,
        normalizer: &NameNormalizer,
    ) -> ReconcileResult<()> {
        for (alias, canonical) in &self.entries {
            let known = registry.find_by_name(canonical, normalizer).is_some()
                || registry.find_district_by_name(canonical, normalizer).is_some();
            if !known {
                return Err(ReconcileError::config(format!(
                    "alias '{}' points to unknown territory '{}'",
                    alias, canonical
                )));
            }
        }
        Ok(())
    }

    /// Exact lookup on an already-normalized label
    pub fn lookup(&self, normalized: &str) -> Option<&str> {
        self.entries.get(normalized).map(|s| s.as_str())
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All overrides, sorted by alias
    pub fn overrides(&self) -> Vec<AliasOverride> {
        self.entries
            .iter()
            .map(|(alias, canonical)| AliasOverride {
                normalized_alias: alias.clone(),
                canonical_name: canonical.clone(),
            })
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::neighborhood::tests::barcelona;

    fn shipped_table() -> AliasTable {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/aliases.toml");
        AliasTable::from_file(path, &NameNormalizer::new()).unwrap()
    }

    #[test]
    fn test_shipped_table_is_valid() {
        let table = shipped_table();
        assert!(!table.is_empty());
        assert_eq!(table.version(), "2024.3");
        table
            .validate_against(&barcelona(), &NameNormalizer::new())
            .unwrap();
    }

    #[test]
    fn test_keys_are_normalized() {
        let table = shipped_table();
        assert_eq!(table.lookup("gotic"), Some("el Barri Gòtic"));
        assert_eq!(table.lookup("st marti"), Some("Sant Martí"));
        assert_eq!(table.lookup("Gòtic"), None);
    }

    #[test]
    fn test_miss_returns_none() {
        let table = shipped_table();
        assert_eq!(table.lookup("vila olimpica del poblenou"), None);
        assert_eq!(table.lookup("atlantis"), None);
    }

    #[test]
    fn test_conflicting_alias_rejected() {
        let n = NameNormalizer::new();
        let err = AliasTable::from_pairs(
            "t",
            &[("Born", "el Raval"), ("BORN", "el Barri Gòtic")],
            &n,
        )
        .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unknown_target_rejected() {
        let n = NameNormalizer::new();
        let table = AliasTable::from_pairs("t", &[("Atlantis", "la Atlàntida")], &n).unwrap();
        assert!(table.validate_against(&barcelona(), &n).is_err());
    }

    #[test]
    fn test_corrupt_toml_is_fatal() {
        let err = AliasTable::from_toml_str("version = \n[aliases", &NameNormalizer::new()).unwrap_err();
        assert!(matches!(err, ReconcileError::Config(_)));
    }
}
