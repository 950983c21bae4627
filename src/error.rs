// ⚠️ Error taxonomy for the reconciliation engine
//
// Per-row errors (unresolvable territory, apportionment imbalance, key
// conflict, schema violation) are recovered locally: the row is excluded,
// counted and logged. Only configuration errors abort a run.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReconcileError {
    /// A raw label could not be matched at any tier
    #[error("Unresolvable territory '{label}' (source: {source_id}, year: {year})")]
    UnresolvableTerritory {
        label: String,
        source_id: String,
        year: i32,
    },

    /// Weights for an aggregate scope do not sum to ~1.0 after all fallbacks
    #[error("Apportionment imbalance for scope {scope:?} in {year}: {reason}")]
    ApportionmentImbalance {
        scope: Vec<u32>,
        year: i32,
        reason: String,
    },

    /// Composite key collision with a materially different value from another run
    #[error("Key conflict on {key}: warehouse has {existing} (run {existing_run}), incoming {incoming}")]
    KeyConflict {
        key: String,
        existing: f64,
        existing_run: String,
        incoming: f64,
    },

    /// Incoming row is missing a required field or carries an invalid one
    #[error("Schema violation on field '{field}': {message}")]
    SchemaViolation { field: String, message: String },

    /// Reference list, alias table or config file could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ReconcileError {
    pub fn schema(field: &str, message: impl Into<String>) -> Self {
        ReconcileError::SchemaViolation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        ReconcileError::Config(message.into())
    }

    /// Configuration errors are the only ones fatal to a whole run
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReconcileError::Config(_))
    }

    /// Short category code used in coverage counters and the audit trail
    pub fn code(&self) -> &'static str {
        match self {
            ReconcileError::UnresolvableTerritory { .. } => "unresolvable_territory",
            ReconcileError::ApportionmentImbalance { .. } => "apportionment_imbalance",
            ReconcileError::KeyConflict { .. } => "key_conflict",
            ReconcileError::SchemaViolation { .. } => "schema_violation",
            ReconcileError::Config(_) => "config",
        }
    }
}

pub type ReconcileResult<T> = std::result::Result<T, ReconcileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_config_errors_are_fatal() {
        assert!(ReconcileError::config("missing barrios.csv").is_fatal());
        assert!(!ReconcileError::schema("year", "missing").is_fatal());
        assert!(!ReconcileError::UnresolvableTerritory {
            label: "Atlantis".to_string(),
            source_id: "ine".to_string(),
            year: 2020,
        }
        .is_fatal());
    }

    #[test]
    fn test_display_includes_context() {
        let err = ReconcileError::UnresolvableTerritory {
            label: "Atlantis".to_string(),
            source_id: "ine".to_string(),
            year: 2020,
        };
        let msg = err.to_string();
        assert!(msg.contains("Atlantis"));
        assert!(msg.contains("ine"));
        assert!(msg.contains("2020"));
        assert_eq!(err.code(), "unresolvable_territory");
    }
}
