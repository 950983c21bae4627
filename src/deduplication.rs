// 🔍 Fact Merge Engine - one row per composite key
// Key: (barrio_id, year, quarter, indicator_id, source_id)
//
// Within a batch the later extracted_at wins (equal timestamps: later position).
// Against the warehouse, a differing value from another run is held out as a
// KeyConflict instead of being overwritten.

use crate::apportionment::ResolvedObservation;
use crate::db::{ExistingFact, FactKey, FactRow, FactTable};
use crate::error::ReconcileError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

// ============================================================================
// EXISTING FACTS
// ============================================================================

/// What the warehouse already holds, keyed by composite key
pub trait ExistingFacts {
    fn existing(&self, key: &FactKey) -> Option<&ExistingFact>;
}

impl ExistingFacts for HashMap<FactKey, ExistingFact> {
    fn existing(&self, key: &FactKey) -> Option<&ExistingFact> {
        self.get(key)
    }
}

/// An empty warehouse
pub struct NoExistingFacts;

impl ExistingFacts for NoExistingFacts {
    fn existing(&self, _key: &FactKey) -> Option<&ExistingFact> {
        None
    }
}

// ============================================================================
// MERGE RESULT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteAction {
    /// Key not yet in the warehouse
    Insert,
    /// Key present, value within tolerance or written by this run
    Replace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRow {
    pub row: FactRow,
    pub action: WriteAction,
}

/// A batch row discarded in favour of another row with the same key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupersededRow {
    pub loser: FactRow,
    pub winner_extracted_at: chrono::DateTime<chrono::Utc>,
    pub reason: String,
}

/// A row held out because the warehouse holds a different value for its key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeldConflict {
    pub incoming: FactRow,
    pub existing: f64,
    pub existing_run_id: String,
}

impl HeldConflict {
    pub fn to_error(&self) -> ReconcileError {
        ReconcileError::KeyConflict {
            key: self.incoming.key().to_string(),
            existing: self.existing,
            existing_run: self.existing_run_id.clone(),
            incoming: self.incoming.value,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeOutcome {
    /// Rows to write, ordered by key
    pub rows: Vec<MergedRow>,
    pub superseded: Vec<SupersededRow>,
    pub conflicts: Vec<HeldConflict>,
}

impl MergeOutcome {
    pub fn fact_rows(&self) -> Vec<FactRow> {
        self.rows.iter().map(|m| m.row.clone()).collect()
    }

    pub fn inserted(&self) -> usize {
        self.rows
            .iter()
            .filter(|m| m.action == WriteAction::Insert)
            .count()
    }

    pub fn replaced(&self) -> usize {
        self.rows
            .iter()
            .filter(|m| m.action == WriteAction::Replace)
            .count()
    }
}

// ============================================================================
// DEDUPLICATION ENGINE
// ============================================================================

pub struct DeduplicationEngine {
    /// indicator_id → fact table name
    pub routing: BTreeMap<String, String>,

    /// Relative difference tolerated between runs (default: 1%)
    pub conflict_tolerance: f64,

    /// Absolute difference always tolerated, for values near zero
    pub absolute_floor: f64,
}

impl DeduplicationEngine {
    pub fn new(routing: BTreeMap<String, String>) -> Self {
        DeduplicationEngine {
            routing,
            conflict_tolerance: 0.01,
            absolute_floor: 1e-9,
        }
    }

    pub fn with_tolerance(mut self, conflict_tolerance: f64) -> Self {
        self.conflict_tolerance = conflict_tolerance;
        self
    }

    pub fn table_for(&self, indicator_id: &str) -> FactTable {
        FactTable::route(indicator_id, &self.routing)
    }

    /// Turn a resolved observation into a warehouse row for this run
    pub fn to_fact_row(&self, resolved: &ResolvedObservation, run_id: &str) -> FactRow {
        let obs = &resolved.observation;
        FactRow {
            table: self.table_for(&obs.indicator_id),
            barrio_id: resolved.barrio_id,
            year: obs.year,
            quarter: obs.quarter,
            indicator_id: obs.indicator_id.clone(),
            source_id: obs.source_id.clone(),
            value: resolved.value,
            apportioned: resolved.is_apportioned(),
            weight: resolved.weight,
            weight_tier: resolved.weight_tier,
            raw_territory_label: obs.raw_territory_label.clone(),
            resolution_method: resolved.method.as_str().to_string(),
            run_id: run_id.to_string(),
            extracted_at: obs.extracted_at,
        }
    }

    /// Merge a resolved batch into at most one row per composite key
    pub fn merge(
        &self,
        batch: &[ResolvedObservation],
        run_id: &str,
        existing: &dyn ExistingFacts,
    ) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        let mut winners: BTreeMap<FactKey, FactRow> = BTreeMap::new();

        for resolved in batch {
            let row = self.to_fact_row(resolved, run_id);
            let key = row.key();

            match winners.remove(&key) {
                None => {
                    winners.insert(key, row);
                }
                Some(current) => {
                    // Later position wins on equal timestamps
                    let (winner, loser) = if row.extracted_at >= current.extracted_at {
                        (row, current)
                    } else {
                        (current, row)
                    };

                    let reason = if winner.extracted_at == loser.extracted_at {
                        "same extraction time, later row in batch wins".to_string()
                    } else {
                        format!("superseded by extraction at {}", winner.extracted_at.to_rfc3339())
                    };
                    debug!(key = %key, reason = %reason, "row superseded");

                    outcome.superseded.push(SupersededRow {
                        winner_extracted_at: winner.extracted_at,
                        loser,
                        reason,
                    });
                    winners.insert(key, winner);
                }
            }
        }

        for (key, row) in winners {
            match existing.existing(&key) {
                None => outcome.rows.push(MergedRow {
                    row,
                    action: WriteAction::Insert,
                }),
                Some(prior) if self.within_tolerance(prior.value, row.value) => {
                    outcome.rows.push(MergedRow {
                        row,
                        action: WriteAction::Replace,
                    })
                }
                Some(prior) => {
                    warn!(
                        key = %key,
                        existing = prior.value,
                        existing_run = %prior.run_id,
                        incoming = row.value,
                        "key conflict held for review"
                    );
                    outcome.conflicts.push(HeldConflict {
                        incoming: row,
                        existing: prior.value,
                        existing_run_id: prior.run_id.clone(),
                    });
                }
            }
        }

        outcome
    }

    /// |a - b| <= max(floor, tolerance * max(|a|, |b|))
    pub fn within_tolerance(&self, existing: f64, incoming: f64) -> bool {
        let diff = (existing - incoming).abs();
        let scale = existing.abs().max(incoming.abs());
        diff <= self.absolute_floor.max(self.conflict_tolerance * scale)
    }
}

impl Default for DeduplicationEngine {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

// ============================================================================
// TESTS
// ============================================================================
