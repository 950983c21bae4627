// 📊 Apportionment Engine - coarse values down to neighborhoods
//
// A district/municipality value V with weights {b_i: w_i} becomes one
// observation per neighborhood with value V * w_i.
//
// Invariant: sum(children) == V within 1e-6. Rounding residue goes to the
// highest-weight neighborhood (lowest barrio_id on ties).

use crate::entities::BarrioId;
use crate::error::{ReconcileError, ReconcileResult};
use crate::parser::RawTerritoryObservation;
use crate::resolver::ResolutionMethod;
use crate::weights::{WeightSet, WeightTier};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Tolerance for the parent/children sum invariant
pub const SUM_TOLERANCE: f64 = 1e-6;

// ============================================================================
// RESOLVED OBSERVATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedObservation {
    /// The source row this came from (value is the parent value)
    pub observation: RawTerritoryObservation,

    pub barrio_id: BarrioId,

    /// Value attributed to this neighborhood
    pub value: f64,

    /// 1.0 for direct neighborhood rows
    pub weight: f64,

    /// None for direct neighborhood rows
    pub weight_tier: Option<WeightTier>,

    pub method: ResolutionMethod,
}

impl ResolvedObservation {
    /// Neighborhood-level row, taken as-is
    pub fn direct(observation: RawTerritoryObservation, barrio_id: BarrioId, method: ResolutionMethod) -> Self {
        ResolvedObservation {
            value: observation.value,
            observation,
            barrio_id,
            weight: 1.0,
            weight_tier: None,
            method,
        }
    }

    pub fn is_apportioned(&self) -> bool {
        self.weight_tier.is_some()
    }
}

// ============================================================================
// APPORTIONMENT ENGINE
// ============================================================================

pub struct ApportionmentEngine {
    /// Allowed deviation of the weight total from 1.0
    pub weight_tolerance: f64,
}

impl ApportionmentEngine {
    pub fn new() -> Self {
        ApportionmentEngine {
            weight_tolerance: 1e-6,
        }
    }

    pub fn with_tolerance(weight_tolerance: f64) -> Self {
        ApportionmentEngine { weight_tolerance }
    }

    /// Split an aggregate observation across its scope
    pub fn apportion(
        &self,
        observation: &RawTerritoryObservation,
        weights: &WeightSet,
        method: ResolutionMethod,
    ) -> ReconcileResult<Vec<ResolvedObservation>> {
        weights.check_balance(self.weight_tolerance)?;

        let parent = observation.value;
        let mut children: Vec<ResolvedObservation> = weights
            .weights
            .iter()
            .map(|(&barrio_id, &weight)| ResolvedObservation {
                observation: observation.clone(),
                barrio_id,
                value: parent * weight,
                weight,
                weight_tier: weights.tier_of(barrio_id).or(Some(WeightTier::EqualSplit)),
                method,
            })
            .collect();

        let residue = parent - children.iter().map(|c| c.value).sum::<f64>();
        if residue != 0.0 {
            if let Some(heaviest) = heaviest_index(&children) {
                children[heaviest].value += residue;
            }
        }

        let total: f64 = children.iter().map(|c| c.value).sum();
        if (total - parent).abs() > SUM_TOLERANCE * parent.abs().max(1.0) {
            return Err(ReconcileError::ApportionmentImbalance {
                scope: weights.scope(),
                year: observation.year,
                reason: format!("children sum to {} for parent {}", total, parent),
            });
        }

        debug!(
            indicator = %observation.indicator_id,
            label = %observation.raw_territory_label,
            year = observation.year,
            children = children.len(),
            "aggregate apportioned"
        );

        Ok(children)
    }
}

impl Default for ApportionmentEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn heaviest_index(children: &[ResolvedObservation]) -> Option<usize> {
    children
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            a.weight
                .partial_cmp(&b.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                // Lower barrio_id wins ties
                .then(b.barrio_id.cmp(&a.barrio_id))
        })
        .map(|(i, _)| i)
}

// ============================================================================
// TESTS
// ============================================================================
