// ⚖️ Weight Provider - population weights for apportionment
//
// Per neighborhood in a scope, the first tier that answers wins:
//   1. observed population for that exact year
//   2. historical mean population across all available years
//   3. equal split (only neighborhoods with no data at all)
//
// Combination: each tier-3 neighborhood gets 1/n of the scope; the rest of
// the mass is split across tier-1/2 neighborhoods by population. The final
// set is normalized to sum to 1.0.

use crate::entities::BarrioId;
use crate::error::{ReconcileError, ReconcileResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// POPULATION SOURCE
// ============================================================================

/// Read access to neighborhood populations
pub trait PopulationSource {
    fn population(&self, barrio_id: BarrioId, year: i32) -> Option<f64>;

    fn mean_population(&self, barrio_id: BarrioId) -> Option<f64>;
}

/// In-memory population table, built from the demographic fact table
#[derive(Debug, Clone, Default)]
pub struct PopulationTable {
    by_barrio: BTreeMap<BarrioId, BTreeMap<i32, f64>>,
}

impl PopulationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a population; non-positive or non-finite values are ignored
    pub fn insert(&mut self, barrio_id: BarrioId, year: i32, population: f64) {
        if population.is_finite() && population > 0.0 {
            self.by_barrio.entry(barrio_id).or_default().insert(year, population);
        }
    }

    pub fn len(&self) -> usize {
        self.by_barrio.values().map(|years| years.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_barrio.is_empty()
    }
}

impl PopulationSource for PopulationTable {
    fn population(&self, barrio_id: BarrioId, year: i32) -> Option<f64> {
        self.by_barrio.get(&barrio_id)?.get(&year).copied()
    }

    fn mean_population(&self, barrio_id: BarrioId) -> Option<f64> {
        let years = self.by_barrio.get(&barrio_id)?;
        if years.is_empty() {
            return None;
        }
        Some(years.values().sum::<f64>() / years.len() as f64)
    }
}

// ============================================================================
// WEIGHT TIERS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WeightTier {
    ObservedYear,
    HistoricalMean,
    EqualSplit,
}

impl WeightTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            WeightTier::ObservedYear => "observed_year",
            WeightTier::HistoricalMean => "historical_mean",
            WeightTier::EqualSplit => "equal_split",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "observed_year" => Some(WeightTier::ObservedYear),
            "historical_mean" => Some(WeightTier::HistoricalMean),
            "equal_split" => Some(WeightTier::EqualSplit),
            _ => None,
        }
    }
}

/// What a tier contributes for one neighborhood
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawWeight {
    Population(f64),
    EqualShare,
}

/// One fallback tier
pub trait WeightStrategy {
    fn tier(&self) -> WeightTier;

    fn attempt(&self, barrio_id: BarrioId, year: i32, source: &dyn PopulationSource) -> Option<RawWeight>;
}

pub struct ObservedYearPopulation;

impl WeightStrategy for ObservedYearPopulation {
    fn tier(&self) -> WeightTier {
        WeightTier::ObservedYear
    }

    fn attempt(&self, barrio_id: BarrioId, year: i32, source: &dyn PopulationSource) -> Option<RawWeight> {
        source.population(barrio_id, year).map(RawWeight::Population)
    }
}

pub struct HistoricalMeanPopulation;

impl WeightStrategy for HistoricalMeanPopulation {
    fn tier(&self) -> WeightTier {
        WeightTier::HistoricalMean
    }

    fn attempt(&self, barrio_id: BarrioId, _year: i32, source: &dyn PopulationSource) -> Option<RawWeight> {
        source.mean_population(barrio_id).map(RawWeight::Population)
    }
}

pub struct EqualSplit;

impl WeightStrategy for EqualSplit {
    fn tier(&self) -> WeightTier {
        WeightTier::EqualSplit
    }

    fn attempt(&self, _barrio_id: BarrioId, _year: i32, _source: &dyn PopulationSource) -> Option<RawWeight> {
        Some(RawWeight::EqualShare)
    }
}

// ============================================================================
// WEIGHT SET
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSet {
    pub year: i32,
    pub weights: BTreeMap<BarrioId, f64>,
    /// Tier that produced each neighborhood's weight
    pub tiers: BTreeMap<BarrioId, WeightTier>,
}

impl WeightSet {
    pub fn total(&self) -> f64 {
        self.weights.values().sum()
    }

    pub fn scope(&self) -> Vec<BarrioId> {
        self.weights.keys().copied().collect()
    }

    pub fn tier_of(&self, barrio_id: BarrioId) -> Option<WeightTier> {
        self.tiers.get(&barrio_id).copied()
    }

    /// Weights must be finite, non-negative and sum to 1.0 within tolerance
    pub fn check_balance(&self, tolerance: f64) -> ReconcileResult<()> {
        let imbalance = |reason: String| ReconcileError::ApportionmentImbalance {
            scope: self.scope(),
            year: self.year,
            reason,
        };

        if self.weights.is_empty() {
            return Err(imbalance("empty scope".to_string()));
        }
        if let Some((id, w)) = self.weights.iter().find(|(_, w)| !w.is_finite() || **w < 0.0) {
            return Err(imbalance(format!("invalid weight {} for barrio {}", w, id)));
        }
        let total = self.total();
        if (total - 1.0).abs() > tolerance {
            return Err(imbalance(format!("weights sum to {}", total)));
        }
        Ok(())
    }
}

// ============================================================================
// WEIGHT PROVIDER
// ============================================================================

pub struct WeightProvider<'a> {
    source: &'a dyn PopulationSource,
    strategies: Vec<Box<dyn WeightStrategy>>,
    tolerance: f64,
}

impl<'a> WeightProvider<'a> {
    /// Standard chain: observed year, historical mean, equal split
    pub fn new(source: &'a dyn PopulationSource, tolerance: f64) -> Self {
        Self::with_strategies(
            source,
            vec![
                Box::new(ObservedYearPopulation),
                Box::new(HistoricalMeanPopulation),
                Box::new(EqualSplit),
            ],
            tolerance,
        )
    }

    pub fn with_strategies(
        source: &'a dyn PopulationSource,
        strategies: Vec<Box<dyn WeightStrategy>>,
        tolerance: f64,
    ) -> Self {
        WeightProvider {
            source,
            strategies,
            tolerance,
        }
    }

    /// Weights for a scope in a given year
    pub fn weights_for(&self, scope: &[BarrioId], year: i32) -> ReconcileResult<WeightSet> {
        let mut members: Vec<BarrioId> = scope.to_vec();
        members.sort_unstable();
        members.dedup();

        let mut raw: BTreeMap<BarrioId, (WeightTier, RawWeight)> = BTreeMap::new();
        for &barrio_id in &members {
            let found = self.strategies.iter().find_map(|strategy| {
                strategy
                    .attempt(barrio_id, year, self.source)
                    .map(|w| (strategy.tier(), w))
            });

            match found {
                Some(entry) => {
                    raw.insert(barrio_id, entry);
                }
                None => {
                    return Err(ReconcileError::ApportionmentImbalance {
                        scope: members.clone(),
                        year,
                        reason: format!("no weight tier answered for barrio {}", barrio_id),
                    })
                }
            }
        }

        let set = combine(year, members.len(), raw);
        set.check_balance(self.tolerance)?;
        Ok(set)
    }
}

fn combine(year: i32, n: usize, raw: BTreeMap<BarrioId, (WeightTier, RawWeight)>) -> WeightSet {
    let population_total: f64 = raw
        .values()
        .filter_map(|(_, w)| match w {
            RawWeight::Population(p) => Some(*p),
            RawWeight::EqualShare => None,
        })
        .sum();

    let equal_count = raw
        .values()
        .filter(|(_, w)| matches!(w, RawWeight::EqualShare))
        .count();

    // Without usable population mass, everyone falls back to an equal share
    let populated_mass_usable = population_total > 0.0 && population_total.is_finite();
    let equal_share = if n == 0 { 0.0 } else { 1.0 / n as f64 };

    let mut weights = BTreeMap::new();
    let mut tiers = BTreeMap::new();

    for (barrio_id, (tier, w)) in raw {
        let (weight, tier) = match w {
            RawWeight::Population(p) if populated_mass_usable => {
                let remaining = 1.0 - equal_share * equal_count as f64;
                (remaining * p / population_total, tier)
            }
            RawWeight::Population(_) => (equal_share, WeightTier::EqualSplit),
            RawWeight::EqualShare => (equal_share, tier),
        };
        weights.insert(barrio_id, weight);
        tiers.insert(barrio_id, tier);
    }

    // Final normalization
    let total: f64 = weights.values().sum();
    if total > 0.0 && total.is_finite() {
        for w in weights.values_mut() {
            *w /= total;
        }
    }

    WeightSet { year, weights, tiers }
}

// ============================================================================
// TESTS
// ============================================================================
