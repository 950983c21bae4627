// 🧭 Territory Resolver - raw label → barrio_id or aggregate scope
//
// State machine per observation:
//
//   Unresolved → NormalizedLookup → AliasLookup → FuzzyLookup → Resolved
//                                                             ↘ Unresolvable
//
// The lookup tiers are an ordered list of strategies. Adding a tier means
// pushing another `MatchStrategy`; the control flow does not change.
// An unresolvable row is logged and excluded, never fatal to the batch.

use crate::aliases::AliasTable;
use crate::config::ReferenceData;
use crate::entities::{BarrioId, DistrictId, NameIndex, NeighborhoodRegistry};
use crate::error::ReconcileError;
use crate::fuzzy::FuzzyMatcher;
use crate::normalizer::NameNormalizer;
use crate::parser::{Granularity, RawTerritoryObservation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

// ============================================================================
// STATES & OUTCOMES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionState {
    Unresolved,
    NormalizedLookup,
    AliasLookup,
    FuzzyLookup,
    Resolved,
    Unresolvable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionMethod {
    Alias,
    Fuzzy,
    /// Municipality rows need no name matching
    Municipality,
}

impl ResolutionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionMethod::Alias => "alias",
            ResolutionMethod::Fuzzy => "fuzzy",
            ResolutionMethod::Municipality => "municipality",
        }
    }
}

/// Where a resolved observation lands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TerritoryScope {
    Barrio(BarrioId),
    District {
        district_id: DistrictId,
        barrio_ids: Vec<BarrioId>,
    },
    Municipality {
        barrio_ids: Vec<BarrioId>,
    },
}

impl TerritoryScope {
    pub fn is_aggregate(&self) -> bool {
        !matches!(self, TerritoryScope::Barrio(_))
    }

    /// Member neighborhoods, ascending
    pub fn barrio_ids(&self) -> Vec<BarrioId> {
        match self {
            TerritoryScope::Barrio(id) => vec![*id],
            TerritoryScope::District { barrio_ids, .. } => barrio_ids.clone(),
            TerritoryScope::Municipality { barrio_ids } => barrio_ids.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResolutionOutcome {
    Resolved {
        scope: TerritoryScope,
        method: ResolutionMethod,
        /// Similarity of the accepted match (1.0 for alias hits)
        score: f64,
        matched_name: String,
    },
    Unresolvable {
        /// Best fuzzy score seen, for the audit trail
        best_score: Option<f64>,
        /// Set when a tier stopped the chain instead of just missing
        #[serde(default)]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub observation: RawTerritoryObservation,
    pub normalized_label: String,
    /// States visited, in order
    pub trail: Vec<ResolutionState>,
    pub outcome: ResolutionOutcome,
}

impl Resolution {
    pub fn state(&self) -> ResolutionState {
        self.trail.last().copied().unwrap_or(ResolutionState::Unresolved)
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.outcome, ResolutionOutcome::Resolved { .. })
    }

    pub fn scope(&self) -> Option<&TerritoryScope> {
        match &self.outcome {
            ResolutionOutcome::Resolved { scope, .. } => Some(scope),
            ResolutionOutcome::Unresolvable { .. } => None,
        }
    }

    pub fn method(&self) -> Option<ResolutionMethod> {
        match &self.outcome {
            ResolutionOutcome::Resolved { method, .. } => Some(*method),
            ResolutionOutcome::Unresolvable { .. } => None,
        }
    }

    /// The error record for an unresolvable row
    pub fn to_error(&self) -> Option<ReconcileError> {
        match self.outcome {
            ResolutionOutcome::Unresolvable { .. } => Some(ReconcileError::UnresolvableTerritory {
                label: self.observation.raw_territory_label.clone(),
                source_id: self.observation.source_id.clone(),
                year: self.observation.year,
            }),
            ResolutionOutcome::Resolved { .. } => None,
        }
    }
}

// ============================================================================
// STRATEGIES
// ============================================================================

/// One tier's answer
#[derive(Debug, Clone, PartialEq)]
pub struct TierMatch {
    pub id: u32,
    pub score: f64,
    pub matched_name: String,
}

/// What a failed tier reports back (best fuzzy score, if any)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TierMiss {
    pub best_score: Option<f64>,
    /// Later tiers must not run: the label is known but cannot resolve here
    pub halt: Option<String>,
}

impl TierMiss {
    pub fn halt(reason: String) -> Self {
        TierMiss {
            best_score: None,
            halt: Some(reason),
        }
    }
}

/// A lookup tier. Strategies are tried in order; the first match wins.
pub trait MatchStrategy: Send + Sync {
    /// State the resolver is in while this tier runs
    fn state(&self) -> ResolutionState;

    fn method(&self) -> ResolutionMethod;

    fn attempt(&self, normalized: &str, index: &NameIndex) -> Result<TierMatch, TierMiss>;
}

/// Tier 1: reviewed alias overrides (cheap, authoritative)
pub struct AliasStrategy {
    aliases: Arc<AliasTable>,
    normalizer: NameNormalizer,
}

impl AliasStrategy {
    pub fn new(aliases: Arc<AliasTable>, normalizer: NameNormalizer) -> Self {
        AliasStrategy { aliases, normalizer }
    }
}

impl MatchStrategy for AliasStrategy {
    fn state(&self) -> ResolutionState {
        ResolutionState::AliasLookup
    }

    fn method(&self) -> ResolutionMethod {
        ResolutionMethod::Alias
    }

    fn attempt(&self, normalized: &str, index: &NameIndex) -> Result<TierMatch, TierMiss> {
        let canonical = self.aliases.lookup(normalized).ok_or_default()?;
        let target = self.normalizer.normalize(canonical);
        // A reviewed alias naming the other level is final; fuzzy would pick a wrong near-name
        let id = index.get(&target).ok_or_else(|| {
            TierMiss::halt(format!(
                "alias '{}' targets '{}', which is not a name at this level",
                normalized, canonical
            ))
        })?;

        Ok(TierMatch {
            id,
            score: 1.0,
            matched_name: target,
        })
    }
}

/// Tier 2: approximate match against the canonical names
pub struct FuzzyStrategy {
    matcher: FuzzyMatcher,
}

impl FuzzyStrategy {
    pub fn new(matcher: FuzzyMatcher) -> Self {
        FuzzyStrategy { matcher }
    }
}

impl MatchStrategy for FuzzyStrategy {
    fn state(&self) -> ResolutionState {
        ResolutionState::FuzzyLookup
    }

    fn method(&self) -> ResolutionMethod {
        ResolutionMethod::Fuzzy
    }

    fn attempt(&self, normalized: &str, index: &NameIndex) -> Result<TierMatch, TierMiss> {
        let best = self.matcher.best_candidate(normalized, index.candidates());

        match best {
            Some(m) if m.score >= self.matcher.threshold() && !normalized.is_empty() => {
                let id = index.get(&m.candidate).ok_or_default()?;
                Ok(TierMatch {
                    id,
                    score: m.score,
                    matched_name: m.candidate,
                })
            }
            Some(m) => Err(TierMiss {
                best_score: Some(m.score),
                halt: None,
            }),
            None => Err(TierMiss::default()),
        }
    }
}

trait OkOrDefault<T> {
    fn ok_or_default(self) -> Result<T, TierMiss>;
}

impl<T> OkOrDefault<T> for Option<T> {
    fn ok_or_default(self) -> Result<T, TierMiss> {
        self.ok_or(TierMiss::default())
    }
}

// ============================================================================
// TERRITORY RESOLVER
// ============================================================================

pub struct TerritoryResolver {
    normalizer: NameNormalizer,
    registry: Arc<NeighborhoodRegistry>,
    strategies: Vec<Box<dyn MatchStrategy>>,
}

impl TerritoryResolver {
    /// Standard chain: alias table, then fuzzy matcher
    pub fn new(reference: &ReferenceData, fuzzy_threshold: f64) -> Self {
        let strategies: Vec<Box<dyn MatchStrategy>> = vec![
            Box::new(AliasStrategy::new(
                Arc::clone(&reference.aliases),
                reference.normalizer.clone(),
            )),
            Box::new(FuzzyStrategy::new(FuzzyMatcher::with_threshold(fuzzy_threshold))),
        ];
        Self::with_strategies(reference, strategies)
    }

    pub fn with_strategies(reference: &ReferenceData, strategies: Vec<Box<dyn MatchStrategy>>) -> Self {
        TerritoryResolver {
            normalizer: reference.normalizer.clone(),
            registry: Arc::clone(&reference.registry),
            strategies,
        }
    }

    pub fn registry(&self) -> &NeighborhoodRegistry {
        &self.registry
    }

    /// Resolve one observation. Never fails; unresolvable rows are reported as such.
    pub fn resolve(&self, observation: RawTerritoryObservation) -> Resolution {
        let mut trail = vec![ResolutionState::Unresolved, ResolutionState::NormalizedLookup];
        let normalized = self.normalizer.normalize(&observation.raw_territory_label);

        if observation.granularity == Granularity::Municipality {
            trail.push(ResolutionState::Resolved);
            debug!(label = %observation.raw_territory_label, "municipality scope");
            return Resolution {
                observation,
                normalized_label: normalized,
                trail,
                outcome: ResolutionOutcome::Resolved {
                    scope: TerritoryScope::Municipality {
                        barrio_ids: self.registry.all_ids(),
                    },
                    method: ResolutionMethod::Municipality,
                    score: 1.0,
                    matched_name: "municipality".to_string(),
                },
            };
        }

        let index = match observation.granularity {
            Granularity::District => self.registry.district_index(),
            _ => self.registry.barrio_index(),
        };

        let mut best_score: Option<f64> = None;
        let mut reason: Option<String> = None;
        for strategy in &self.strategies {
            trail.push(strategy.state());

            match strategy.attempt(&normalized, index) {
                Ok(hit) => {
                    trail.push(ResolutionState::Resolved);
                    let scope = self.scope_for(observation.granularity, hit.id);
                    debug!(
                        label = %observation.raw_territory_label,
                        matched = %hit.matched_name,
                        method = strategy.method().as_str(),
                        score = hit.score,
                        "territory resolved"
                    );
                    return Resolution {
                        observation,
                        normalized_label: normalized,
                        trail,
                        outcome: ResolutionOutcome::Resolved {
                            scope,
                            method: strategy.method(),
                            score: hit.score,
                            matched_name: hit.matched_name,
                        },
                    };
                }
                Err(miss) => {
                    if let Some(score) = miss.best_score {
                        best_score = Some(best_score.map_or(score, |b: f64| b.max(score)));
                    }
                    if miss.halt.is_some() {
                        reason = miss.halt;
                        break;
                    }
                }
            }
        }

        trail.push(ResolutionState::Unresolvable);
        warn!(
            source = %observation.source_id,
            label = %observation.raw_territory_label,
            year = observation.year,
            granularity = observation.granularity.as_str(),
            best_score = ?best_score,
            reason = ?reason,
            "unresolvable territory, row excluded"
        );

        Resolution {
            observation,
            normalized_label: normalized,
            trail,
            outcome: ResolutionOutcome::Unresolvable { best_score, reason },
        }
    }

    pub fn resolve_batch(&self, observations: Vec<RawTerritoryObservation>) -> Vec<Resolution> {
        observations.into_iter().map(|o| self.resolve(o)).collect()
    }

    fn scope_for(&self, granularity: Granularity, id: u32) -> TerritoryScope {
        match granularity {
            Granularity::District => TerritoryScope::District {
                district_id: id,
                barrio_ids: self
                    .registry
                    .district(id)
                    .map(|d| d.barrio_ids.clone())
                    .unwrap_or_default(),
            },
            Granularity::Municipality => TerritoryScope::Municipality {
                barrio_ids: self.registry.all_ids(),
            },
            Granularity::Neighborhood => TerritoryScope::Barrio(id),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::entities::neighborhood::tests::barcelona;
    use chrono::{TimeZone, Utc};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn barcelona_reference() -> ReferenceData {
        let normalizer = NameNormalizer::new();
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/aliases.toml");
        ReferenceData {
            aliases: Arc::new(AliasTable::from_file(path, &normalizer).unwrap()),
            registry: Arc::new(barcelona()),
            normalizer,
        }
    }

    pub(crate) fn observation(label: &str, granularity: Granularity) -> RawTerritoryObservation {
        RawTerritoryObservation {
            raw_territory_label: label.to_string(),
            granularity,
            year: 2020,
            quarter: None,
            indicator_id: "poblacion".to_string(),
            value: 1000.0,
            source_id: "opendata_bcn".to_string(),
            extracted_at: Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap(),
        }
    }

    /// Fuzzy tier that counts how often it is consulted
    struct CountingFuzzy {
        inner: FuzzyStrategy,
        calls: Arc<AtomicUsize>,
    }

    impl MatchStrategy for CountingFuzzy {
        fn state(&self) -> ResolutionState {
            self.inner.state()
        }
        fn method(&self) -> ResolutionMethod {
            self.inner.method()
        }
        fn attempt(&self, normalized: &str, index: &NameIndex) -> Result<TierMatch, TierMiss> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.attempt(normalized, index)
        }
    }

    #[test]
    fn test_vila_olimpica_resolves_via_fuzzy() {
        let reference = barcelona_reference();
        let resolver = TerritoryResolver::new(&reference, 0.82);

        assert_eq!(reference.aliases.lookup("vila olimpica del poblenou"), None);

        let res = resolver.resolve(observation("la Vila Olímpica del Poblenou", Granularity::Neighborhood));

        assert_eq!(res.state(), ResolutionState::Resolved);
        assert_eq!(res.scope(), Some(&TerritoryScope::Barrio(67)));
        assert_eq!(res.method(), Some(ResolutionMethod::Fuzzy));
        match res.outcome {
            ResolutionOutcome::Resolved { score, .. } => assert!(score >= 0.82),
            _ => panic!("expected resolved"),
        }
        assert_eq!(
            res.trail,
            vec![
                ResolutionState::Unresolved,
                ResolutionState::NormalizedLookup,
                ResolutionState::AliasLookup,
                ResolutionState::FuzzyLookup,
                ResolutionState::Resolved,
            ]
        );
    }

    #[test]
    fn test_alias_hit_never_reaches_fuzzy() {
        let reference = barcelona_reference();
        let calls = Arc::new(AtomicUsize::new(0));
        let strategies: Vec<Box<dyn MatchStrategy>> = vec![
            Box::new(AliasStrategy::new(
                Arc::clone(&reference.aliases),
                reference.normalizer.clone(),
            )),
            Box::new(CountingFuzzy {
                inner: FuzzyStrategy::new(FuzzyMatcher::new()),
                calls: Arc::clone(&calls),
            }),
        ];
        let resolver = TerritoryResolver::with_strategies(&reference, strategies);

        let res = resolver.resolve(observation("Gòtic", Granularity::Neighborhood));

        assert_eq!(res.scope(), Some(&TerritoryScope::Barrio(2)));
        assert_eq!(res.method(), Some(ResolutionMethod::Alias));
        assert!(!res.trail.contains(&ResolutionState::FuzzyLookup));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // A miss does consult the fuzzy tier
        resolver.resolve(observation("el Ravall", Granularity::Neighborhood));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_alias_to_district_stops_neighborhood_lookup() {
        let reference = barcelona_reference();
        let calls = Arc::new(AtomicUsize::new(0));
        let strategies: Vec<Box<dyn MatchStrategy>> = vec![
            Box::new(AliasStrategy::new(
                Arc::clone(&reference.aliases),
                reference.normalizer.clone(),
            )),
            Box::new(CountingFuzzy {
                inner: FuzzyStrategy::new(FuzzyMatcher::new()),
                calls: Arc::clone(&calls),
            }),
        ];
        let resolver = TerritoryResolver::with_strategies(&reference, strategies);

        // "St. Martí" is the district; as a barrio label it must not drift to a near-name
        let res = resolver.resolve(observation("St. Martí", Granularity::Neighborhood));

        assert_eq!(res.state(), ResolutionState::Unresolvable);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!res.trail.contains(&ResolutionState::FuzzyLookup));
        match &res.outcome {
            ResolutionOutcome::Unresolvable { reason, .. } => {
                assert!(reason.as_deref().unwrap_or_default().contains("Sant Martí"))
            }
            _ => panic!("expected unresolvable"),
        }

        // Same alias at district level resolves
        let res = resolver.resolve(observation("St. Martí", Granularity::District));
        assert!(res.is_resolved());
        assert_eq!(res.method(), Some(ResolutionMethod::Alias));
    }

    #[test]
    fn test_below_threshold_is_unresolvable() {
        let normalizer = NameNormalizer::new();
        let registry = NeighborhoodRegistry::from_rows(
            vec![(1, "Abcd".to_string(), 1, "Districte".to_string())],
            &normalizer,
        )
        .unwrap();
        let reference = ReferenceData {
            normalizer,
            registry: Arc::new(registry),
            aliases: Arc::new(AliasTable::empty()),
        };
        let resolver = TerritoryResolver::new(&reference, 0.82);

        let res = resolver.resolve(observation("Abcx", Granularity::Neighborhood));

        assert_eq!(res.state(), ResolutionState::Unresolvable);
        assert!(!res.is_resolved());
        match &res.outcome {
            ResolutionOutcome::Unresolvable { best_score, reason } => {
                assert!(((*best_score).unwrap() - 0.75).abs() < 1e-9);
                assert_eq!(*reason, None);
            }
            _ => panic!("expected unresolvable"),
        }
        assert!(matches!(
            res.to_error(),
            Some(ReconcileError::UnresolvableTerritory { year: 2020, .. })
        ));
    }

    #[test]
    fn test_mojibake_and_typos_resolve() {
        let reference = barcelona_reference();
        let resolver = TerritoryResolver::new(&reference, 0.82);

        let res = resolver.resolve(observation("la Vila de GrÃ\u{a0}cia", Granularity::Neighborhood));
        assert_eq!(res.scope(), Some(&TerritoryScope::Barrio(31)));

        let res = resolver.resolve(observation("Sant Marti de Provencal", Granularity::Neighborhood));
        assert_eq!(res.scope(), Some(&TerritoryScope::Barrio(72)));
    }

    #[test]
    fn test_unknown_label_unresolvable() {
        let reference = barcelona_reference();
        let resolver = TerritoryResolver::new(&reference, 0.82);

        let res = resolver.resolve(observation("Badalona Centre", Granularity::Neighborhood));
        assert_eq!(res.state(), ResolutionState::Unresolvable);
    }

    #[test]
    fn test_district_scope() {
        let reference = barcelona_reference();
        let resolver = TerritoryResolver::new(&reference, 0.82);

        let res = resolver.resolve(observation("Ciutat Vella", Granularity::District));
        assert_eq!(
            res.scope(),
            Some(&TerritoryScope::District {
                district_id: 1,
                barrio_ids: vec![1, 2, 3, 4],
            })
        );

        // Same label, different level
        let as_barrio = resolver.resolve(observation("Sant Andreu", Granularity::Neighborhood));
        let as_district = resolver.resolve(observation("St. Andreu", Granularity::District));
        assert_eq!(as_barrio.scope(), Some(&TerritoryScope::Barrio(60)));
        assert!(matches!(
            as_district.scope(),
            Some(TerritoryScope::District { district_id: 9, .. })
        ));
    }

    #[test]
    fn test_municipality_scope_covers_all() {
        let reference = barcelona_reference();
        let resolver = TerritoryResolver::new(&reference, 0.82);

        let res = resolver.resolve(observation("Barcelona", Granularity::Municipality));
        let scope = res.scope().unwrap();
        assert!(scope.is_aggregate());
        assert_eq!(scope.barrio_ids().len(), 73);
        assert_eq!(res.method(), Some(ResolutionMethod::Municipality));
    }
}
