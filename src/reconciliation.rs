// ⚖️ Reconciliation Engine - one pass from source batches to the warehouse
//
//   record run → validate → resolve → population table → apportion
//              → merge → persist (single transaction) → coverage
//
// Per-row failures are excluded, counted and logged. Only configuration
// errors and database failures abort the run.

use crate::apportionment::{ApportionmentEngine, ResolvedObservation};
use crate::config::{EngineConfig, ReferenceData};
use crate::coverage::{CoverageReport, CoverageTracker};
use crate::db::{self, ConflictRecord, Event, FactTable, ManifestRun};
use crate::deduplication::{DeduplicationEngine, MergeOutcome, NoExistingFacts};
use crate::entities::BarrioId;
use crate::error::{ReconcileError, ReconcileResult};
use crate::parser::{RawTerritoryObservation, SourceBatch};
use crate::resolver::{Resolution, ResolutionOutcome, TerritoryResolver, TerritoryScope};
use crate::schema::ObservationSchema;
use crate::weights::{PopulationTable, WeightProvider};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

const ACTOR: &str = "reconciliation_engine";

// ============================================================================
// RECONCILIATION REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub alias_version: String,

    pub facts_written: usize,
    pub inserted: usize,
    pub replaced: usize,
    pub superseded: usize,

    pub schema_violations: Vec<ReconcileError>,
    pub unresolvable: Vec<ReconcileError>,
    pub apportionment_failures: Vec<ReconcileError>,
    pub conflicts: Vec<ReconcileError>,

    pub coverage: CoverageReport,
}

impl ReconciliationReport {
    pub fn summary(&self) -> String {
        format!(
            "Run {}: {} facts written ({} new, {} replaced), {} superseded, {} conflicts held, {} unresolvable, {} schema rejections, {} apportionment failures",
            self.run_id,
            self.facts_written,
            self.inserted,
            self.replaced,
            self.superseded,
            self.conflicts.len(),
            self.unresolvable.len(),
            self.schema_violations.len(),
            self.apportionment_failures.len()
        )
    }

    pub fn is_clean(&self) -> bool {
        self.unresolvable.is_empty()
            && self.conflicts.is_empty()
            && self.apportionment_failures.is_empty()
            && self.schema_violations.is_empty()
    }

    /// Per-source/year resolution table
    pub fn resolution_table(&self) -> Vec<String> {
        self.coverage.table_lines()
    }
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

pub struct ReconciliationEngine {
    config: EngineConfig,
    reference: ReferenceData,
    schema: ObservationSchema,
    resolver: TerritoryResolver,
    apportioner: ApportionmentEngine,
    merger: DeduplicationEngine,
}

impl ReconciliationEngine {
    pub fn new(config: EngineConfig, reference: ReferenceData) -> Self {
        let resolver = TerritoryResolver::new(&reference, config.fuzzy_threshold);
        let apportioner = ApportionmentEngine::with_tolerance(config.weight_tolerance);
        let merger = DeduplicationEngine::new(config.fact_tables.clone())
            .with_tolerance(config.conflict_tolerance);

        ReconciliationEngine {
            config,
            reference,
            schema: ObservationSchema::new(),
            resolver,
            apportioner,
            merger,
        }
    }

    /// Load reference data from the configured paths
    pub fn from_config(config: EngineConfig) -> ReconcileResult<Self> {
        let reference = config.load_reference()?;
        Ok(Self::new(config, reference))
    }

    pub fn reference(&self) -> &ReferenceData {
        &self.reference
    }

    /// Create the schema and seed dim_barrios (idempotent)
    pub fn prepare(&self, conn: &Connection) -> Result<usize> {
        db::setup_database(conn)?;
        db::seed_neighborhoods(conn, &self.reference.registry)
    }

    pub fn run(&self, conn: &mut Connection, batches: Vec<SourceBatch>) -> Result<ReconciliationReport> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let alias_version = self.reference.aliases.version().to_string();

        db::insert_run(
            conn,
            &ManifestRun {
                run_id: run_id.clone(),
                started_at,
                finished_at: None,
                alias_version: alias_version.clone(),
                sources: batches.iter().map(|b| b.source_id().to_string()).collect(),
                facts_written: 0,
            },
        )
        .context("Failed to record manifest run")?;

        info!(run_id = %run_id, sources = batches.len(), alias_version = %alias_version, "run started");

        let mut tracker = CoverageTracker::new();
        let mut events = Vec::new();

        // 1. Validate
        let (observations, schema_violations) = self.validate(batches, &mut tracker);

        // 2. Resolve
        let resolutions = self.resolver.resolve_batch(observations);
        let mut unresolvable = Vec::new();
        for resolution in &resolutions {
            let obs = &resolution.observation;
            match &resolution.outcome {
                ResolutionOutcome::Resolved { .. } => tracker.record_resolved(&obs.source_id, obs.year),
                ResolutionOutcome::Unresolvable { best_score, reason } => {
                    tracker.record_unresolvable(&obs.source_id, obs.year);
                    events.push(Event::new(
                        "territory_unresolvable",
                        "observation",
                        &obs.raw_territory_label,
                        serde_json::json!({
                            "source_id": obs.source_id,
                            "year": obs.year,
                            "indicator_id": obs.indicator_id,
                            "normalized_label": resolution.normalized_label,
                            "best_score": best_score,
                            "reason": reason,
                        }),
                        ACTOR,
                    ));
                    if let Some(err) = resolution.to_error() {
                        unresolvable.push(err);
                    }
                }
            }
        }

        // 3. Population table: warehouse rows plus this batch's neighborhood rows
        let population = self.population_table(conn, &resolutions, &run_id)?;

        // 4. Apportion
        let (resolved, apportionment_failures) =
            self.apportion(resolutions, &population, &mut tracker, &mut events);

        // 5. Merge
        let keys: Vec<(FactTable, db::FactKey)> = resolved
            .iter()
            .map(|r| {
                let row = self.merger.to_fact_row(r, &run_id);
                (row.table, row.key())
            })
            .collect();
        let existing = db::load_existing_facts(conn, &keys)?;
        let outcome = self.merger.merge(&resolved, &run_id, &existing);

        for conflict in &outcome.conflicts {
            tracker.record_conflict(&conflict.incoming.source_id);
        }
        let coverage = tracker.finish(&run_id);

        // 6. Persist
        let facts_written = self.persist(conn, &run_id, &outcome, &coverage, events)?;

        let report = ReconciliationReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            alias_version,
            facts_written,
            inserted: outcome.inserted(),
            replaced: outcome.replaced(),
            superseded: outcome.superseded.len(),
            schema_violations,
            unresolvable,
            apportionment_failures,
            conflicts: outcome.conflicts.iter().map(|c| c.to_error()).collect(),
            coverage,
        };

        info!("{}", report.summary());
        info!("{}", report.coverage.summary());
        Ok(report)
    }

    fn validate(
        &self,
        batches: Vec<SourceBatch>,
        tracker: &mut CoverageTracker,
    ) -> (Vec<RawTerritoryObservation>, Vec<ReconcileError>) {
        let mut observations = Vec::new();
        let mut violations = Vec::new();

        for batch in batches {
            match batch {
                SourceBatch::Failed { source_id, reason } => {
                    warn!(source = %source_id, reason = %reason, "source skipped");
                    tracker.record_extraction_failure(&source_id, &reason);
                }
                SourceBatch::Fetched { source_id, records } => {
                    tracker.register(&source_id);
                    for record in &records {
                        match self.schema.validate(record) {
                            Ok(obs) => observations.push(obs),
                            Err(errors) => {
                                let source = record.source_id.as_deref().unwrap_or(&source_id);
                                tracker.record_schema_rejection(source);
                                warn!(
                                    source = %source,
                                    label = ?record.raw_territory_label,
                                    errors = errors.len(),
                                    "schema violation, row rejected"
                                );
                                violations.extend(errors);
                            }
                        }
                    }
                }
            }
        }

        (observations, violations)
    }

    /// Warehouse population, overlaid with this batch's neighborhood rows.
    ///
    /// Batch rows go through the same merge as facts, so duplicates collapse
    /// to the latest extraction before sources are averaged.
    fn population_table(
        &self,
        conn: &Connection,
        resolutions: &[Resolution],
        run_id: &str,
    ) -> Result<PopulationTable> {
        let indicator = &self.config.population_indicator;
        let table = FactTable::route(indicator, &self.config.fact_tables);
        let mut population = db::load_population_table(conn, table, indicator)?;

        let batch_rows: Vec<ResolvedObservation> = resolutions
            .iter()
            .filter(|r| &r.observation.indicator_id == indicator && r.observation.quarter.is_none())
            .filter_map(|r| match &r.outcome {
                ResolutionOutcome::Resolved {
                    scope: TerritoryScope::Barrio(barrio_id),
                    method,
                    ..
                } => Some(ResolvedObservation::direct(r.observation.clone(), *barrio_id, *method)),
                _ => None,
            })
            .collect();

        let winners = self.merger.merge(&batch_rows, run_id, &NoExistingFacts);
        let mut by_barrio_year: BTreeMap<(BarrioId, i32), Vec<f64>> = BTreeMap::new();
        for row in winners.fact_rows() {
            by_barrio_year.entry((row.barrio_id, row.year)).or_default().push(row.value);
        }
        for ((barrio_id, year), values) in by_barrio_year {
            population.insert(barrio_id, year, values.iter().sum::<f64>() / values.len() as f64);
        }

        Ok(population)
    }

    fn apportion(
        &self,
        resolutions: Vec<Resolution>,
        population: &PopulationTable,
        tracker: &mut CoverageTracker,
        events: &mut Vec<Event>,
    ) -> (Vec<ResolvedObservation>, Vec<ReconcileError>) {
        let provider = WeightProvider::new(population, self.config.weight_tolerance);
        let mut resolved = Vec::new();
        let mut failures = Vec::new();

        for resolution in resolutions {
            let (scope, method) = match resolution.outcome {
                ResolutionOutcome::Resolved { scope, method, .. } => (scope, method),
                ResolutionOutcome::Unresolvable { .. } => continue,
            };
            let obs = resolution.observation;

            if let TerritoryScope::Barrio(barrio_id) = scope {
                resolved.push(ResolvedObservation::direct(obs, barrio_id, method));
                continue;
            }

            let result = provider
                .weights_for(&scope.barrio_ids(), obs.year)
                .and_then(|weights| self.apportioner.apportion(&obs, &weights, method));

            match result {
                Ok(children) => resolved.extend(children),
                Err(err) => {
                    warn!(
                        source = %obs.source_id,
                        label = %obs.raw_territory_label,
                        year = obs.year,
                        error = %err,
                        "apportionment failed, observation excluded"
                    );
                    tracker.record_apportionment_failure(&obs.source_id);
                    events.push(Event::new(
                        "apportionment_failed",
                        "observation",
                        &obs.raw_territory_label,
                        serde_json::json!({
                            "source_id": obs.source_id,
                            "year": obs.year,
                            "indicator_id": obs.indicator_id,
                            "error": err.to_string(),
                        }),
                        ACTOR,
                    ));
                    failures.push(err);
                }
            }
        }

        (resolved, failures)
    }

    fn persist(
        &self,
        conn: &mut Connection,
        run_id: &str,
        outcome: &MergeOutcome,
        coverage: &CoverageReport,
        mut events: Vec<Event>,
    ) -> Result<usize> {
        for superseded in &outcome.superseded {
            events.push(Event::new(
                "row_superseded",
                "fact",
                &superseded.loser.key().hash(),
                serde_json::json!({
                    "key": superseded.loser.key().to_string(),
                    "discarded_value": superseded.loser.value,
                    "winner_extracted_at": superseded.winner_extracted_at.to_rfc3339(),
                    "reason": superseded.reason,
                }),
                ACTOR,
            ));
        }

        let detected_at = Utc::now();
        let conflicts: Vec<ConflictRecord> = outcome
            .conflicts
            .iter()
            .map(|c| ConflictRecord {
                id: 0,
                key_hash: c.incoming.key().hash(),
                table: c.incoming.table,
                incoming: c.incoming.clone(),
                existing_value: c.existing,
                existing_run_id: c.existing_run_id.clone(),
                detected_at,
                resolved: false,
            })
            .collect();

        let tx = conn.transaction().context("Failed to open transaction")?;

        let written = db::upsert_facts(&tx, &outcome.fact_rows())?;
        for conflict in &conflicts {
            if !db::insert_conflict(&tx, conflict)? {
                debug!(key = %conflict.incoming.key(), "conflict already held for review");
                continue;
            }
            events.push(Event::new(
                "key_conflict",
                "fact",
                &conflict.key_hash,
                serde_json::json!({
                    "key": conflict.incoming.key().to_string(),
                    "existing": conflict.existing_value,
                    "existing_run_id": conflict.existing_run_id,
                    "incoming": conflict.incoming.value,
                }),
                ACTOR,
            ));
        }
        for event in &events {
            db::insert_event(&tx, event)?;
        }
        db::insert_coverage(&tx, coverage)?;
        db::finish_run(&tx, run_id, written as i64)?;

        tx.commit().context("Failed to commit run")?;
        Ok(written)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::FactQuery;
    use crate::parser::RawRecord;
    use crate::resolver::tests::barcelona_reference;

    const EXTRACTED: &str = "2024-01-10T00:00:00Z";

    fn engine() -> ReconciliationEngine {
        ReconciliationEngine::new(EngineConfig::default(), barcelona_reference())
    }

    fn warehouse(engine: &ReconciliationEngine) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        engine.prepare(&conn).unwrap();
        conn
    }

    fn fetched(source_id: &str, records: Vec<RawRecord>) -> SourceBatch {
        SourceBatch::Fetched {
            source_id: source_id.to_string(),
            records,
        }
    }

    #[test]
    fn test_prices_for_same_barrio_year_both_persist() {
        let engine = engine();
        let mut conn = warehouse(&engine);

        let batch = fetched(
            "idealista",
            vec![
                RawRecord::new("el Barri Gòtic", "barri", 2020, "precio_m2_venta", 4500.0, "idealista", EXTRACTED),
                RawRecord::new("Gòtic", "barri", 2020, "precio_mes_alquiler", 1100.0, "idealista", EXTRACTED),
            ],
        );

        let report = engine.run(&mut conn, vec![batch]).unwrap();
        assert_eq!(report.facts_written, 2);

        let query = FactQuery {
            barrio_id: Some(2),
            year: Some(2020),
            ..FactQuery::default()
        };
        let facts = db::get_facts(&conn, FactTable::Precios, &query).unwrap();
        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].indicator_id, "precio_m2_venta");
        assert_eq!(facts[1].indicator_id, "precio_mes_alquiler");
    }

    #[test]
    fn test_district_value_apportioned_by_batch_population() {
        let engine = engine();
        let mut conn = warehouse(&engine);

        let batch = fetched(
            "ine_adrh",
            vec![
                RawRecord::new("el Raval", "barri", 2020, "poblacion", 1000.0, "padro", EXTRACTED),
                RawRecord::new("el Barri Gòtic", "barri", 2020, "poblacion", 2000.0, "padro", EXTRACTED),
                RawRecord::new("la Barceloneta", "barri", 2020, "poblacion", 3000.0, "padro", EXTRACTED),
                RawRecord::new("el Born", "barri", 2020, "poblacion", 4000.0, "padro", EXTRACTED),
                RawRecord::new("Ciutat Vella", "districte", 2020, "renta_media_persona", 30000.0, "ine_adrh", EXTRACTED),
            ],
        );

        let report = engine.run(&mut conn, vec![batch]).unwrap();
        assert!(report.is_clean(), "{}", report.summary());

        let renta = db::get_facts(&conn, FactTable::Renta, &FactQuery::default()).unwrap();
        assert_eq!(renta.len(), 4);
        let values: Vec<f64> = renta.iter().map(|f| f.value).collect();
        for (got, want) in values.iter().zip([3000.0, 6000.0, 9000.0, 12000.0]) {
            assert!((got - want).abs() < 1e-6, "got {} want {}", got, want);
        }
        assert!((values.iter().sum::<f64>() - 30000.0).abs() < 1e-6);
        assert!(renta.iter().all(|f| f.apportioned));
    }

    #[test]
    fn test_batch_population_follows_latest_extraction() {
        let engine = engine();
        let mut conn = warehouse(&engine);

        // The stale Raval count comes later in the batch but was extracted earlier
        let batch = fetched(
            "ine_adrh",
            vec![
                RawRecord::new("el Raval", "barri", 2020, "poblacion", 3000.0, "padro", "2024-03-01"),
                RawRecord::new("el Barri Gòtic", "barri", 2020, "poblacion", 2000.0, "padro", EXTRACTED),
                RawRecord::new("la Barceloneta", "barri", 2020, "poblacion", 3000.0, "padro", EXTRACTED),
                RawRecord::new("el Born", "barri", 2020, "poblacion", 4000.0, "padro", EXTRACTED),
                RawRecord::new("Raval", "barri", 2020, "poblacion", 1000.0, "padro", "2024-01-01"),
                RawRecord::new("Ciutat Vella", "districte", 2020, "renta_media_persona", 40000.0, "ine_adrh", EXTRACTED),
            ],
        );

        let report = engine.run(&mut conn, vec![batch]).unwrap();
        assert_eq!(report.superseded, 1);

        let query = FactQuery {
            barrio_id: Some(1),
            ..FactQuery::default()
        };
        let raval_renta = db::get_facts(&conn, FactTable::Renta, &query).unwrap();
        assert_eq!(raval_renta.len(), 1);
        assert!((raval_renta[0].value - 10000.0).abs() < 1e-6, "got {}", raval_renta[0].value);

        let raval_population = db::get_facts(&conn, FactTable::Demografia, &query).unwrap();
        assert_eq!(raval_population[0].value, 3000.0);
    }

    #[test]
    fn test_near_miss_label_excluded_with_score_in_audit_trail() {
        let engine = engine();
        let mut conn = warehouse(&engine);

        // "carmelet" vs "carmel": normalized Levenshtein 0.75, under the 0.82 threshold
        let batch = fetched(
            "opendata_bcn",
            vec![
                RawRecord::new("el Carmelet", "barri", 2020, "poblacion", 31000.0, "opendata_bcn", EXTRACTED),
                RawRecord::new("el Carmel", "barri", 2020, "poblacion", 32000.0, "opendata_bcn", EXTRACTED),
            ],
        );
        let report = engine.run(&mut conn, vec![batch]).unwrap();

        assert_eq!(report.unresolvable.len(), 1);
        assert_eq!(report.facts_written, 1);
        let facts = db::get_facts(&conn, FactTable::Demografia, &FactQuery::default()).unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].raw_territory_label, "el Carmel");

        let events = db::get_events_for_entity(&conn, "observation", "el Carmelet").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "territory_unresolvable");
        let best_score = events[0].data["best_score"].as_f64().unwrap();
        assert!((best_score - 0.75).abs() < 1e-9, "best_score {}", best_score);
        assert!(best_score < 0.82);
    }

    #[test]
    fn test_unresolvable_and_failed_sources_in_coverage() {
        let engine = engine();
        let mut conn = warehouse(&engine);

        let batches = vec![
            fetched(
                "opendata_bcn",
                vec![
                    RawRecord::new("la Vila Olímpica del Poblenou", "barri", 2020, "poblacion", 9000.0, "opendata_bcn", EXTRACTED),
                    RawRecord::new("Atlantis", "barri", 2020, "poblacion", 1.0, "opendata_bcn", EXTRACTED),
                ],
            ),
            SourceBatch::Failed {
                source_id: "idealista".to_string(),
                reason: "HTTP 503".to_string(),
            },
        ];

        let report = engine.run(&mut conn, batches).unwrap();

        assert_eq!(report.unresolvable.len(), 1);
        assert_eq!(report.facts_written, 1);

        let source = &report.coverage.sources["opendata_bcn"];
        assert_eq!(source.resolution_rate, 0.5);
        assert!(source.years_unresolvable.contains(&2020));
        assert!(report.coverage.sources["idealista"].is_failed());

        let stored = db::latest_coverage(&conn).unwrap().unwrap();
        assert_eq!(stored.run_id, report.run_id);
        assert_eq!(db::count_events(&conn, "territory_unresolvable").unwrap(), 1);

        let facts = db::get_facts(&conn, FactTable::Demografia, &FactQuery::default()).unwrap();
        assert_eq!(facts[0].barrio_id, 67);
    }

    #[test]
    fn test_schema_rejections_counted() {
        let engine = engine();
        let mut conn = warehouse(&engine);

        let mut broken = RawRecord::new("el Raval", "barri", 2020, "poblacion", 1.0, "padro", EXTRACTED);
        broken.value = None;
        let report = engine.run(&mut conn, vec![fetched("padro", vec![broken])]).unwrap();

        assert_eq!(report.schema_violations.len(), 1);
        assert_eq!(report.coverage.sources["padro"].schema_rejections, 1);
        assert_eq!(report.facts_written, 0);
    }

    #[test]
    fn test_cross_run_conflict_held_for_review() {
        let engine = engine();
        let mut conn = warehouse(&engine);

        let first = fetched(
            "ine_adrh",
            vec![RawRecord::new("el Raval", "barri", 2020, "renta_media_persona", 12000.0, "ine_adrh", EXTRACTED)],
        );
        engine.run(&mut conn, vec![first]).unwrap();

        let second = fetched(
            "ine_adrh",
            vec![RawRecord::new("el Raval", "barri", 2020, "renta_media_persona", 15000.0, "ine_adrh", "2024-02-10")],
        );
        let report = engine.run(&mut conn, vec![second]).unwrap();

        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.coverage.sources["ine_adrh"].conflicts_held, 1);

        let facts = db::get_facts(&conn, FactTable::Renta, &FactQuery::default()).unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].value, 12000.0);
        assert_eq!(db::get_open_conflicts(&conn).unwrap().len(), 1);
        assert_eq!(db::get_runs(&conn).unwrap().len(), 2);
    }

    #[test]
    fn test_repeated_conflict_held_once_then_accepted() {
        let engine = engine();
        let mut conn = warehouse(&engine);

        let extract = |value: f64| {
            fetched(
                "ine_adrh",
                vec![RawRecord::new("el Raval", "barri", 2020, "renta_media_persona", value, "ine_adrh", EXTRACTED)],
            )
        };
        engine.run(&mut conn, vec![extract(12000.0)]).unwrap();
        engine.run(&mut conn, vec![extract(15000.0)]).unwrap();
        let report = engine.run(&mut conn, vec![extract(15000.0)]).unwrap();

        // Still reported for the run, stored once
        assert_eq!(report.conflicts.len(), 1);
        let open = db::get_open_conflicts(&conn).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(db::count_events(&conn, "key_conflict").unwrap(), 1);

        db::resolve_conflict(&conn, open[0].id, true, "operator").unwrap();
        let facts = db::get_facts(&conn, FactTable::Renta, &FactQuery::default()).unwrap();
        assert_eq!(facts[0].value, 15000.0);

        // The accepted value is now the warehouse value
        let report = engine.run(&mut conn, vec![extract(15000.0)]).unwrap();
        assert!(report.conflicts.is_empty());
        assert_eq!(report.replaced, 1);
    }

    #[test]
    fn test_rerun_with_same_values_replaces() {
        let engine = engine();
        let mut conn = warehouse(&engine);

        let records =
            vec![RawRecord::new("Sants", "barri", 2021, "poblacion", 41000.0, "padro", EXTRACTED)];
        engine.run(&mut conn, vec![fetched("padro", records.clone())]).unwrap();
        let report = engine.run(&mut conn, vec![fetched("padro", records)]).unwrap();

        assert_eq!(report.replaced, 1);
        assert!(report.conflicts.is_empty());
        assert_eq!(db::fact_count(&conn, FactTable::Demografia).unwrap(), 1);
    }

    #[test]
    fn test_duplicate_rows_superseded_and_logged() {
        let engine = engine();
        let mut conn = warehouse(&engine);

        let batch = fetched(
            "padro",
            vec![
                RawRecord::new("el Raval", "barri", 2020, "poblacion", 47000.0, "padro", "2024-01-01"),
                RawRecord::new("Raval", "barri", 2020, "poblacion", 47500.0, "padro", "2024-03-01"),
            ],
        );
        let report = engine.run(&mut conn, vec![batch]).unwrap();

        assert_eq!(report.superseded, 1);
        assert_eq!(db::count_events(&conn, "row_superseded").unwrap(), 1);
        let facts = db::get_facts(&conn, FactTable::Demografia, &FactQuery::default()).unwrap();
        assert_eq!(facts[0].value, 47500.0);
    }
}
