use crate::coverage::CoverageReport;
use crate::entities::{BarrioId, CanonicalNeighborhood, NeighborhoodRegistry};
use crate::weights::{PopulationTable, WeightTier};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

// ============================================================================
// FACT TABLES
// ============================================================================

/// Fact tables, routed by indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FactTable {
    Demografia,
    Precios,
    Renta,
    /// Fallback for indicators without an explicit route
    Indicadores,
}

impl FactTable {
    pub const ALL: [FactTable; 4] = [
        FactTable::Demografia,
        FactTable::Precios,
        FactTable::Renta,
        FactTable::Indicadores,
    ];

    pub fn table_name(&self) -> &'static str {
        match self {
            FactTable::Demografia => "fact_demografia",
            FactTable::Precios => "fact_precios",
            FactTable::Renta => "fact_renta",
            FactTable::Indicadores => "fact_indicadores",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        FactTable::ALL.into_iter().find(|t| t.table_name() == name)
    }

    /// Route an indicator through the configured mapping
    pub fn route(indicator_id: &str, routing: &BTreeMap<String, String>) -> FactTable {
        routing
            .get(indicator_id)
            .and_then(|name| FactTable::from_name(name))
            .unwrap_or(FactTable::Indicadores)
    }
}

// ============================================================================
// FACT ROW
// ============================================================================

/// Composite key: (barrio_id, year, quarter, indicator_id, source_id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactKey {
    pub barrio_id: BarrioId,
    pub year: i32,
    pub quarter: Option<u8>,
    pub indicator_id: String,
    pub source_id: String,
}

impl FactKey {
    /// Stable hash of the composite key (the UNIQUE column in every fact table)
    /// NULL quarter hashes as "-" so annual rows collide with each other, as they must
    pub fn hash(&self) -> String {
        let quarter = self
            .quarter
            .map(|q| q.to_string())
            .unwrap_or_else(|| "-".to_string());
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}|{}|{}",
            self.barrio_id, self.year, quarter, self.indicator_id, self.source_id
        ));
        format!("{:x}", hasher.finalize())
    }
}

impl std::fmt::Display for FactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.quarter {
            Some(q) => write!(
                f,
                "barrio {} / {}Q{} / {} / {}",
                self.barrio_id, self.year, q, self.indicator_id, self.source_id
            ),
            None => write!(
                f,
                "barrio {} / {} / {} / {}",
                self.barrio_id, self.year, self.indicator_id, self.source_id
            ),
        }
    }
}

/// Final warehouse record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRow {
    pub table: FactTable,
    pub barrio_id: BarrioId,
    pub year: i32,
    pub quarter: Option<u8>,
    /// aka dataset_id
    pub indicator_id: String,
    pub source_id: String,
    pub value: f64,

    // ========================================================================
    // LINEAGE
    // ========================================================================
    /// True when the value was apportioned from a district/municipality figure
    pub apportioned: bool,
    pub weight: f64,
    pub weight_tier: Option<WeightTier>,
    pub raw_territory_label: String,
    pub resolution_method: String,
    pub run_id: String,
    pub extracted_at: DateTime<Utc>,
}

impl FactRow {
    pub fn key(&self) -> FactKey {
        FactKey {
            barrio_id: self.barrio_id,
            year: self.year,
            quarter: self.quarter,
            indicator_id: self.indicator_id.clone(),
            source_id: self.source_id.clone(),
        }
    }
}

/// What the warehouse already holds for a key
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingFact {
    pub value: f64,
    pub run_id: String,
}

/// Optional filters for fact queries
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FactQuery {
    pub barrio_id: Option<BarrioId>,
    pub year: Option<i32>,
    pub indicator_id: Option<String>,
    pub source_id: Option<String>,
}

// ============================================================================
// MANIFEST RUNS, CONFLICTS, EVENTS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestRun {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub alias_version: String,
    pub sources: Vec<String>,
    pub facts_written: i64,
}

/// A key conflict held out for operator review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Row id in `key_conflicts`; 0 until stored
    #[serde(default)]
    pub id: i64,
    pub key_hash: String,
    pub table: FactTable,
    pub incoming: FactRow,
    pub existing_value: f64,
    pub existing_run_id: String,
    pub detected_at: DateTime<Utc>,
    pub resolved: bool,
}

/// Event for audit trail ("every exclusion and every replacement is an event")
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery (in-memory databases stay in "memory")
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;

    // ==========================================================================
    // Reference list (seeded once, never mutated)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS dim_barrios (
            barrio_id INTEGER PRIMARY KEY,
            canonical_name TEXT NOT NULL,
            normalized_name TEXT NOT NULL,
            district_id INTEGER NOT NULL,
            district_name TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Fact tables (same layout, unique composite key hash)
    // ==========================================================================
    for table in FactTable::ALL {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {name} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    key_hash TEXT UNIQUE NOT NULL,
                    barrio_id INTEGER NOT NULL REFERENCES dim_barrios(barrio_id),
                    year INTEGER NOT NULL,
                    quarter INTEGER,
                    indicator_id TEXT NOT NULL,
                    source_id TEXT NOT NULL,
                    value REAL NOT NULL,
                    apportioned INTEGER NOT NULL DEFAULT 0,
                    weight REAL NOT NULL DEFAULT 1.0,
                    weight_tier TEXT,
                    raw_territory_label TEXT NOT NULL,
                    resolution_method TEXT NOT NULL,
                    run_id TEXT NOT NULL,
                    extracted_at TEXT NOT NULL,
                    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
                )",
                name = table.table_name()
            ),
            [],
        )?;

        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_{name}_barrio_year ON {name}(barrio_id, year)",
                name = table.table_name()
            ),
            [],
        )?;

        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_{name}_indicator ON {name}(indicator_id)",
                name = table.table_name()
            ),
            [],
        )?;
    }

    // ==========================================================================
    // Manifest runs, coverage, conflicts
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS manifest_runs (
            run_id TEXT PRIMARY KEY,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            alias_version TEXT NOT NULL,
            sources TEXT NOT NULL,
            facts_written INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS coverage (
            run_id TEXT PRIMARY KEY REFERENCES manifest_runs(run_id),
            generated_at TEXT NOT NULL,
            report TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS key_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            key_hash TEXT NOT NULL,
            fact_table TEXT NOT NULL,
            incoming TEXT NOT NULL,
            incoming_value REAL NOT NULL,
            incoming_run_id TEXT NOT NULL,
            existing_value REAL NOT NULL,
            existing_run_id TEXT NOT NULL,
            detected_at TEXT NOT NULL,
            resolved INTEGER NOT NULL DEFAULT 0,
            resolution TEXT,
            resolved_at TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_conflicts_key ON key_conflicts(key_hash)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
        [],
    )?;

    Ok(())
}

/// Seed dim_barrios from the reference list. Existing rows are left untouched.
pub fn seed_neighborhoods(conn: &Connection, registry: &NeighborhoodRegistry) -> Result<usize> {
    let mut inserted = 0;

    for barrio in registry.all() {
        inserted += conn.execute(
            "INSERT OR IGNORE INTO dim_barrios (
                barrio_id, canonical_name, normalized_name, district_id, district_name
            ) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                barrio.barrio_id,
                barrio.canonical_name,
                barrio.normalized_name,
                barrio.district_id,
                barrio.district_name,
            ],
        )?;
    }

    // The seeded list must agree with the reference snapshot
    for stored in get_barrios(conn)? {
        if let Some(reference) = registry.get(stored.barrio_id) {
            if reference.canonical_name != stored.canonical_name {
                tracing::warn!(
                    barrio_id = stored.barrio_id,
                    stored = %stored.canonical_name,
                    reference = %reference.canonical_name,
                    "dim_barrios differs from reference list; stored row kept"
                );
            }
        }
    }

    Ok(inserted)
}

pub fn get_barrios(conn: &Connection) -> Result<Vec<CanonicalNeighborhood>> {
    let mut stmt = conn.prepare(
        "SELECT barrio_id, canonical_name, district_id, district_name, normalized_name
         FROM dim_barrios
         ORDER BY barrio_id",
    )?;

    let barrios = stmt
        .query_map([], |row| {
            Ok(CanonicalNeighborhood {
                barrio_id: row.get(0)?,
                canonical_name: row.get(1)?,
                district_id: row.get(2)?,
                district_name: row.get(3)?,
                normalized_name: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(barrios)
}

// ============================================================================
// FACTS
// ============================================================================

/// Insert or replace fact rows under their composite key
pub fn upsert_facts(conn: &Connection, rows: &[FactRow]) -> Result<usize> {
    let mut written = 0;

    for row in rows {
        let sql = format!(
            "INSERT INTO {} (
                key_hash, barrio_id, year, quarter, indicator_id, source_id, value,
                apportioned, weight, weight_tier, raw_territory_label, resolution_method,
                run_id, extracted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(key_hash) DO UPDATE SET
                value = excluded.value,
                apportioned = excluded.apportioned,
                weight = excluded.weight,
                weight_tier = excluded.weight_tier,
                raw_territory_label = excluded.raw_territory_label,
                resolution_method = excluded.resolution_method,
                run_id = excluded.run_id,
                extracted_at = excluded.extracted_at,
                updated_at = CURRENT_TIMESTAMP",
            row.table.table_name()
        );

        written += conn
            .execute(
                &sql,
                params![
                    row.key().hash(),
                    row.barrio_id,
                    row.year,
                    row.quarter,
                    row.indicator_id,
                    row.source_id,
                    row.value,
                    row.apportioned,
                    row.weight,
                    row.weight_tier.map(|t| t.as_str()),
                    row.raw_territory_label,
                    row.resolution_method,
                    row.run_id,
                    row.extracted_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("Failed to write fact {}", row.key()))?;
    }

    Ok(written)
}

fn fact_from_row(table: FactTable, row: &Row) -> rusqlite::Result<FactRow> {
    let tier: Option<String> = row.get(8)?;
    let extracted_at: String = row.get(12)?;

    Ok(FactRow {
        table,
        barrio_id: row.get(0)?,
        year: row.get(1)?,
        quarter: row.get(2)?,
        indicator_id: row.get(3)?,
        source_id: row.get(4)?,
        value: row.get(5)?,
        apportioned: row.get(6)?,
        weight: row.get(7)?,
        weight_tier: tier.as_deref().and_then(WeightTier::from_name),
        raw_territory_label: row.get(9)?,
        resolution_method: row.get(10)?,
        run_id: row.get(11)?,
        extracted_at: DateTime::parse_from_rfc3339(&extracted_at)
            .map_err(|_| rusqlite::Error::InvalidQuery)?
            .with_timezone(&Utc),
    })
}

const FACT_COLUMNS: &str = "barrio_id, year, quarter, indicator_id, source_id, value,
    apportioned, weight, weight_tier, raw_territory_label, resolution_method,
    run_id, extracted_at";

/// Query a fact table with optional filters
pub fn get_facts(conn: &Connection, table: FactTable, query: &FactQuery) -> Result<Vec<FactRow>> {
    let sql = format!(
        "SELECT {FACT_COLUMNS}
         FROM {table}
         WHERE (?1 IS NULL OR barrio_id = ?1)
           AND (?2 IS NULL OR year = ?2)
           AND (?3 IS NULL OR indicator_id = ?3)
           AND (?4 IS NULL OR source_id = ?4)
         ORDER BY barrio_id, year, quarter, indicator_id, source_id",
        table = table.table_name()
    );

    let mut stmt = conn.prepare(&sql)?;
    let facts = stmt
        .query_map(
            params![query.barrio_id, query.year, query.indicator_id, query.source_id],
            |row| fact_from_row(table, row),
        )?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(facts)
}

pub fn fact_count(conn: &Connection, table: FactTable) -> Result<i64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", table.table_name()),
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Existing values for the given keys, for cross-run conflict checks
pub fn load_existing_facts(
    conn: &Connection,
    keys: &[(FactTable, FactKey)],
) -> Result<HashMap<FactKey, ExistingFact>> {
    let mut existing = HashMap::new();

    for (table, key) in keys {
        let found = conn
            .query_row(
                &format!(
                    "SELECT value, run_id FROM {} WHERE key_hash = ?1",
                    table.table_name()
                ),
                [key.hash()],
                |row| {
                    Ok(ExistingFact {
                        value: row.get(0)?,
                        run_id: row.get(1)?,
                    })
                },
            )
            .optional()?;

        if let Some(fact) = found {
            existing.insert(key.clone(), fact);
        }
    }

    Ok(existing)
}

/// Neighborhood populations from directly observed (non-apportioned) rows
pub fn load_population_table(
    conn: &Connection,
    table: FactTable,
    indicator_id: &str,
) -> Result<PopulationTable> {
    let mut stmt = conn.prepare(&format!(
        "SELECT barrio_id, year, AVG(value)
         FROM {}
         WHERE indicator_id = ?1 AND apportioned = 0 AND quarter IS NULL
         GROUP BY barrio_id, year",
        table.table_name()
    ))?;

    let mut population = PopulationTable::new();
    let rows = stmt.query_map([indicator_id], |row| {
        Ok((row.get::<_, BarrioId>(0)?, row.get::<_, i32>(1)?, row.get::<_, f64>(2)?))
    })?;
    for row in rows {
        let (barrio_id, year, value) = row?;
        population.insert(barrio_id, year, value);
    }

    Ok(population)
}

// ============================================================================
// MANIFEST RUNS & COVERAGE
// ============================================================================

pub fn insert_run(conn: &Connection, run: &ManifestRun) -> Result<()> {
    conn.execute(
        "INSERT INTO manifest_runs (run_id, started_at, finished_at, alias_version, sources, facts_written)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            run.run_id,
            run.started_at.to_rfc3339(),
            run.finished_at.map(|t| t.to_rfc3339()),
            run.alias_version,
            serde_json::to_string(&run.sources)?,
            run.facts_written,
        ],
    )?;
    Ok(())
}

pub fn finish_run(conn: &Connection, run_id: &str, facts_written: i64) -> Result<()> {
    conn.execute(
        "UPDATE manifest_runs SET finished_at = ?1, facts_written = ?2 WHERE run_id = ?3",
        params![Utc::now().to_rfc3339(), facts_written, run_id],
    )?;
    Ok(())
}

pub fn get_runs(conn: &Connection) -> Result<Vec<ManifestRun>> {
    let mut stmt = conn.prepare(
        "SELECT run_id, started_at, finished_at, alias_version, sources, facts_written
         FROM manifest_runs
         ORDER BY started_at DESC",
    )?;

    let runs = stmt
        .query_map([], |row| {
            let started_at: String = row.get(1)?;
            let finished_at: Option<String> = row.get(2)?;
            let sources: String = row.get(4)?;

            Ok(ManifestRun {
                run_id: row.get(0)?,
                started_at: DateTime::parse_from_rfc3339(&started_at)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?
                    .with_timezone(&Utc),
                finished_at: finished_at
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|dt| dt.with_timezone(&Utc)),
                alias_version: row.get(3)?,
                sources: serde_json::from_str(&sources).unwrap_or_default(),
                facts_written: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(runs)
}

pub fn insert_coverage(conn: &Connection, report: &CoverageReport) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO coverage (run_id, generated_at, report) VALUES (?1, ?2, ?3)",
        params![
            report.run_id,
            report.generated_at.to_rfc3339(),
            serde_json::to_string(report)?,
        ],
    )?;
    Ok(())
}

/// Coverage of the most recent run, if any
pub fn latest_coverage(conn: &Connection) -> Result<Option<CoverageReport>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT report FROM coverage ORDER BY generated_at DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match json {
        Some(json) => Ok(Some(
            serde_json::from_str(&json).context("Corrupt coverage report")?,
        )),
        None => Ok(None),
    }
}

// ============================================================================
// CONFLICTS
// ============================================================================

/// Hold a conflict for review.
///
/// Returns false when the same incoming value for the same key is already
/// waiting, so re-running an extract does not pile up duplicates.
pub fn insert_conflict(conn: &Connection, conflict: &ConflictRecord) -> Result<bool> {
    let already_open: i64 = conn.query_row(
        "SELECT COUNT(*) FROM key_conflicts
         WHERE key_hash = ?1 AND incoming_value = ?2 AND resolved = 0",
        params![conflict.key_hash, conflict.incoming.value],
        |row| row.get(0),
    )?;
    if already_open > 0 {
        return Ok(false);
    }

    conn.execute(
        "INSERT INTO key_conflicts (
            key_hash, fact_table, incoming, incoming_value, incoming_run_id,
            existing_value, existing_run_id, detected_at, resolved
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            conflict.key_hash,
            conflict.table.table_name(),
            serde_json::to_string(&conflict.incoming)?,
            conflict.incoming.value,
            conflict.incoming.run_id,
            conflict.existing_value,
            conflict.existing_run_id,
            conflict.detected_at.to_rfc3339(),
            conflict.resolved,
        ],
    )?;
    Ok(true)
}

const CONFLICT_COLUMNS: &str =
    "id, key_hash, fact_table, incoming, existing_value, existing_run_id, detected_at, resolved";

fn conflict_from_row(row: &Row<'_>) -> rusqlite::Result<ConflictRecord> {
    let table: String = row.get(2)?;
    let incoming: String = row.get(3)?;
    let detected_at: String = row.get(6)?;

    Ok(ConflictRecord {
        id: row.get(0)?,
        key_hash: row.get(1)?,
        table: FactTable::from_name(&table).ok_or(rusqlite::Error::InvalidQuery)?,
        incoming: serde_json::from_str(&incoming).map_err(|_| rusqlite::Error::InvalidQuery)?,
        existing_value: row.get(4)?,
        existing_run_id: row.get(5)?,
        detected_at: DateTime::parse_from_rfc3339(&detected_at)
            .map_err(|_| rusqlite::Error::InvalidQuery)?
            .with_timezone(&Utc),
        resolved: row.get(7)?,
    })
}

/// Conflicts still waiting for operator review
pub fn get_open_conflicts(conn: &Connection) -> Result<Vec<ConflictRecord>> {
    let sql = format!(
        "SELECT {} FROM key_conflicts WHERE resolved = 0 ORDER BY detected_at, id",
        CONFLICT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;

    let conflicts = stmt
        .query_map([], conflict_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(conflicts)
}

/// Operator decision on a held conflict.
///
/// Accepting writes the incoming row over the warehouse value; rejecting
/// keeps the warehouse value. Either way the conflict is closed and the
/// decision lands in the audit trail.
pub fn resolve_conflict(conn: &Connection, id: i64, accept: bool, actor: &str) -> Result<ConflictRecord> {
    let tx = conn.unchecked_transaction()?;

    let sql = format!("SELECT {} FROM key_conflicts WHERE id = ?1", CONFLICT_COLUMNS);
    let mut conflict = tx
        .query_row(&sql, params![id], conflict_from_row)
        .optional()?
        .with_context(|| format!("No key conflict with id {}", id))?;

    if conflict.resolved {
        anyhow::bail!("Key conflict {} is already resolved", id);
    }

    if accept {
        upsert_facts(&tx, std::slice::from_ref(&conflict.incoming))?;
    }

    let resolution = if accept { "accepted" } else { "rejected" };
    tx.execute(
        "UPDATE key_conflicts SET resolved = 1, resolution = ?1, resolved_at = ?2 WHERE id = ?3",
        params![resolution, Utc::now().to_rfc3339(), id],
    )?;

    insert_event(
        &tx,
        &Event::new(
            &format!("conflict_{}", resolution),
            "fact",
            &conflict.key_hash,
            serde_json::json!({
                "conflict_id": id,
                "key": conflict.incoming.key().to_string(),
                "existing": conflict.existing_value,
                "incoming": conflict.incoming.value,
            }),
            actor,
        ),
    )?;

    tx.commit()?;
    conflict.resolved = true;
    Ok(conflict)
}

// ============================================================================
// EVENTS
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?
                    .with_timezone(&Utc),
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

pub fn count_events(conn: &Connection, event_type: &str) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM events WHERE event_type = ?1",
        [event_type],
        |row| row.get(0),
    )?;
    Ok(count)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::entities::neighborhood::tests::barcelona;
    use chrono::TimeZone;

    pub(crate) fn test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        seed_neighborhoods(&conn, &barcelona()).unwrap();
        conn
    }

    /// Helper function to create test fact rows with all required fields
    pub(crate) fn create_test_fact(
        table: FactTable,
        barrio_id: BarrioId,
        year: i32,
        indicator_id: &str,
        source_id: &str,
        value: f64,
    ) -> FactRow {
        FactRow {
            table,
            barrio_id,
            year,
            quarter: None,
            indicator_id: indicator_id.to_string(),
            source_id: source_id.to_string(),
            value,
            apportioned: false,
            weight: 1.0,
            weight_tier: None,
            raw_territory_label: "test".to_string(),
            resolution_method: "fuzzy".to_string(),
            run_id: "run-1".to_string(),
            extracted_at: Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_seed_is_idempotent() {
        let conn = test_db();
        assert_eq!(get_barrios(&conn).unwrap().len(), 73);

        let inserted = seed_neighborhoods(&conn, &barcelona()).unwrap();
        assert_eq!(inserted, 0);
        assert_eq!(get_barrios(&conn).unwrap().len(), 73);
    }

    #[test]
    fn test_upsert_replaces_under_key() {
        let conn = test_db();

        let first = create_test_fact(FactTable::Precios, 2, 2020, "precio_m2_venta", "idealista", 4000.0);
        let mut second = first.clone();
        second.value = 4100.0;
        second.run_id = "run-2".to_string();

        upsert_facts(&conn, &[first]).unwrap();
        upsert_facts(&conn, &[second]).unwrap();

        let facts = get_facts(&conn, FactTable::Precios, &FactQuery::default()).unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].value, 4100.0);
        assert_eq!(facts[0].run_id, "run-2");
    }

    #[test]
    fn test_quarter_is_part_of_key() {
        let conn = test_db();

        let annual = create_test_fact(FactTable::Precios, 2, 2020, "precio_mes_alquiler", "idealista", 900.0);
        let mut q1 = annual.clone();
        q1.quarter = Some(1);
        let mut q2 = annual.clone();
        q2.quarter = Some(2);

        upsert_facts(&conn, &[annual, q1, q2]).unwrap();
        assert_eq!(fact_count(&conn, FactTable::Precios).unwrap(), 3);
    }

    #[test]
    fn test_query_filters() {
        let conn = test_db();
        upsert_facts(
            &conn,
            &[
                create_test_fact(FactTable::Renta, 1, 2019, "renta_media_persona", "ine", 12000.0),
                create_test_fact(FactTable::Renta, 1, 2020, "renta_media_persona", "ine", 12500.0),
                create_test_fact(FactTable::Renta, 2, 2020, "renta_media_persona", "ine", 14000.0),
            ],
        )
        .unwrap();

        let by_year = FactQuery {
            year: Some(2020),
            ..FactQuery::default()
        };
        assert_eq!(get_facts(&conn, FactTable::Renta, &by_year).unwrap().len(), 2);

        let by_barrio = FactQuery {
            barrio_id: Some(1),
            ..FactQuery::default()
        };
        assert_eq!(get_facts(&conn, FactTable::Renta, &by_barrio).unwrap().len(), 2);
    }

    #[test]
    fn test_population_table_uses_direct_rows_only() {
        let conn = test_db();
        let direct = create_test_fact(FactTable::Demografia, 1, 2020, "poblacion", "padro", 47000.0);
        let mut apportioned = create_test_fact(FactTable::Demografia, 2, 2020, "poblacion", "ine", 9000.0);
        apportioned.apportioned = true;
        apportioned.weight_tier = Some(WeightTier::EqualSplit);
        upsert_facts(&conn, &[direct, apportioned]).unwrap();

        let population = load_population_table(&conn, FactTable::Demografia, "poblacion").unwrap();
        use crate::weights::PopulationSource;
        assert_eq!(population.population(1, 2020), Some(47000.0));
        assert_eq!(population.population(2, 2020), None);
    }

    #[test]
    fn test_existing_facts_lookup() {
        let conn = test_db();
        let fact = create_test_fact(FactTable::Precios, 5, 2021, "precio_m2_venta", "idealista", 5000.0);
        upsert_facts(&conn, &[fact.clone()]).unwrap();

        let mut other_key = fact.key();
        other_key.source_id = "fotocasa".to_string();

        let existing = load_existing_facts(
            &conn,
            &[(FactTable::Precios, fact.key()), (FactTable::Precios, other_key.clone())],
        )
        .unwrap();

        assert_eq!(existing.len(), 1);
        assert_eq!(existing[&fact.key()].value, 5000.0);
        assert!(!existing.contains_key(&other_key));
    }

    #[test]
    fn test_key_hash_stable_and_distinct() {
        let fact = create_test_fact(FactTable::Precios, 2, 2020, "precio_m2_venta", "idealista", 1.0);
        let key = fact.key();
        assert_eq!(key.hash(), key.hash());
        assert_eq!(key.hash().len(), 64);

        let mut other = key.clone();
        other.indicator_id = "precio_mes_alquiler".to_string();
        assert_ne!(key.hash(), other.hash());
    }

    #[test]
    fn test_conflict_roundtrip() {
        let conn = test_db();
        let incoming = create_test_fact(FactTable::Renta, 3, 2020, "renta_media_persona", "ine", 15000.0);
        let record = ConflictRecord {
            id: 0,
            key_hash: incoming.key().hash(),
            table: FactTable::Renta,
            incoming,
            existing_value: 12000.0,
            existing_run_id: "run-0".to_string(),
            detected_at: Utc::now(),
            resolved: false,
        };
        insert_conflict(&conn, &record).unwrap();

        let open = get_open_conflicts(&conn).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].existing_value, 12000.0);
        assert_eq!(open[0].incoming.value, 15000.0);
        assert!(open[0].id > 0);
    }

    fn held_conflict(value: f64) -> ConflictRecord {
        let mut incoming = create_test_fact(FactTable::Renta, 3, 2020, "renta_media_persona", "ine", value);
        incoming.run_id = "run-2".to_string();
        ConflictRecord {
            id: 0,
            key_hash: incoming.key().hash(),
            table: FactTable::Renta,
            incoming,
            existing_value: 12000.0,
            existing_run_id: "run-1".to_string(),
            detected_at: Utc::now(),
            resolved: false,
        }
    }

    #[test]
    fn test_same_conflict_held_once() {
        let conn = test_db();

        assert!(insert_conflict(&conn, &held_conflict(15000.0)).unwrap());
        assert!(!insert_conflict(&conn, &held_conflict(15000.0)).unwrap());
        // A different incoming value is a new disagreement
        assert!(insert_conflict(&conn, &held_conflict(16000.0)).unwrap());

        assert_eq!(get_open_conflicts(&conn).unwrap().len(), 2);
    }

    #[test]
    fn test_accept_conflict_writes_incoming() {
        let conn = test_db();
        let existing = create_test_fact(FactTable::Renta, 3, 2020, "renta_media_persona", "ine", 12000.0);
        upsert_facts(&conn, &[existing]).unwrap();
        insert_conflict(&conn, &held_conflict(15000.0)).unwrap();

        let id = get_open_conflicts(&conn).unwrap()[0].id;
        let resolved = resolve_conflict(&conn, id, true, "operator").unwrap();
        assert!(resolved.resolved);

        let facts = get_facts(&conn, FactTable::Renta, &FactQuery::default()).unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].value, 15000.0);
        assert_eq!(facts[0].run_id, "run-2");

        assert!(get_open_conflicts(&conn).unwrap().is_empty());
        assert_eq!(count_events(&conn, "conflict_accepted").unwrap(), 1);

        // Closed conflicts cannot be decided twice
        assert!(resolve_conflict(&conn, id, false, "operator").is_err());
    }

    #[test]
    fn test_reject_conflict_keeps_warehouse_value() {
        let conn = test_db();
        let existing = create_test_fact(FactTable::Renta, 3, 2020, "renta_media_persona", "ine", 12000.0);
        upsert_facts(&conn, &[existing]).unwrap();
        insert_conflict(&conn, &held_conflict(15000.0)).unwrap();

        let id = get_open_conflicts(&conn).unwrap()[0].id;
        resolve_conflict(&conn, id, false, "operator").unwrap();

        let facts = get_facts(&conn, FactTable::Renta, &FactQuery::default()).unwrap();
        assert_eq!(facts[0].value, 12000.0);
        assert!(get_open_conflicts(&conn).unwrap().is_empty());
        assert_eq!(count_events(&conn, "conflict_rejected").unwrap(), 1);

        // Once rejected, the same disagreement may be raised again
        assert!(insert_conflict(&conn, &held_conflict(15000.0)).unwrap());
        assert!(resolve_conflict(&conn, 999, true, "operator").is_err());
    }

    #[test]
    fn test_event_log() {
        let conn = test_db();

        let event = Event::new(
            "row_superseded",
            "fact",
            "test_key_123",
            serde_json::json!({"test": "data"}),
            "fact_merge",
        );

        insert_event(&conn, &event).unwrap();

        let events = get_events_for_entity(&conn, "fact", "test_key_123").unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "row_superseded");
        assert_eq!(count_events(&conn, "row_superseded").unwrap(), 1);
    }

    #[test]
    fn test_route_indicators() {
        let routing = BTreeMap::from([("precio_m2_venta".to_string(), "fact_precios".to_string())]);
        assert_eq!(FactTable::route("precio_m2_venta", &routing), FactTable::Precios);
        assert_eq!(FactTable::route("superficie", &routing), FactTable::Indicadores);
    }
}
