// Barrio Warehouse - Core Library
// Territory resolution and fact reconciliation for Barcelona neighborhood data.
// Exposes all modules for use in CLI, API server, and tests

pub mod error;
pub mod config;
pub mod normalizer;     // Name normalization (mojibake, diacritics, articles)
pub mod entities;       // Canonical neighborhoods and districts
pub mod aliases;        // Reviewed alias overrides
pub mod fuzzy;          // Similarity scoring
pub mod resolver;       // Label → territory scope
pub mod parser;         // Raw records and source extractors
pub mod schema;         // Shape Layer - observation validation
pub mod weights;        // Population weights with fallbacks
pub mod apportionment;  // Aggregate → neighborhood split
pub mod deduplication;  // Fact merge under the composite key
pub mod coverage;       // Per-source resolution statistics
pub mod db;             // SQLite warehouse
pub mod reconciliation; // The end-to-end pass

// Re-export commonly used types
pub use error::{ReconcileError, ReconcileResult};
pub use config::{EngineConfig, ReferenceData, CONFIG_ENV_VAR, DEFAULT_CONFIG_FILE};
pub use normalizer::NameNormalizer;
pub use entities::{
    BarrioId, CanonicalNeighborhood, District, DistrictId, NeighborhoodRegistry,
    BARCELONA_BARRIO_COUNT,
};
pub use aliases::{AliasOverride, AliasTable};
pub use fuzzy::{FuzzyMatch, FuzzyMatcher, DEFAULT_FUZZY_THRESHOLD};
pub use resolver::{
    MatchStrategy, Resolution, ResolutionMethod, ResolutionOutcome, ResolutionState,
    TerritoryResolver, TerritoryScope,
};
pub use parser::{
    CsvExtract, Granularity, RawRecord, RawTerritoryObservation, SourceBatch, SourceExtractor,
};
pub use schema::ObservationSchema;
pub use weights::{PopulationSource, PopulationTable, WeightProvider, WeightSet, WeightTier};
pub use apportionment::{ApportionmentEngine, ResolvedObservation};
pub use deduplication::{DeduplicationEngine, MergeOutcome};
pub use coverage::{CoverageReport, CoverageTracker, SourceCoverage};
pub use db::{
    ConflictRecord, Event, FactKey, FactQuery, FactRow, FactTable, ManifestRun,
    get_barrios, get_facts, get_open_conflicts, resolve_conflict, insert_event, get_events_for_entity,
    latest_coverage, setup_database, seed_neighborhoods,
};
pub use reconciliation::{ReconciliationEngine, ReconciliationReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
