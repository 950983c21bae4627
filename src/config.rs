//! Engine configuration and config file resolution
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration pointing at the shipped reference data.

use crate::aliases::AliasTable;
use crate::entities::NeighborhoodRegistry;
use crate::error::{ReconcileError, ReconcileResult};
use crate::fuzzy::DEFAULT_FUZZY_THRESHOLD;
use crate::normalizer::{NameNormalizer, DEFAULT_ARTICLES};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Environment variable consulted when no --config flag is given
pub const CONFIG_ENV_VAR: &str = "BARRIO_WAREHOUSE_CONFIG";

/// Config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "barrio-warehouse.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite warehouse file
    pub db_path: PathBuf,

    /// Canonical neighborhood list (CSV)
    pub barrios_path: PathBuf,

    /// Reviewed alias overrides (TOML)
    pub aliases_path: PathBuf,

    /// Minimum similarity for a fuzzy match
    pub fuzzy_threshold: f64,

    /// Leading articles stripped by the normalizer
    pub articles: Vec<String>,

    /// Allowed deviation of a weight set from 1.0
    pub weight_tolerance: f64,

    /// Relative difference above which a cross-run key collision is a conflict
    pub conflict_tolerance: f64,

    /// Indicator whose values are neighborhood populations
    pub population_indicator: String,

    /// indicator_id → fact table name; unlisted indicators go to fact_indicadores
    pub fact_tables: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut fact_tables = BTreeMap::new();
        for (indicator, table) in [
            ("poblacion", "fact_demografia"),
            ("poblacion_hombres", "fact_demografia"),
            ("poblacion_mujeres", "fact_demografia"),
            ("edad_media", "fact_demografia"),
            ("precio_m2_venta", "fact_precios"),
            ("precio_mes_alquiler", "fact_precios"),
            ("precio_m2_alquiler", "fact_precios"),
            ("renta_media_persona", "fact_renta"),
            ("renta_media_hogar", "fact_renta"),
            ("renta_disponible_hogar", "fact_renta"),
        ] {
            fact_tables.insert(indicator.to_string(), table.to_string());
        }

        EngineConfig {
            db_path: PathBuf::from("barrio_warehouse.db"),
            barrios_path: PathBuf::from("config/barrios.csv"),
            aliases_path: PathBuf::from("config/aliases.toml"),
            fuzzy_threshold: DEFAULT_FUZZY_THRESHOLD,
            articles: DEFAULT_ARTICLES.iter().map(|a| a.to_string()).collect(),
            weight_tolerance: 1e-6,
            conflict_tolerance: 0.01,
            population_indicator: "poblacion".to_string(),
            fact_tables,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> ReconcileResult<Self> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| ReconcileError::config(format!("invalid config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file; relative data paths resolve against its directory
    pub fn from_file<P: AsRef<Path>>(path: P) -> ReconcileResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ReconcileError::config(format!("cannot read {:?}: {}", path, e)))?;
        let mut config = Self::from_toml_str(&content)?;

        if let Some(base) = path.parent() {
            for p in [&mut config.db_path, &mut config.barrios_path, &mut config.aliases_path] {
                if p.is_relative() {
                    *p = base.join(&*p);
                }
            }
        }
        Ok(config)
    }

    /// Resolve the config in priority order:
    /// 1. explicit path (CLI flag)
    /// 2. BARRIO_WAREHOUSE_CONFIG
    /// 3. ./barrio-warehouse.toml
    /// 4. built-in defaults
    pub fn resolve(cli_path: Option<&Path>) -> ReconcileResult<Self> {
        if let Some(path) = cli_path {
            return Self::from_file(path);
        }

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Self::from_file(PathBuf::from(path));
        }

        let local = PathBuf::from(DEFAULT_CONFIG_FILE);
        if local.exists() {
            return Self::from_file(local);
        }

        tracing::debug!("no config file found, using defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> ReconcileResult<()> {
        if !(0.0..=1.0).contains(&self.fuzzy_threshold) {
            return Err(ReconcileError::config(format!(
                "fuzzy_threshold {} outside [0, 1]",
                self.fuzzy_threshold
            )));
        }
        if !(self.weight_tolerance > 0.0) {
            return Err(ReconcileError::config("weight_tolerance must be positive"));
        }
        if !(self.conflict_tolerance >= 0.0) {
            return Err(ReconcileError::config("conflict_tolerance must be non-negative"));
        }
        if self.population_indicator.trim().is_empty() {
            return Err(ReconcileError::config("population_indicator is empty"));
        }
        for (indicator, table) in &self.fact_tables {
            if crate::db::FactTable::from_name(table).is_none() {
                return Err(ReconcileError::config(format!(
                    "indicator '{}' routed to unknown fact table '{}'",
                    indicator, table
                )));
            }
        }
        Ok(())
    }

    pub fn normalizer(&self) -> NameNormalizer {
        NameNormalizer::with_articles(self.articles.clone())
    }

    /// Load the reference data snapshot for one run. Any failure is fatal.
    pub fn load_reference(&self) -> ReconcileResult<ReferenceData> {
        let normalizer = self.normalizer();
        let registry = NeighborhoodRegistry::from_csv_path(&self.barrios_path, &normalizer)?;
        let aliases = AliasTable::from_file(&self.aliases_path, &normalizer)?;
        aliases.validate_against(&registry, &normalizer)?;

        if !registry.is_complete() {
            tracing::warn!(
                count = registry.count(),
                "reference list does not hold all 73 barrios"
            );
        }

        tracing::info!(
            barrios = registry.count(),
            aliases = aliases.len(),
            alias_version = aliases.version(),
            "reference data loaded"
        );

        Ok(ReferenceData {
            normalizer,
            registry: Arc::new(registry),
            aliases: Arc::new(aliases),
        })
    }
}

/// Read-only configuration state shared by the resolver for one run
#[derive(Debug, Clone)]
pub struct ReferenceData {
    pub normalizer: NameNormalizer,
    pub registry: Arc<NeighborhoodRegistry>,
    pub aliases: Arc<AliasTable>,
}
