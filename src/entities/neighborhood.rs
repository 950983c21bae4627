// 🏘️ Neighborhood Entity - canonical reference list
//
// "barrio_id is IDENTITY (never changes), the label a source uses is a VALUE"
//
// Problem solved:
// - "la Vila de Gràcia", "Vila de Gracia", "VILA DE GRÀCIA" → barrio 31
// - District membership drives apportionment of coarse values
// - Seeded once from config/barrios.csv; read-only for the whole run

use crate::error::{ReconcileError, ReconcileResult};
use crate::normalizer::NameNormalizer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

pub type BarrioId = u32;
pub type DistrictId = u32;

/// Number of administrative neighborhoods in Barcelona
pub const BARCELONA_BARRIO_COUNT: usize = 73;

// ============================================================================
// CANONICAL NEIGHBORHOOD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalNeighborhood {
    /// Stable identity (1..=73) - NEVER changes
    pub barrio_id: BarrioId,

    /// Official name, as published by the city
    pub canonical_name: String,

    pub district_id: DistrictId,

    pub district_name: String,

    /// Derived from canonical_name at load time
    pub normalized_name: String,
}

/// Row of the reference CSV
#[derive(Debug, Deserialize)]
struct ReferenceRow {
    barrio_id: BarrioId,
    canonical_name: String,
    district_id: DistrictId,
    district_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct District {
    pub district_id: DistrictId,
    pub district_name: String,
    pub normalized_name: String,
    /// Member neighborhoods, ascending
    pub barrio_ids: Vec<BarrioId>,
}

// ============================================================================
// NAME INDEX
// ============================================================================

/// Normalized name → id, with a sorted candidate list for fuzzy matching
#[derive(Debug, Clone, Default)]
pub struct NameIndex {
    entries: BTreeMap<String, u32>,
    candidates: Vec<String>,
}

impl NameIndex {
    fn insert(&mut self, normalized: String, id: u32) -> bool {
        match self.candidates.binary_search(&normalized) {
            Ok(_) => false,
            Err(pos) => {
                self.candidates.insert(pos, normalized.clone());
                self.entries.insert(normalized, id);
                true
            }
        }
    }

    pub fn get(&self, normalized: &str) -> Option<u32> {
        self.entries.get(normalized).copied()
    }

    /// Candidate names in lexicographic order
    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// NEIGHBORHOOD REGISTRY
// ============================================================================

/// Immutable snapshot of the reference list for one run
#[derive(Debug, Clone)]
pub struct NeighborhoodRegistry {
    barrios: BTreeMap<BarrioId, CanonicalNeighborhood>,
    districts: BTreeMap<DistrictId, District>,
    barrio_index: NameIndex,
    district_index: NameIndex,
}

impl NeighborhoodRegistry {
    /// Load the reference list from a CSV file
    pub fn from_csv_path<P: AsRef<Path>>(
        path: P,
        normalizer: &NameNormalizer,
    ) -> ReconcileResult<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            ReconcileError::config(format!("cannot open reference list {:?}: {}", path, e))
        })?;
        Self::from_csv_reader(file, normalizer)
    }

    pub fn from_csv_reader<R: Read>(
        reader: R,
        normalizer: &NameNormalizer,
    ) -> ReconcileResult<Self> {
        let mut rdr = csv::Reader::from_reader(reader);
        let mut rows = Vec::new();

        for (line, result) in rdr.deserialize::<ReferenceRow>().enumerate() {
            let row = result.map_err(|e| {
                ReconcileError::config(format!("reference list row {}: {}", line + 2, e))
            })?;
            rows.push(row);
        }

        Self::from_rows(
            rows.into_iter()
                .map(|r| (r.barrio_id, r.canonical_name, r.district_id, r.district_name))
                .collect(),
            normalizer,
        )
    }

    /// Build from `(barrio_id, canonical_name, district_id, district_name)` tuples
    pub fn from_rows(
        rows: Vec<(BarrioId, String, DistrictId, String)>,
        normalizer: &NameNormalizer,
    ) -> ReconcileResult<Self> {
        if rows.is_empty() {
            return Err(ReconcileError::config("reference list is empty"));
        }

        let mut registry = NeighborhoodRegistry {
            barrios: BTreeMap::new(),
            districts: BTreeMap::new(),
            barrio_index: NameIndex::default(),
            district_index: NameIndex::default(),
        };

        for (barrio_id, canonical_name, district_id, district_name) in rows {
            let canonical_name = canonical_name.trim().to_string();
            let district_name = district_name.trim().to_string();

            if canonical_name.is_empty() {
                return Err(ReconcileError::config(format!(
                    "barrio {} has an empty name",
                    barrio_id
                )));
            }

            if registry.barrios.contains_key(&barrio_id) {
                return Err(ReconcileError::config(format!(
                    "duplicate barrio_id {}",
                    barrio_id
                )));
            }

            let normalized_name = normalizer.normalize(&canonical_name);
            if !registry.barrio_index.insert(normalized_name.clone(), barrio_id) {
                return Err(ReconcileError::config(format!(
                    "barrio {} ('{}') collides with another barrio after normalization",
                    barrio_id, canonical_name
                )));
            }

            let district = registry
                .districts
                .entry(district_id)
                .or_insert_with(|| District {
                    district_id,
                    district_name: district_name.clone(),
                    normalized_name: normalizer.normalize(&district_name),
                    barrio_ids: Vec::new(),
                });

            if district.district_name != district_name {
                return Err(ReconcileError::config(format!(
                    "district {} is named both '{}' and '{}'",
                    district_id, district.district_name, district_name
                )));
            }
            district.barrio_ids.push(barrio_id);

            registry.barrios.insert(
                barrio_id,
                CanonicalNeighborhood {
                    barrio_id,
                    canonical_name,
                    district_id,
                    district_name,
                    normalized_name,
                },
            );
        }

        for district in registry.districts.values_mut() {
            district.barrio_ids.sort_unstable();
        }

        let district_names: Vec<(String, DistrictId)> = registry
            .districts
            .values()
            .map(|d| (d.normalized_name.clone(), d.district_id))
            .collect();
        for (normalized, district_id) in district_names {
            if !registry.district_index.insert(normalized.clone(), district_id) {
                return Err(ReconcileError::config(format!(
                    "district '{}' collides with another district after normalization",
                    normalized
                )));
            }
        }

        Ok(registry)
    }

    pub fn get(&self, barrio_id: BarrioId) -> Option<&CanonicalNeighborhood> {
        self.barrios.get(&barrio_id)
    }

    pub fn district(&self, district_id: DistrictId) -> Option<&District> {
        self.districts.get(&district_id)
    }

    /// All neighborhoods, ascending by barrio_id
    pub fn all(&self) -> impl Iterator<Item = &CanonicalNeighborhood> {
        self.barrios.values()
    }

    pub fn all_districts(&self) -> impl Iterator<Item = &District> {
        self.districts.values()
    }

    /// Every barrio_id, ascending (the municipality scope)
    pub fn all_ids(&self) -> Vec<BarrioId> {
        self.barrios.keys().copied().collect()
    }

    pub fn count(&self) -> usize {
        self.barrios.len()
    }

    /// True when the list has exactly Barcelona's 73 barrios
    pub fn is_complete(&self) -> bool {
        self.barrios.len() == BARCELONA_BARRIO_COUNT
    }

    pub fn barrio_index(&self) -> &NameIndex {
        &self.barrio_index
    }

    pub fn district_index(&self) -> &NameIndex {
        &self.district_index
    }

    /// Look up a barrio by its canonical name (any spelling that normalizes the same)
    pub fn find_by_name(&self, name: &str, normalizer: &NameNormalizer) -> Option<&CanonicalNeighborhood> {
        self.barrio_index
            .get(&normalizer.normalize(name))
            .and_then(|id| self.barrios.get(&id))
    }

    pub fn find_district_by_name(&self, name: &str, normalizer: &NameNormalizer) -> Option<&District> {
        self.district_index
            .get(&normalizer.normalize(name))
            .and_then(|id| self.districts.get(&id))
    }
}

// ============================================================================
// TESTS
// ============================================================================
