// Entity Models - territorial reference data
//
// Each entity has:
// - Stable identity that NEVER changes (barrio_id, district_id)
// - Canonical and normalized names
// - Registry for lookups, loaded once per run

pub mod neighborhood;

pub use neighborhood::{
    BarrioId, CanonicalNeighborhood, District, DistrictId, NameIndex, NeighborhoodRegistry,
    BARCELONA_BARRIO_COUNT,
};
