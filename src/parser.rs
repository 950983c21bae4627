// 🏗️ Source Extractors - one fixed observation shape for every source
//
// Extraction itself (HTTP, pagination, CKAN discovery, retries) happens
// upstream. Extractors hand over already-fetched rows as `RawRecord`s;
// the schema validator turns them into `RawTerritoryObservation`s so the
// engine never branches on source-specific shape.

use crate::normalizer::decode_field;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

// ============================================================================
// CORE TYPES
// ============================================================================

/// Administrative level at which a source reports a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Neighborhood,
    District,
    Municipality,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Neighborhood => "neighborhood",
            Granularity::District => "district",
            Granularity::Municipality => "municipality",
        }
    }

    /// Parse the spellings open-data portals use (Catalan, Spanish, English)
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "neighborhood" | "neighbourhood" | "barri" | "barrio" | "barris" | "barrios" => {
                Some(Granularity::Neighborhood)
            }
            "district" | "districte" | "distrito" | "districtes" | "distritos" => {
                Some(Granularity::District)
            }
            "municipality" | "municipi" | "municipio" | "city" | "ciutat" | "ciudad" => {
                Some(Granularity::Municipality)
            }
            _ => None,
        }
    }

    pub fn is_aggregate(&self) -> bool {
        !matches!(self, Granularity::Neighborhood)
    }
}

/// RawRecord - an extract row exactly as it arrived (every field optional)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default)]
    pub raw_territory_label: Option<String>,
    #[serde(default)]
    pub granularity: Option<String>,
    #[serde(default)]
    pub year: Option<String>,
    #[serde(default)]
    pub quarter: Option<String>,
    #[serde(default)]
    pub indicator_id: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub extracted_at: Option<String>,
}

impl RawRecord {
    /// Builder for the common case: all required fields present
    pub fn new(
        label: &str,
        granularity: &str,
        year: i32,
        indicator_id: &str,
        value: f64,
        source_id: &str,
        extracted_at: &str,
    ) -> Self {
        RawRecord {
            raw_territory_label: Some(label.to_string()),
            granularity: Some(granularity.to_string()),
            year: Some(year.to_string()),
            quarter: None,
            indicator_id: Some(indicator_id.to_string()),
            // Decimal comma: "47.5" would not be ambiguous, but "12.345" would read as grouped thousands
            value: Some(value.to_string().replace('.', ",")),
            source_id: Some(source_id.to_string()),
            extracted_at: Some(extracted_at.to_string()),
        }
    }

    /// Builder pattern: add quarter
    pub fn with_quarter(mut self, quarter: u8) -> Self {
        self.quarter = Some(quarter.to_string());
        self
    }
}

/// RawTerritoryObservation - one validated row from a source extract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTerritoryObservation {
    pub raw_territory_label: String,
    pub granularity: Granularity,
    pub year: i32,
    /// 1..=4 for quarterly series, None for annual
    pub quarter: Option<u8>,
    pub indicator_id: String,
    pub value: f64,
    pub source_id: String,
    /// Manifest timestamp: later extraction wins on key collisions
    pub extracted_at: DateTime<Utc>,
}

// ============================================================================
// EXTRACTOR INTERFACE
// ============================================================================

/// SourceExtractor - the seam every upstream source implements
///
/// Adding a source means implementing this trait; the engine is untouched.
pub trait SourceExtractor {
    /// Stable identifier recorded on every fact row
    fn source_id(&self) -> &str;

    /// Return already-fetched rows, or an error if the source failed
    fn extract(&self) -> Result<Vec<RawRecord>>;
}

/// Outcome of one source extraction, as handed to the engine
#[derive(Debug, Clone)]
pub enum SourceBatch {
    Fetched {
        source_id: String,
        records: Vec<RawRecord>,
    },
    Failed {
        source_id: String,
        reason: String,
    },
}

impl SourceBatch {
    /// Run an extractor, capturing failure instead of propagating it
    pub fn collect(extractor: &dyn SourceExtractor) -> Self {
        let source_id = extractor.source_id().to_string();
        match extractor.extract() {
            Ok(records) => SourceBatch::Fetched { source_id, records },
            Err(e) => {
                tracing::error!(source = %source_id, error = %e, "source extraction failed");
                SourceBatch::Failed {
                    source_id,
                    reason: format!("{:#}", e),
                }
            }
        }
    }

    pub fn source_id(&self) -> &str {
        match self {
            SourceBatch::Fetched { source_id, .. } => source_id,
            SourceBatch::Failed { source_id, .. } => source_id,
        }
    }
}

// ============================================================================
// CSV EXTRACT
// ============================================================================

/// Reads an already-fetched extract in the standard column layout
///
/// Columns: raw_territory_label, granularity, year, quarter, indicator_id,
/// value, source_id, extracted_at. A missing `source_id` cell falls back to
/// the extractor's own id.
pub struct CsvExtract {
    source_id: String,
    path: PathBuf,
}

impl CsvExtract {
    pub fn new(source_id: &str, path: &Path) -> Self {
        CsvExtract {
            source_id: source_id.to_string(),
            path: path.to_path_buf(),
        }
    }

    /// Source id derived from the file stem ("idealista_2020.csv" → "idealista_2020")
    pub fn from_path(path: &Path) -> Self {
        let source_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Self::new(&source_id, path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rejected_row(&self) -> RawRecord {
        RawRecord {
            source_id: Some(self.source_id.clone()),
            ..RawRecord::default()
        }
    }
}

/// Cells are UTF-8 when valid, Windows-1252 otherwise (common in Catalan open data)
fn decode_record(raw: &csv::ByteRecord) -> csv::StringRecord {
    raw.iter().map(decode_field).collect()
}

impl SourceExtractor for CsvExtract {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn extract(&self) -> Result<Vec<RawRecord>> {
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(&self.path)
            .with_context(|| format!("Failed to open extract: {:?}", self.path))?;

        let headers = decode_record(
            rdr.byte_headers()
                .with_context(|| format!("Failed to read header of {:?}", self.path))?,
        );

        let mut records = Vec::new();
        let mut raw = csv::ByteRecord::new();
        let mut line = 1;

        loop {
            line += 1;
            match rdr.read_byte_record(&mut raw) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) if e.is_io_error() => {
                    return Err(e).with_context(|| format!("Failed to read {:?}", self.path));
                }
                Err(e) => {
                    // Handed on empty so the schema rejects and counts it
                    warn!(source = %self.source_id, line, error = %e, "unreadable row");
                    records.push(self.rejected_row());
                    continue;
                }
            }

            let mut record = match decode_record(&raw).deserialize::<RawRecord>(Some(&headers)) {
                Ok(record) => record,
                Err(e) => {
                    warn!(source = %self.source_id, line, error = %e, "malformed row");
                    records.push(self.rejected_row());
                    continue;
                }
            };

            let blank = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());
            if blank(&record.source_id) {
                record.source_id = Some(self.source_id.clone());
            }
            // Empty cells arrive as Some("")
            for field in [
                &mut record.raw_territory_label,
                &mut record.granularity,
                &mut record.year,
                &mut record.quarter,
                &mut record.indicator_id,
                &mut record.value,
                &mut record.extracted_at,
            ] {
                if field.as_deref().map_or(false, |s| s.trim().is_empty()) {
                    *field = None;
                }
            }

            records.push(record);
        }

        Ok(records)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_granularity_spellings() {
        assert_eq!(Granularity::parse("Barri"), Some(Granularity::Neighborhood));
        assert_eq!(Granularity::parse("distrito"), Some(Granularity::District));
        assert_eq!(Granularity::parse(" Municipi "), Some(Granularity::Municipality));
        assert_eq!(Granularity::parse("seccio censal"), None);
        assert!(Granularity::District.is_aggregate());
        assert!(!Granularity::Neighborhood.is_aggregate());
    }

    #[test]
    fn test_csv_extract_reads_rows() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "raw_territory_label,granularity,year,quarter,indicator_id,value,source_id,extracted_at"
        )
        .unwrap();
        writeln!(file, "el Raval,barri,2020,,poblacion,47000,,2024-01-10T00:00:00Z").unwrap();
        writeln!(file, "Eixample,districte,2020,2,precio_m2_venta,4500,idealista,2024-01-10").unwrap();
        file.flush().unwrap();

        let extract = CsvExtract::new("opendata_bcn", file.path());
        let records = extract.extract().unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].raw_territory_label.as_deref(), Some("el Raval"));
        assert_eq!(records[0].quarter, None);
        assert_eq!(records[0].source_id.as_deref(), Some("opendata_bcn"));
        assert_eq!(records[1].quarter.as_deref(), Some("2"));
        assert_eq!(records[1].source_id.as_deref(), Some("idealista"));
    }

    #[test]
    fn test_latin1_rows_do_not_sink_the_extract() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            b"raw_territory_label,granularity,year,quarter,indicator_id,value,source_id,extracted_at\n",
        )
        .unwrap();
        file.write_all(b"el Raval,barri,2020,,poblacion,47000,,2024-01-10\n").unwrap();
        file.write_all(b"Sant Mart\xED de Proven\xE7als,barri,2020,,poblacion,26000,,2024-01-10\n")
            .unwrap();
        file.write_all("Sants,barri,2020,,poblacion,41000,,2024-01-10\n".as_bytes()).unwrap();
        file.flush().unwrap();

        let extract = CsvExtract::new("opendata_bcn", file.path());
        let batch = SourceBatch::collect(&extract);

        let records = match batch {
            SourceBatch::Fetched { records, .. } => records,
            SourceBatch::Failed { reason, .. } => panic!("extract failed: {}", reason),
        };
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].raw_territory_label.as_deref(), Some("el Raval"));
        assert_eq!(
            records[1].raw_territory_label.as_deref(),
            Some("Sant Martí de Provençals")
        );
        assert_eq!(records[2].raw_territory_label.as_deref(), Some("Sants"));
    }

    #[test]
    fn test_missing_file_becomes_failed_batch() {
        let extract = CsvExtract::new("ine", Path::new("/nonexistent/ine.csv"));
        let batch = SourceBatch::collect(&extract);

        assert_eq!(batch.source_id(), "ine");
        assert!(matches!(batch, SourceBatch::Failed { .. }));
    }

    #[test]
    fn test_source_id_from_file_stem() {
        let extract = CsvExtract::from_path(Path::new("/data/idealista_2020.csv"));
        assert_eq!(extract.source_id(), "idealista_2020");
    }
}
