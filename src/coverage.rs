// ✅ Coverage Tracker - per-source resolution statistics
// A source that fails extraction still appears, flagged, so missing data is visible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// PER-YEAR COUNTS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct YearCoverage {
    pub attempted: usize,
    pub resolved: usize,
    pub unresolvable: usize,
}

impl YearCoverage {
    pub fn resolution_rate(&self) -> f64 {
        rate(self.resolved, self.attempted)
    }
}

// ============================================================================
// SOURCE COVERAGE
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceCoverage {
    pub years_resolved: BTreeSet<i32>,
    pub years_unresolvable: BTreeSet<i32>,
    pub resolution_rate: f64,

    /// Rows that reached the resolver
    pub attempted: usize,
    pub resolved: usize,
    pub unresolvable: usize,

    pub schema_rejections: usize,
    pub apportionment_failures: usize,
    pub conflicts_held: usize,

    /// Set when the extractor itself failed
    pub extraction_failed: Option<String>,

    pub by_year: BTreeMap<i32, YearCoverage>,
}

impl SourceCoverage {
    pub fn is_failed(&self) -> bool {
        self.extraction_failed.is_some()
    }

    fn refresh_rate(&mut self) {
        self.resolution_rate = rate(self.resolved, self.attempted);
    }
}

fn rate(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

// ============================================================================
// COVERAGE REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub sources: BTreeMap<String, SourceCoverage>,
}

impl CoverageReport {
    pub fn summary(&self) -> String {
        let failed = self.sources.values().filter(|s| s.is_failed()).count();
        let attempted: usize = self.sources.values().map(|s| s.attempted).sum();
        let resolved: usize = self.sources.values().map(|s| s.resolved).sum();

        format!(
            "Sources: {} ({} failed), Resolved: {}/{} ({:.1}%)",
            self.sources.len(),
            failed,
            resolved,
            attempted,
            rate(resolved, attempted) * 100.0
        )
    }

    /// `{source_id: {years_resolved, years_unresolvable, resolution_rate}}`
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (source_id, coverage) in &self.sources {
            map.insert(
                source_id.clone(),
                serde_json::json!({
                    "years_resolved": coverage.years_resolved,
                    "years_unresolvable": coverage.years_unresolvable,
                    "resolution_rate": coverage.resolution_rate,
                    "extraction_failed": coverage.extraction_failed,
                }),
            );
        }
        serde_json::Value::Object(map)
    }

    /// One line per (source, year), for terminal output
    pub fn table_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (source_id, coverage) in &self.sources {
            if let Some(reason) = &coverage.extraction_failed {
                lines.push(format!("{:<24} EXTRACTION FAILED: {}", source_id, reason));
                continue;
            }
            for (year, counts) in &coverage.by_year {
                lines.push(format!(
                    "{:<24} {}  {:>5}/{:<5} {:>6.1}%",
                    source_id,
                    year,
                    counts.resolved,
                    counts.attempted,
                    counts.resolution_rate() * 100.0
                ));
            }
        }
        lines
    }
}

// ============================================================================
// TRACKER
// ============================================================================

/// Accumulates counts during a run
#[derive(Debug, Default)]
pub struct CoverageTracker {
    sources: BTreeMap<String, SourceCoverage>,
}

impl CoverageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn source(&mut self, source_id: &str) -> &mut SourceCoverage {
        self.sources.entry(source_id.to_string()).or_default()
    }

    /// Make sure the source shows up even if it produced nothing
    pub fn register(&mut self, source_id: &str) {
        self.source(source_id);
    }

    pub fn record_extraction_failure(&mut self, source_id: &str, reason: &str) {
        self.source(source_id).extraction_failed = Some(reason.to_string());
    }

    pub fn record_schema_rejection(&mut self, source_id: &str) {
        self.source(source_id).schema_rejections += 1;
    }

    pub fn record_resolved(&mut self, source_id: &str, year: i32) {
        let source = self.source(source_id);
        source.attempted += 1;
        source.resolved += 1;
        source.years_resolved.insert(year);
        let counts = source.by_year.entry(year).or_default();
        counts.attempted += 1;
        counts.resolved += 1;
    }

    pub fn record_unresolvable(&mut self, source_id: &str, year: i32) {
        let source = self.source(source_id);
        source.attempted += 1;
        source.unresolvable += 1;
        source.years_unresolvable.insert(year);
        let counts = source.by_year.entry(year).or_default();
        counts.attempted += 1;
        counts.unresolvable += 1;
    }

    pub fn record_apportionment_failure(&mut self, source_id: &str) {
        self.source(source_id).apportionment_failures += 1;
    }

    pub fn record_conflict(&mut self, source_id: &str) {
        self.source(source_id).conflicts_held += 1;
    }

    pub fn finish(mut self, run_id: &str) -> CoverageReport {
        for source in self.sources.values_mut() {
            source.refresh_rate();
        }

        CoverageReport {
            run_id: run_id.to_string(),
            generated_at: Utc::now(),
            sources: self.sources,
        }
    }
}
