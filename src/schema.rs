// 📐 Shape Layer - observation schema validation
//
// Turns a loosely typed RawRecord into a RawTerritoryObservation.
// A row missing a required field is rejected and counted; the batch goes on.
//
// Required: raw_territory_label, granularity, year, indicator_id, value,
//           source_id, extracted_at
// Optional: quarter (1..=4)

use crate::error::ReconcileError;
use crate::parser::{Granularity, RawRecord, RawTerritoryObservation};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

pub type ValidationResult = Result<RawTerritoryObservation, Vec<ReconcileError>>;

// ============================================================================
// OBSERVATION SCHEMA
// ============================================================================

pub struct ObservationSchema {
    /// Earliest plausible year
    pub min_year: i32,

    /// Latest plausible year
    pub max_year: i32,
}

impl ObservationSchema {
    pub fn new() -> Self {
        ObservationSchema {
            min_year: 1900,
            max_year: 2100,
        }
    }

    /// Validate a record, collecting every violation
    pub fn validate(&self, record: &RawRecord) -> ValidationResult {
        let mut errors = Vec::new();

        let label = required(&record.raw_territory_label, "raw_territory_label", &mut errors);

        let granularity = required(&record.granularity, "granularity", &mut errors).and_then(|g| {
            let parsed = Granularity::parse(g);
            if parsed.is_none() {
                errors.push(ReconcileError::schema(
                    "granularity",
                    format!("unknown granularity '{}'", g),
                ));
            }
            parsed
        });

        let year = required(&record.year, "year", &mut errors).and_then(|y| match y.parse::<i32>() {
            Ok(year) if (self.min_year..=self.max_year).contains(&year) => Some(year),
            Ok(year) => {
                errors.push(ReconcileError::schema(
                    "year",
                    format!("{} outside {}..={}", year, self.min_year, self.max_year),
                ));
                None
            }
            Err(_) => {
                errors.push(ReconcileError::schema("year", format!("'{}' is not a year", y)));
                None
            }
        });

        let quarter = match record.quarter.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            None => Some(None),
            Some(q) => match parse_quarter(q) {
                Some(n) => Some(Some(n)),
                None => {
                    errors.push(ReconcileError::schema(
                        "quarter",
                        format!("'{}' is not a quarter (1-4)", q),
                    ));
                    None
                }
            },
        };

        let indicator_id = required(&record.indicator_id, "indicator_id", &mut errors);

        let value = required(&record.value, "value", &mut errors).and_then(|v| match parse_value(v) {
            Some(value) => Some(value),
            None => {
                errors.push(ReconcileError::schema("value", format!("'{}' is not a finite number", v)));
                None
            }
        });

        let source_id = required(&record.source_id, "source_id", &mut errors);

        let extracted_at = required(&record.extracted_at, "extracted_at", &mut errors).and_then(|t| {
            let parsed = parse_timestamp(t);
            if parsed.is_none() {
                errors.push(ReconcileError::schema(
                    "extracted_at",
                    format!("'{}' is not RFC 3339 or YYYY-MM-DD", t),
                ));
            }
            parsed
        });

        match (label, granularity, year, quarter, indicator_id, value, source_id, extracted_at) {
            (
                Some(label),
                Some(granularity),
                Some(year),
                Some(quarter),
                Some(indicator_id),
                Some(value),
                Some(source_id),
                Some(extracted_at),
            ) if errors.is_empty() => Ok(RawTerritoryObservation {
                raw_territory_label: label.to_string(),
                granularity,
                year,
                quarter,
                indicator_id: indicator_id.to_string(),
                value,
                source_id: source_id.to_string(),
                extracted_at,
            }),
            _ => Err(errors),
        }
    }
}

impl Default for ObservationSchema {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// FIELD PARSERS
// ============================================================================

fn required<'a>(
    field: &'a Option<String>,
    name: &str,
    errors: &mut Vec<ReconcileError>,
) -> Option<&'a str> {
    match field.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Some(v),
        _ => {
            errors.push(ReconcileError::schema(name, "missing required field"));
            None
        }
    }
}

fn parse_quarter(raw: &str) -> Option<u8> {
    let digits = raw.trim_start_matches(['Q', 'q', 'T', 't']);
    match digits.parse::<u8>() {
        Ok(q) if (1..=4).contains(&q) => Some(q),
        _ => None,
    }
}

/// Parse "4500", "4500.5", "4.500,5", "4,500.5", "4500,5" or "47.000"
///
/// Without a comma, dots that split the digits into a 1-3 digit head and
/// 3-digit groups ("47.000", "1.234.567") are thousands separators. A "0"
/// head stays decimal ("0.125").
pub fn parse_value(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '€')
        .collect();

    if is_dot_grouped(&cleaned) {
        return cleaned.replace('.', "").parse::<f64>().ok();
    }

    let normalized = match (cleaned.rfind('.'), cleaned.rfind(',')) {
        // Both present: the last one is the decimal separator
        (Some(dot), Some(comma)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (None, Some(_)) if cleaned.matches(',').count() == 1 => cleaned.replace(',', "."),
        (None, Some(_)) => cleaned.replace(',', ""),
        _ => cleaned,
    };

    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn is_dot_grouped(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    let mut groups = digits.split('.');
    let head = match groups.next() {
        Some(head) => head,
        None => return false,
    };

    let head_ok = (1..=3).contains(&head.len())
        && head.chars().all(|c| c.is_ascii_digit())
        && !head.starts_with('0');
    let mut tail = groups.peekable();
    let has_groups = tail.peek().is_some();

    head_ok && has_groups && tail.all(|g| g.len() == 3 && g.chars().all(|c| c.is_ascii_digit()))
}

/// RFC 3339, "YYYY-MM-DD HH:MM:SS" or "YYYY-MM-DD" (midnight UTC)
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc());
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_record() -> RawRecord {
        RawRecord::new(
            "el Raval",
            "barri",
            2020,
            "poblacion",
            47000.0,
            "opendata_bcn",
            "2024-01-10T08:00:00Z",
        )
    }

    fn fields(errors: &[ReconcileError]) -> Vec<String> {
        errors
            .iter()
            .filter_map(|e| match e {
                ReconcileError::SchemaViolation { field, .. } => Some(field.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_valid_record() {
        let schema = ObservationSchema::new();
        let obs = schema.validate(&valid_record()).unwrap();

        assert_eq!(obs.raw_territory_label, "el Raval");
        assert_eq!(obs.granularity, Granularity::Neighborhood);
        assert_eq!(obs.year, 2020);
        assert_eq!(obs.quarter, None);
        assert_eq!(obs.value, 47000.0);
        assert_eq!(obs.extracted_at.to_rfc3339(), "2024-01-10T08:00:00+00:00");
    }

    #[test]
    fn test_missing_required_fields_collected() {
        let schema = ObservationSchema::new();
        let mut record = valid_record();
        record.year = None;
        record.source_id = Some("   ".to_string());

        let errors = schema.validate(&record).unwrap_err();
        assert_eq!(fields(&errors), vec!["year", "source_id"]);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let schema = ObservationSchema::new();

        let mut record = valid_record();
        record.granularity = Some("seccio censal".to_string());
        record.value = Some("n/a".to_string());
        record.year = Some("1850".to_string());

        let errors = schema.validate(&record).unwrap_err();
        assert_eq!(fields(&errors), vec!["granularity", "year", "value"]);
    }

    #[test]
    fn test_quarter() {
        let schema = ObservationSchema::new();

        let obs = schema.validate(&valid_record().with_quarter(3)).unwrap();
        assert_eq!(obs.quarter, Some(3));

        let mut record = valid_record();
        record.quarter = Some("T2".to_string());
        assert_eq!(schema.validate(&record).unwrap().quarter, Some(2));

        record.quarter = Some("5".to_string());
        let errors = schema.validate(&record).unwrap_err();
        assert_eq!(fields(&errors), vec!["quarter"]);
    }

    #[test]
    fn test_parse_value_formats() {
        assert_eq!(parse_value("4500"), Some(4500.0));
        assert_eq!(parse_value("4500.5"), Some(4500.5));
        assert_eq!(parse_value("4.500,5"), Some(4500.5));
        assert_eq!(parse_value("4,500.5"), Some(4500.5));
        assert_eq!(parse_value("4500,5"), Some(4500.5));
        assert_eq!(parse_value("12 345 €"), Some(12345.0));
        assert_eq!(parse_value("NaN"), None);
        assert_eq!(parse_value("inf"), None);
    }

    #[test]
    fn test_parse_value_thousands_grouping() {
        // Spanish grouping: dot-separated 3-digit groups are thousands
        assert_eq!(parse_value("47.000"), Some(47000.0));
        assert_eq!(parse_value("1.234.567"), Some(1234567.0));
        assert_eq!(parse_value("-2.500"), Some(-2500.0));
        assert_eq!(parse_value("47.000,25"), Some(47000.25));

        // Not grouped: decimals stay decimals
        assert_eq!(parse_value("0.125"), Some(0.125));
        assert_eq!(parse_value("47.5"), Some(47.5));
        assert_eq!(parse_value("4700.000"), Some(4700.0));
        assert_eq!(parse_value("47.0001"), Some(47.0001));
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2024-01-10T08:00:00+01:00").is_some());
        assert!(parse_timestamp("2024-01-10 08:00:00").is_some());
        assert_eq!(
            parse_timestamp("2024-01-10").unwrap().to_rfc3339(),
            "2024-01-10T00:00:00+00:00"
        );
        assert!(parse_timestamp("10/01/2024").is_none());
    }
}
