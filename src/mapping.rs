//! Field Mapper: scores source headers against a target schema's synonym
//! patterns and assembles the per-file `ParseResult`.

use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{
    data::{ParseError, Record, Severity, normalize_field_name},
    decode::{self, DecodeOptions},
    pipeline,
    schema::{TargetField, TargetSchema, Transformation, Validation},
    similarity::similarity,
};

const EXACT_CONFIDENCE: f64 = 1.0;
const SUBSTRING_CONFIDENCE: f64 = 0.8;
const ACCEPT_THRESHOLD: f64 = 0.6;
const IDENTITY_UNVERIFIED: f64 = 0.5;
const IDENTITY_LOW: f64 = 0.3;
const ERROR_PENALTY: f64 = 0.05;

/// Association from a source column to a target schema field, carrying the
/// transformation/validation rules the pipeline will apply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldMapping {
    pub source_field: String,
    pub target_field: String,
    pub confidence: f64,
    pub transformation: Option<Transformation>,
    pub validation: Option<Validation>,
}

/// Everything the import wizard needs from one uploaded file. Immutable
/// after creation.
#[derive(Debug, Clone, Serialize)]
pub struct ParseResult {
    pub success: bool,
    pub rows: Vec<Record>,
    pub headers: Vec<String>,
    pub row_count: usize,
    pub errors: Vec<ParseError>,
    pub field_mappings: Vec<FieldMapping>,
    pub confidence: f64,
}

impl ParseResult {
    fn failed(error: ParseError) -> Self {
        ParseResult {
            success: false,
            rows: Vec::new(),
            headers: Vec::new(),
            row_count: 0,
            errors: vec![error],
            field_mappings: Vec::new(),
            confidence: 0.0,
        }
    }

    pub fn error_count(&self) -> usize {
        self.errors
            .iter()
            .filter(|e| e.severity == Severity::Error)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.errors
            .iter()
            .filter(|e| e.severity == Severity::Warning)
            .count()
    }

    /// Rows that came through the pipeline with no error attached.
    pub fn clean_row_count(&self) -> usize {
        let error_rows: std::collections::BTreeSet<usize> = self
            .errors
            .iter()
            .filter(|e| e.severity == Severity::Error && e.row > 0)
            .map(|e| e.row)
            .collect();
        self.row_count - error_rows.len()
    }
}

/// Scores one header against every (field, pattern) pair of the schema.
///
/// Exact match on normalized names wins outright at 1.0; substring
/// containment in either direction scores 0.8; anything else falls back to
/// the edit-distance scorer. Ties are broken by pattern declaration order —
/// the comparison is strict, so the first synonym listed wins.
fn best_target(header: &str, schema: TargetSchema) -> Option<(&'static TargetField, f64)> {
    let normalized_header = normalize_field_name(header);
    let mut best: Option<(&'static TargetField, f64)> = None;

    for field in schema.fields() {
        for pattern in field.patterns {
            let normalized_pattern = normalize_field_name(pattern);
            let score = if normalized_header == normalized_pattern {
                EXACT_CONFIDENCE
            } else if normalized_header.contains(&normalized_pattern)
                || normalized_pattern.contains(&normalized_header)
            {
                SUBSTRING_CONFIDENCE
            } else {
                similarity(header, pattern)
            };
            if best.is_none_or(|(_, existing)| score > existing) {
                best = Some((field, score));
            }
        }
    }

    best
}

/// Produces exactly one mapping per source header, never fewer.
///
/// Without a schema every header maps to itself at a fixed, explicitly
/// unverified 0.5. With a schema, the best-scoring target is kept only when
/// it clears 0.6; otherwise the header maps to itself at 0.3 to signal that
/// manual mapping is needed.
pub fn map_fields(headers: &[String], schema: Option<TargetSchema>) -> Vec<FieldMapping> {
    let Some(schema) = schema else {
        return headers
            .iter()
            .map(|header| FieldMapping {
                source_field: header.clone(),
                target_field: header.clone(),
                confidence: IDENTITY_UNVERIFIED,
                transformation: None,
                validation: None,
            })
            .collect();
    };

    headers
        .iter()
        .map(|header| {
            match best_target(header, schema) {
                Some((field, score)) if score > ACCEPT_THRESHOLD => {
                    debug!("Mapped '{header}' -> '{}' at {score:.2}", field.name);
                    FieldMapping {
                        source_field: header.clone(),
                        target_field: field.name.to_string(),
                        confidence: score,
                        transformation: field.transformation,
                        validation: field.validation,
                    }
                }
                _ => {
                    debug!("No target cleared the threshold for '{header}'");
                    FieldMapping {
                        source_field: header.clone(),
                        target_field: header.clone(),
                        confidence: IDENTITY_LOW,
                        transformation: None,
                        validation: None,
                    }
                }
            }
        })
        .collect()
}

/// Duplicate target fields are permitted (last write wins downstream) but
/// never silently resolved: each duplicate beyond the first is surfaced as
/// a warning so the caller can decide policy.
pub fn duplicate_target_warnings(mappings: &[FieldMapping]) -> Vec<ParseError> {
    let mut seen: Vec<&str> = Vec::new();
    let mut warnings = Vec::new();
    for mapping in mappings {
        if seen.contains(&mapping.target_field.as_str()) {
            warnings.push(ParseError::warning(
                0,
                &mapping.source_field,
                crate::data::Value::String(mapping.target_field.clone()),
                format!(
                    "Source field '{}' maps to '{}', which is already mapped; the last value will win",
                    mapping.source_field, mapping.target_field
                ),
            ));
        } else {
            seen.push(&mapping.target_field);
        }
    }
    warnings
}

fn overall_confidence(mappings: &[FieldMapping], error_count: usize) -> f64 {
    if mappings.is_empty() {
        return 0.0;
    }
    let mean = mappings.iter().map(|m| m.confidence).sum::<f64>() / mappings.len() as f64;
    (mean - ERROR_PENALTY * error_count as f64).clamp(0.0, 1.0)
}

/// Decodes, maps, and runs the pipeline over a whole file.
///
/// Never returns `Err`: a decode failure becomes a single row-0 fatal error
/// inside an unsuccessful result, and validation failures accumulate per
/// row while the batch continues.
pub fn parse_file(
    path: &Path,
    options: &DecodeOptions,
    schema: Option<TargetSchema>,
) -> ParseResult {
    let table = match decode::decode(path, options) {
        Ok(table) => table,
        Err(err) => {
            return ParseResult::failed(ParseError::fatal(format!("{err:#}")));
        }
    };

    let field_mappings = map_fields(&table.headers, schema);
    let mut errors = duplicate_target_warnings(&field_mappings);

    let mut rows = Vec::with_capacity(table.rows.len());
    for (idx, record) in table.rows.iter().enumerate() {
        let (transformed, mut row_errors) = pipeline::apply(record, idx + 1, &field_mappings, schema);
        errors.append(&mut row_errors);
        rows.push(transformed);
    }

    let error_count = errors
        .iter()
        .filter(|e| e.severity == Severity::Error)
        .count();
    let confidence = overall_confidence(&field_mappings, error_count);
    info!(
        "Parsed {:?}: {} row(s), {} mapping(s), {} error(s), confidence {:.2}",
        path,
        rows.len(),
        field_mappings.len(),
        error_count,
        confidence
    );

    ParseResult {
        success: true,
        row_count: rows.len(),
        rows,
        headers: table.headers,
        errors,
        field_mappings,
        confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn identity_mapping_without_schema_scores_half() {
        let mappings = map_fields(&headers(&["anything", "at all"]), None);
        assert_eq!(mappings.len(), 2);
        for mapping in &mappings {
            assert_eq!(mapping.confidence, 0.5);
            assert_eq!(mapping.source_field, mapping.target_field);
            assert!(mapping.transformation.is_none());
        }
    }

    #[test]
    fn exact_pattern_match_scores_one() {
        let mappings = map_fields(&headers(&["share_count"]), Some(TargetSchema::Shareholders));
        assert_eq!(mappings[0].target_field, "share_count");
        assert_eq!(mappings[0].confidence, 1.0);
    }

    #[test]
    fn substring_containment_clears_the_threshold() {
        let mappings = map_fields(
            &headers(&["Shareholder Full Name"]),
            Some(TargetSchema::Shareholders),
        );
        assert_eq!(mappings[0].target_field, "name");
        assert!(mappings[0].confidence >= 0.6);
    }

    #[test]
    fn unmatched_header_falls_back_to_low_identity() {
        let mappings = map_fields(&headers(&["zzqx42"]), Some(TargetSchema::Shareholders));
        assert_eq!(mappings[0].target_field, "zzqx42");
        assert_eq!(mappings[0].confidence, 0.3);
    }

    #[test]
    fn one_mapping_per_header_always() {
        let input = headers(&["name", "zz1", "shares", "zz2"]);
        let mappings = map_fields(&input, Some(TargetSchema::Shareholders));
        assert_eq!(mappings.len(), input.len());
        for mapping in &mappings {
            assert!((0.0..=1.0).contains(&mapping.confidence));
        }
    }

    #[test]
    fn duplicate_targets_warn_instead_of_resolving() {
        let mappings = map_fields(
            &headers(&["name", "full_name"]),
            Some(TargetSchema::Shareholders),
        );
        assert_eq!(mappings[0].target_field, "name");
        assert_eq!(mappings[1].target_field, "name");
        let warnings = duplicate_target_warnings(&mappings);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].severity, Severity::Warning);
    }

    #[test]
    fn empty_mapping_set_yields_zero_confidence() {
        assert_eq!(overall_confidence(&[], 0), 0.0);
    }

    #[test]
    fn confidence_penalty_never_goes_negative() {
        let mappings = map_fields(&headers(&["name"]), Some(TargetSchema::Shareholders));
        assert_eq!(overall_confidence(&mappings, 1000), 0.0);
    }
}
