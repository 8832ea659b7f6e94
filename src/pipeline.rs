//! Transform/Validate Pipeline: applies each mapping's declared
//! transformation and validation to one row, accumulating errors without
//! halting the batch.
//!
//! Validation inspects the source value; the transformed value is written to
//! the output row only when validation passes. A failed validation drops
//! that one field and the row continues. Expected validation failures never
//! surface as `Err` — only decode-level problems do, upstream of here.

use std::sync::OnceLock;

use chrono::Datelike;
use regex::Regex;

use crate::{
    data::{ParseError, Record, Value, parse_naive_date},
    mapping::FieldMapping,
    schema::{TargetSchema, Transformation, Validation},
};

/// Pure, total transformation. Invalid coercions fall back (numbers to 0,
/// dates to null) instead of failing.
pub fn apply_transformation(value: &Value, transformation: Transformation) -> Value {
    match transformation {
        Transformation::Uppercase => match value {
            Value::String(s) => Value::String(s.to_uppercase()),
            other => other.clone(),
        },
        Transformation::Lowercase => match value {
            Value::String(s) => Value::String(s.to_lowercase()),
            other => other.clone(),
        },
        Transformation::Trim => match value {
            Value::String(s) => Value::String(s.trim().to_string()),
            other => other.clone(),
        },
        Transformation::Number => match value {
            Value::Number(n) => Value::Number(*n),
            Value::Boolean(true) => Value::Number(1.0),
            Value::Boolean(false) => Value::Number(0.0),
            Value::Null => Value::Null,
            Value::Date(d) => Value::Number(f64::from(d.num_days_from_ce())),
            // "NaN"/"inf" parse successfully but are not storable numbers;
            // they take the same fallback as unparseable text.
            Value::String(s) => Value::Number(
                s.trim()
                    .parse()
                    .ok()
                    .filter(|n: &f64| n.is_finite())
                    .unwrap_or(0.0),
            ),
        },
        Transformation::Date => match value {
            Value::Date(d) => Value::Date(*d),
            Value::String(s) => parse_naive_date(s.trim()).map_or(Value::Null, Value::Date),
            _ => Value::Null,
        },
        Transformation::Boolean => match value {
            Value::Boolean(b) => Value::Boolean(*b),
            Value::Number(n) => Value::Boolean(*n != 0.0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Value::Boolean(true),
                "false" | "f" | "no" | "n" | "0" => Value::Boolean(false),
                _ => Value::Null,
            },
            _ => Value::Null,
        },
    }
}

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email pattern"))
}

/// Checks the source value against a named rule. Returns the failure
/// message, if any. Optional rules (everything but `Required`) pass on
/// empty values; missing required fields are reported separately.
pub fn validate_value(value: &Value, validation: &Validation) -> Result<(), String> {
    match validation {
        Validation::Required => {
            if value.is_empty() {
                Err("Required value is missing".to_string())
            } else {
                Ok(())
            }
        }
        Validation::Email => {
            if value.is_empty() {
                return Ok(());
            }
            match value {
                Value::String(s) if email_pattern().is_match(s.trim()) => Ok(()),
                other => Err(format!("'{other}' is not a valid email address")),
            }
        }
        Validation::Number { min, max } => {
            if value.is_empty() {
                return Ok(());
            }
            let number = match value {
                Value::Number(n) => *n,
                Value::String(s) => s
                    .trim()
                    .parse()
                    .map_err(|_| format!("'{s}' is not a number"))?,
                other => return Err(format!("'{other}' is not a number")),
            };
            // NaN slips past both bound checks and infinities poison the
            // stored row, so non-finite values are rejected outright.
            if !number.is_finite() {
                return Err(format!("'{}' is not a finite number", value.as_display()));
            }
            if let Some(min) = min {
                if number < *min {
                    return Err(format!("{number} is below the minimum of {min}"));
                }
            }
            if let Some(max) = max {
                if number > *max {
                    return Err(format!("{number} is above the maximum of {max}"));
                }
            }
            Ok(())
        }
        Validation::DateFormat => {
            if value.is_empty() {
                return Ok(());
            }
            match value {
                Value::Date(_) => Ok(()),
                Value::String(s) => parse_naive_date(s.trim())
                    .map(|_| ())
                    .map_err(|_| format!("'{s}' is not a recognized date")),
                other => Err(format!("'{other}' is not a recognized date")),
            }
        }
    }
}

/// Applies every mapping to one row, then checks the target schema's
/// required fields against the transformed result.
///
/// `row_number` is the 1-based number used in error reports. A single bad
/// cell never drops the whole row; duplicate target fields are last-write-
/// wins here (they were already flagged as warnings at mapping time).
pub fn apply(
    record: &Record,
    row_number: usize,
    mappings: &[FieldMapping],
    schema: Option<TargetSchema>,
) -> (Record, Vec<ParseError>) {
    let mut transformed = Record::with_capacity(mappings.len());
    let mut errors = Vec::new();
    let mut failed_targets: Vec<&str> = Vec::new();

    for mapping in mappings {
        let source = record.get(&mapping.source_field).cloned().unwrap_or(Value::Null);

        if let Some(validation) = &mapping.validation {
            if let Err(message) = validate_value(&source, validation) {
                errors.push(ParseError::error(
                    row_number,
                    &mapping.source_field,
                    source.clone(),
                    message,
                ));
                failed_targets.push(mapping.target_field.as_str());
                continue;
            }
        }

        let value = match mapping.transformation {
            Some(transformation) => apply_transformation(&source, transformation),
            None => source,
        };
        transformed.set(&mapping.target_field, value);
    }

    if let Some(schema) = schema {
        for field in schema.required_fields() {
            // A field that already errored above is not reported twice.
            if failed_targets.contains(&field.name) {
                continue;
            }
            let missing = transformed.get(field.name).is_none_or(Value::is_empty);
            if missing {
                errors.push(ParseError::error(
                    row_number,
                    field.name,
                    Value::Null,
                    format!("Required field '{}' is missing", field.name),
                ));
            }
        }
    }

    (transformed, errors)
}
