//! Export Formatter: the mirror of the import side. Applies a saved
//! template (field list, filters, grouping with subtotals, computed
//! columns) to persisted records and renders delimited text or a workbook.
//!
//! Generation is deterministic: the same records and template produce the
//! same sheet, and the same CSV bytes when the metadata block is off. Only
//! the metadata block and the "Export Info" sheet carry a generation
//! timestamp.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, info};
use regex::Regex;
use rust_xlsxwriter::{Format, Workbook};
use serde::{Deserialize, Serialize};

use crate::{
    data::{Record, Value, parse_naive_date},
    formula,
    io_utils::{self, DEFAULT_CSV_DELIMITER},
    pipeline::apply_transformation,
    schema::{TargetSchema, Transformation},
};

/// Display type of one exported column. Drives formatting only; the
/// underlying values stay typed until render time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    String,
    Number,
    Date,
    Currency,
    Percentage,
    Boolean,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateField {
    pub source_field: String,
    pub display_name: String,
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformation: Option<Transformation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    Contains,
    GreaterThan,
    LessThan,
    Between,
    In,
    NotNull,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateFilter {
    pub field: String,
    pub operator: FilterOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateGrouping {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
    #[serde(default)]
    pub subtotals: bool,
    /// Display names of the columns to sum in subtotal rows.
    #[serde(default)]
    pub subtotal_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateCalculation {
    pub display_name: String,
    /// Arithmetic over `{field}` references, e.g. `{share_count} * {price}`.
    pub formula: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateFormatting {
    #[serde(default = "default_date_format")]
    pub date_format: String,
    #[serde(default = "default_currency_symbol")]
    pub currency_symbol: String,
}

fn default_date_format() -> String {
    "%Y-%m-%d".to_string()
}

fn default_currency_symbol() -> String {
    "$".to_string()
}

impl Default for TemplateFormatting {
    fn default() -> Self {
        TemplateFormatting {
            date_format: default_date_format(),
            currency_symbol: default_currency_symbol(),
        }
    }
}

/// Immutable description of one export. Loaded once per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportTemplate {
    pub name: String,
    pub schema: TargetSchema,
    pub fields: Vec<TemplateField>,
    #[serde(default)]
    pub formatting: TemplateFormatting,
    #[serde(default)]
    pub filters: Vec<TemplateFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grouping: Option<TemplateGrouping>,
    #[serde(default)]
    pub calculations: Vec<TemplateCalculation>,
}

/// One rendered row. Subtotal rows are tagged so renderers can style them.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRow {
    pub cells: Vec<String>,
    pub is_subtotal: bool,
}

/// The fully generated, renderer-agnostic sheet.
#[derive(Debug, Clone)]
pub struct ExportSheet {
    pub template_name: String,
    pub schema: TargetSchema,
    pub headers: Vec<String>,
    pub rows: Vec<ExportRow>,
    /// Source records that survived filtering (subtotal rows excluded).
    pub record_count: usize,
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_number(), right.as_number()) {
        (Some(a), Some(b)) => a == b,
        _ => left.as_display().eq_ignore_ascii_case(&right.as_display()),
    }
}

fn compare_numeric(value: &Value, bound: &Value) -> Option<std::cmp::Ordering> {
    match (value.as_number(), bound.as_number()) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => Some(value.as_display().cmp(&bound.as_display())),
    }
}

fn matches_filter(record: &Record, filter: &TemplateFilter) -> bool {
    let value = record.get(&filter.field).cloned().unwrap_or(Value::Null);
    match filter.operator {
        FilterOperator::NotNull => !value.is_empty(),
        FilterOperator::Equals => filter
            .value
            .as_ref()
            .is_some_and(|expected| values_equal(&value, expected)),
        FilterOperator::Contains => filter.value.as_ref().is_some_and(|expected| {
            value
                .as_display()
                .to_lowercase()
                .contains(&expected.as_display().to_lowercase())
        }),
        FilterOperator::GreaterThan => filter.value.as_ref().is_some_and(|bound| {
            !value.is_empty()
                && compare_numeric(&value, bound) == Some(std::cmp::Ordering::Greater)
        }),
        FilterOperator::LessThan => filter.value.as_ref().is_some_and(|bound| {
            !value.is_empty() && compare_numeric(&value, bound) == Some(std::cmp::Ordering::Less)
        }),
        FilterOperator::Between => match (&filter.value, &filter.second_value) {
            (Some(low), Some(high)) => {
                !value.is_empty()
                    && compare_numeric(&value, low) != Some(std::cmp::Ordering::Less)
                    && compare_numeric(&value, high) != Some(std::cmp::Ordering::Greater)
            }
            _ => false,
        },
        FilterOperator::In => filter.values.as_ref().is_some_and(|candidates| {
            candidates
                .iter()
                .any(|candidate| values_equal(&value, candidate))
        }),
    }
}

fn format_number(number: f64) -> String {
    if number.fract() == 0.0 && number.abs() < 1e15 {
        format!("{number:.0}")
    } else {
        format!("{number:.2}")
    }
}

/// Formats one cell: default substitution for empty values, then the
/// field's transformation, then type-specific display formatting.
fn format_cell(raw: &Value, field: &TemplateField, formatting: &TemplateFormatting) -> String {
    let substituted = if raw.is_empty() {
        field.default_value.clone().unwrap_or(Value::Null)
    } else {
        raw.clone()
    };
    let value = match field.transformation {
        Some(transformation) => apply_transformation(&substituted, transformation),
        None => substituted,
    };
    if value.is_null() {
        return String::new();
    }
    match field.data_type {
        DataType::String => value.as_display(),
        DataType::Number => value
            .as_number()
            .map_or_else(|| value.as_display(), format_number),
        DataType::Currency => value.as_number().map_or_else(
            || value.as_display(),
            |n| format!("{}{n:.2}", formatting.currency_symbol),
        ),
        DataType::Percentage => value
            .as_number()
            .map_or_else(|| value.as_display(), |n| format!("{n:.2}%")),
        DataType::Boolean => match apply_transformation(&value, Transformation::Boolean) {
            Value::Boolean(true) => "Yes".to_string(),
            Value::Boolean(false) => "No".to_string(),
            _ => value.as_display(),
        },
        DataType::Date => match &value {
            Value::Date(date) => date.format(&formatting.date_format).to_string(),
            Value::String(s) => parse_naive_date(s.trim()).map_or_else(
                |_| value.as_display(),
                |date| date.format(&formatting.date_format).to_string(),
            ),
            other => other.as_display(),
        },
    }
}

fn field_reference_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{([^{}]+)\}").expect("valid reference pattern"))
}

/// Substitutes `{field}` references with numeric values and evaluates the
/// result. Any unresolvable reference or evaluation failure yields the
/// literal cell `"ERROR"` rather than aborting the export.
fn evaluate_calculation(record: &Record, calculation: &TemplateCalculation) -> String {
    let mut resolvable = true;
    let substituted = field_reference_pattern().replace_all(
        &calculation.formula,
        |captures: &regex::Captures<'_>| {
            let reference = captures[1].trim();
            match record.get(reference).and_then(Value::as_number) {
                Some(number) if number.is_finite() => {
                    // Parenthesized so negatives survive substitution.
                    format!("({number})")
                }
                _ => {
                    resolvable = false;
                    String::new()
                }
            }
        },
    );
    if !resolvable {
        return "ERROR".to_string();
    }
    match formula::evaluate(&substituted) {
        Ok(result) => format_number(result),
        Err(err) => {
            debug!("Calculation '{}' failed: {err}", calculation.display_name);
            "ERROR".to_string()
        }
    }
}

fn subtotal_row(
    label: &str,
    sums: &[Option<f64>],
    template: &ExportTemplate,
) -> ExportRow {
    let mut cells: Vec<String> = sums
        .iter()
        .zip(&template.fields)
        .enumerate()
        .map(|(idx, (sum, field))| match sum {
            Some(total) => match field.data_type {
                DataType::Currency => {
                    format!("{}{total:.2}", template.formatting.currency_symbol)
                }
                DataType::Percentage => format!("{total:.2}%"),
                _ => format_number(*total),
            },
            None if idx == 0 => format!("Subtotal: {label}"),
            None => String::new(),
        })
        .collect();
    cells.extend(template.calculations.iter().map(|_| String::new()));
    ExportRow {
        cells,
        is_subtotal: true,
    }
}

/// Runs the whole template over a record set: filter, format, group with
/// subtotals, compute. Pure; renderers consume the result.
pub fn generate(records: &[Record], template: &ExportTemplate) -> ExportSheet {
    let mut selected: Vec<&Record> = records
        .iter()
        .filter(|record| {
            template
                .filters
                .iter()
                .all(|filter| matches_filter(record, filter))
        })
        .collect();

    if let Some(grouping) = &template.grouping {
        selected.sort_by(|a, b| {
            let left = a.get(&grouping.field).cloned().unwrap_or(Value::Null);
            let right = b.get(&grouping.field).cloned().unwrap_or(Value::Null);
            match grouping.direction {
                SortDirection::Ascending => left.cmp(&right),
                SortDirection::Descending => right.cmp(&left),
            }
        });
    }

    let mut headers: Vec<String> = template
        .fields
        .iter()
        .map(|field| field.display_name.clone())
        .collect();
    headers.extend(
        template
            .calculations
            .iter()
            .map(|calculation| calculation.display_name.clone()),
    );

    let subtotals_on = template
        .grouping
        .as_ref()
        .is_some_and(|grouping| grouping.subtotals);
    let mut rows: Vec<ExportRow> = Vec::with_capacity(selected.len());
    let mut group_sums: Vec<Option<f64>> = template
        .fields
        .iter()
        .map(|field| {
            let summed = template.grouping.as_ref().is_some_and(|grouping| {
                grouping.subtotal_fields.contains(&field.display_name)
            });
            if summed { Some(0.0) } else { None }
        })
        .collect();
    let blank_sums: Vec<Option<f64>> = group_sums.clone();
    let mut current_group: Option<Value> = None;

    for record in &selected {
        if subtotals_on {
            if let Some(grouping) = &template.grouping {
                let group_value = record.get(&grouping.field).cloned().unwrap_or(Value::Null);
                if let Some(previous) = &current_group {
                    if *previous != group_value {
                        rows.push(subtotal_row(&previous.as_display(), &group_sums, template));
                        group_sums = blank_sums.clone();
                    }
                }
                current_group = Some(group_value);
            }
        }

        let mut cells: Vec<String> = Vec::with_capacity(headers.len());
        for (idx, field) in template.fields.iter().enumerate() {
            let raw = record.get(&field.source_field).cloned().unwrap_or(Value::Null);
            if let Some(sum) = group_sums.get_mut(idx).and_then(Option::as_mut) {
                *sum += raw.as_number().unwrap_or(0.0);
            }
            cells.push(format_cell(&raw, field, &template.formatting));
        }
        for calculation in &template.calculations {
            cells.push(evaluate_calculation(record, calculation));
        }
        rows.push(ExportRow {
            cells,
            is_subtotal: false,
        });
    }

    if subtotals_on {
        if let Some(last_group) = &current_group {
            rows.push(subtotal_row(&last_group.as_display(), &group_sums, template));
        }
    }

    info!(
        "Generated export '{}': {} of {} record(s) selected, {} column(s)",
        template.name,
        selected.len(),
        records.len(),
        headers.len()
    );
    ExportSheet {
        template_name: template.name.clone(),
        schema: template.schema,
        headers,
        rows,
        record_count: selected.len(),
    }
}

/// Writes the sheet as delimited text. The optional metadata block is a
/// leading run of `#`-comment lines; leaving it off makes repeated exports
/// byte-identical.
pub fn render_csv<W: Write>(
    sheet: &ExportSheet,
    mut writer: W,
    include_metadata: bool,
) -> Result<()> {
    if include_metadata {
        writeln!(writer, "# Template: {}", sheet.template_name)?;
        writeln!(writer, "# Schema: {}", sheet.schema)?;
        writeln!(writer, "# Records: {}", sheet.record_count)?;
        writeln!(writer, "# Generated: {}", Utc::now().to_rfc3339())?;
    }
    let mut csv_writer = io_utils::csv_writer_from(writer, DEFAULT_CSV_DELIMITER);
    csv_writer
        .write_record(&sheet.headers)
        .context("Writing export header row")?;
    for row in &sheet.rows {
        csv_writer
            .write_record(&row.cells)
            .context("Writing export row")?;
    }
    csv_writer.flush().context("Flushing export output")?;
    Ok(())
}

/// Writes the sheet as a workbook: one data sheet plus an "Export Info"
/// sheet carrying the template name, generation time, record count, and
/// schema.
pub fn render_workbook(sheet: &ExportSheet, path: &Path) -> Result<()> {
    let mut workbook = Workbook::new();
    let header_format = Format::new().set_bold();
    let subtotal_format = Format::new().set_bold();

    let data_sheet = workbook.add_worksheet();
    data_sheet.set_name("Data").context("Naming data sheet")?;
    for (col, header) in sheet.headers.iter().enumerate() {
        data_sheet
            .write_string_with_format(0, col as u16, header, &header_format)
            .context("Writing workbook header")?;
    }
    for (row_idx, row) in sheet.rows.iter().enumerate() {
        for (col, cell) in row.cells.iter().enumerate() {
            let row_number = (row_idx + 1) as u32;
            if row.is_subtotal {
                data_sheet
                    .write_string_with_format(row_number, col as u16, cell, &subtotal_format)
                    .context("Writing subtotal row")?;
            } else {
                data_sheet
                    .write_string(row_number, col as u16, cell)
                    .context("Writing workbook row")?;
            }
        }
    }

    let info_sheet = workbook.add_worksheet();
    info_sheet
        .set_name("Export Info")
        .context("Naming info sheet")?;
    let entries = [
        ("Template", sheet.template_name.clone()),
        ("Schema", sheet.schema.to_string()),
        ("Record Count", sheet.record_count.to_string()),
        ("Generated At", Utc::now().to_rfc3339()),
    ];
    for (row, (key, value)) in entries.iter().enumerate() {
        info_sheet
            .write_string_with_format(row as u32, 0, *key, &header_format)
            .context("Writing info key")?;
        info_sheet
            .write_string(row as u32, 1, value)
            .context("Writing info value")?;
    }

    workbook
        .save(path)
        .with_context(|| format!("Saving workbook {path:?}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn record(entries: &[(&str, Value)]) -> Record {
        let mut row = Record::new();
        for (field, value) in entries {
            row.set(field, value.clone());
        }
        row
    }

    fn sample_records() -> Vec<Record> {
        vec![
            record(&[
                ("name", Value::String("Ada".to_string())),
                ("share_class", Value::String("Common".to_string())),
                ("share_count", Value::Number(100.0)),
                ("price", Value::Number(2.5)),
            ]),
            record(&[
                ("name", Value::String("Grace".to_string())),
                ("share_class", Value::String("Preferred".to_string())),
                ("share_count", Value::Number(50.0)),
                ("price", Value::Number(4.0)),
            ]),
            record(&[
                ("name", Value::String("Edsger".to_string())),
                ("share_class", Value::String("Common".to_string())),
                ("share_count", Value::Number(25.0)),
                ("price", Value::Number(2.5)),
            ]),
        ]
    }

    fn field(source: &str, display: &str, data_type: DataType) -> TemplateField {
        TemplateField {
            source_field: source.to_string(),
            display_name: display.to_string(),
            data_type,
            transformation: None,
            default_value: None,
        }
    }

    fn basic_template() -> ExportTemplate {
        ExportTemplate {
            name: "Holdings".to_string(),
            schema: TargetSchema::Shareholders,
            fields: vec![
                field("name", "Name", DataType::String),
                field("share_count", "Shares", DataType::Number),
            ],
            formatting: TemplateFormatting::default(),
            filters: Vec::new(),
            grouping: None,
            calculations: Vec::new(),
        }
    }

    #[test]
    fn filters_are_anded() {
        let mut template = basic_template();
        template.filters = vec![
            TemplateFilter {
                field: "share_class".to_string(),
                operator: FilterOperator::Equals,
                value: Some(Value::String("Common".to_string())),
                second_value: None,
                values: None,
            },
            TemplateFilter {
                field: "share_count".to_string(),
                operator: FilterOperator::GreaterThan,
                value: Some(Value::Number(30.0)),
                second_value: None,
                values: None,
            },
        ];
        let sheet = generate(&sample_records(), &template);
        assert_eq!(sheet.record_count, 1);
        assert_eq!(sheet.rows[0].cells[0], "Ada");
    }

    #[test]
    fn between_and_in_operators() {
        let records = sample_records();
        let between = TemplateFilter {
            field: "share_count".to_string(),
            operator: FilterOperator::Between,
            value: Some(Value::Number(25.0)),
            second_value: Some(Value::Number(60.0)),
            values: None,
        };
        let matching: Vec<_> = records
            .iter()
            .filter(|r| matches_filter(r, &between))
            .collect();
        assert_eq!(matching.len(), 2);

        let set = TemplateFilter {
            field: "name".to_string(),
            operator: FilterOperator::In,
            value: None,
            second_value: None,
            values: Some(vec![
                Value::String("ada".to_string()),
                Value::String("Grace".to_string()),
            ]),
        };
        let matching: Vec<_> = records.iter().filter(|r| matches_filter(r, &set)).collect();
        assert_eq!(matching.len(), 2);
    }

    #[test]
    fn type_formatting() {
        let formatting = TemplateFormatting::default();
        let currency = field("price", "Price", DataType::Currency);
        assert_eq!(format_cell(&Value::Number(2.5), &currency, &formatting), "$2.50");

        let percentage = field("pct", "Ownership", DataType::Percentage);
        assert_eq!(
            format_cell(&Value::Number(12.345), &percentage, &formatting),
            "12.35%"
        );

        let boolean = field("voting", "Voting", DataType::Boolean);
        assert_eq!(
            format_cell(&Value::String("yes".to_string()), &boolean, &formatting),
            "Yes"
        );
        assert_eq!(format_cell(&Value::Boolean(false), &boolean, &formatting), "No");

        let date = field("when", "Acquired", DataType::Date);
        let value = Value::Date(NaiveDate::from_ymd_opt(2023, 7, 4).unwrap());
        assert_eq!(format_cell(&value, &date, &formatting), "2023-07-04");

        let number = field("share_count", "Shares", DataType::Number);
        assert_eq!(format_cell(&Value::Number(100.0), &number, &formatting), "100");
        assert_eq!(format_cell(&Value::Number(0.5), &number, &formatting), "0.50");
    }

    #[test]
    fn empty_values_take_the_default_before_formatting() {
        let formatting = TemplateFormatting::default();
        let mut column = field("share_class", "Class", DataType::String);
        column.default_value = Some(Value::String("Common".to_string()));
        assert_eq!(format_cell(&Value::Null, &column, &formatting), "Common");
        assert_eq!(
            format_cell(&Value::String("Preferred".to_string()), &column, &formatting),
            "Preferred"
        );
    }

    #[test]
    fn grouping_inserts_tagged_subtotal_rows() {
        let mut template = basic_template();
        template.fields.insert(1, field("share_class", "Class", DataType::String));
        template.grouping = Some(TemplateGrouping {
            field: "share_class".to_string(),
            direction: SortDirection::Ascending,
            subtotals: true,
            subtotal_fields: vec!["Shares".to_string()],
        });
        let sheet = generate(&sample_records(), &template);

        // Three data rows plus one subtotal per group.
        assert_eq!(sheet.rows.len(), 5);
        let subtotals: Vec<_> = sheet.rows.iter().filter(|r| r.is_subtotal).collect();
        assert_eq!(subtotals.len(), 2);
        assert_eq!(subtotals[0].cells[0], "Subtotal: Common");
        assert_eq!(subtotals[0].cells[2], "125");
        assert_eq!(subtotals[1].cells[0], "Subtotal: Preferred");
        assert_eq!(subtotals[1].cells[2], "50");
        assert_eq!(sheet.record_count, 3);
    }

    #[test]
    fn calculations_append_computed_columns() {
        let mut template = basic_template();
        template.calculations = vec![TemplateCalculation {
            display_name: "Total Value".to_string(),
            formula: "{share_count} * {price}".to_string(),
        }];
        let sheet = generate(&sample_records(), &template);
        assert_eq!(sheet.headers.last().map(String::as_str), Some("Total Value"));
        assert_eq!(sheet.rows[0].cells[2], "250");
    }

    #[test]
    fn calculation_errors_become_error_cells() {
        let mut template = basic_template();
        template.calculations = vec![
            TemplateCalculation {
                display_name: "Broken".to_string(),
                formula: "{share_count} / 0".to_string(),
            },
            TemplateCalculation {
                display_name: "Missing".to_string(),
                formula: "{no_such_field} + 1".to_string(),
            },
        ];
        let sheet = generate(&sample_records(), &template);
        assert_eq!(sheet.rows[0].cells[2], "ERROR");
        assert_eq!(sheet.rows[0].cells[3], "ERROR");
    }

    #[test]
    fn csv_rendering_without_metadata_is_deterministic() {
        let template = basic_template();
        let sheet = generate(&sample_records(), &template);
        let mut first = Vec::new();
        render_csv(&sheet, &mut first, false).unwrap();
        let mut second = Vec::new();
        render_csv(&sheet, &mut second, false).unwrap();
        assert_eq!(first, second);
        let text = String::from_utf8(first).unwrap();
        assert!(text.starts_with("Name,Shares\n"));
        assert!(!text.contains('#'));
    }

    #[test]
    fn csv_metadata_block_leads_with_comments() {
        let template = basic_template();
        let sheet = generate(&sample_records(), &template);
        let mut out = Vec::new();
        render_csv(&sheet, &mut out, true).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("# Template: Holdings\n"));
        assert!(text.contains("# Records: 3\n"));
    }

    #[test]
    fn template_json_round_trip() {
        let mut template = basic_template();
        template.grouping = Some(TemplateGrouping {
            field: "share_class".to_string(),
            direction: SortDirection::Descending,
            subtotals: true,
            subtotal_fields: vec!["Shares".to_string()],
        });
        let json = serde_json::to_string(&template).unwrap();
        let parsed: ExportTemplate = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.name, template.name);
        assert_eq!(parsed.fields.len(), 2);
        assert_eq!(
            parsed.grouping.as_ref().map(|g| g.direction),
            Some(SortDirection::Descending)
        );
    }
}
