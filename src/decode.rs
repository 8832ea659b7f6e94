//! Tabular Decoder: turns a raw CSV/TSV or spreadsheet file into typed
//! headers and rows with no domain knowledge.
//!
//! Delimited text is decoded through `encoding_rs` and every cell is trimmed
//! and opportunistically coerced at decode time (`data::coerce_scalar`), so
//! downstream consumers always see typed scalars. Spreadsheet cells keep the
//! type calamine reports: date cells become `Value::Date`, formula cells use
//! their cached computed result, rich text is flattened to plain text.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use calamine::{Data, Reader, open_workbook_auto};
use log::debug;

use crate::{
    data::{Record, Value, coerce_scalar},
    io_utils,
};

/// Decoded file: ordered headers plus one `Record` per data row.
/// Rows are 0-indexed internally; user-facing reporting adds 1.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Record>,
}

impl Table {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// Cell delimiter for delimited text; resolved from the extension if unset.
    pub delimiter: Option<u8>,
    /// Whether the first row (after `skip_rows`) carries field names.
    pub has_headers: bool,
    /// Leading rows to discard before header extraction.
    pub skip_rows: usize,
    /// `encoding_rs` label for delimited text input; defaults to UTF-8.
    pub encoding: Option<String>,
    /// Worksheet to read from a workbook; defaults to the first sheet.
    pub sheet: Option<String>,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        DecodeOptions {
            delimiter: None,
            has_headers: true,
            skip_rows: 0,
            encoding: None,
            sheet: None,
        }
    }
}

fn is_workbook(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some(ext) if ext.eq_ignore_ascii_case("xlsx") || ext.eq_ignore_ascii_case("xls")
    )
}

/// Decodes `path` into headers and typed rows.
///
/// Any failure here is fatal to the file: callers convert the error into a
/// single row-0 `ParseError` and never start a job from it.
pub fn decode(path: &Path, options: &DecodeOptions) -> Result<Table> {
    if is_workbook(path) {
        decode_workbook(path, options)
    } else {
        decode_delimited(path, options)
    }
}

fn decode_delimited(path: &Path, options: &DecodeOptions) -> Result<Table> {
    let delimiter = io_utils::resolve_input_delimiter(path, options.delimiter);
    let encoding = io_utils::resolve_encoding(options.encoding.as_deref())?;
    // Headers are extracted manually so skip_rows can drop leading rows first.
    let mut reader = io_utils::open_csv_reader_from_path(path, delimiter, false)?;

    let mut raw_rows: Vec<Vec<String>> = Vec::new();
    for (ordinal, result) in reader.byte_records().enumerate() {
        let record = result.with_context(|| format!("Reading row {}", ordinal + 1))?;
        raw_rows.push(io_utils::decode_record(&record, encoding)?);
    }
    if options.skip_rows >= raw_rows.len() && !raw_rows.is_empty() {
        return Err(anyhow!(
            "skip_rows ({}) consumed all {} row(s)",
            options.skip_rows,
            raw_rows.len()
        ));
    }
    let mut remaining = raw_rows.split_off(options.skip_rows.min(raw_rows.len()));
    debug!(
        "Decoded {} raw row(s) from {:?}, skipped {}",
        remaining.len(),
        path,
        options.skip_rows
    );

    let headers = if options.has_headers {
        if remaining.is_empty() {
            return Err(anyhow!("File {path:?} contains no header row"));
        }
        finalize_headers(remaining.remove(0).iter().map(|cell| cell.trim().to_string()))
    } else {
        let width = remaining.first().map_or(0, Vec::len);
        synthetic_headers(width)
    };

    let rows = remaining
        .iter()
        .map(|raw| build_record(&headers, raw.iter().map(|cell| coerce_scalar(cell))))
        .collect();

    Ok(Table { headers, rows })
}

fn decode_workbook(path: &Path, options: &DecodeOptions) -> Result<Table> {
    let mut workbook =
        open_workbook_auto(path).with_context(|| format!("Opening workbook {path:?}"))?;
    let sheet_name = match &options.sheet {
        Some(name) => name.clone(),
        None => workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("Workbook {path:?} contains no worksheets"))?,
    };
    let range = workbook
        .worksheet_range(&sheet_name)
        .with_context(|| format!("Reading worksheet '{sheet_name}' from {path:?}"))?;

    let mut cell_rows = range.rows().skip(options.skip_rows);
    let headers = if options.has_headers {
        let header_cells = cell_rows
            .next()
            .ok_or_else(|| anyhow!("Worksheet '{sheet_name}' has no rows after skipping"))?;
        finalize_headers(header_cells.iter().map(cell_to_header))
    } else {
        synthetic_headers(range.width())
    };

    let rows = cell_rows
        .map(|cells| build_record(&headers, cells.iter().map(cell_to_value)))
        .collect();

    Ok(Table { headers, rows })
}

fn build_record(headers: &[String], cells: impl Iterator<Item = Value>) -> Record {
    let mut record = Record::with_capacity(headers.len());
    let mut cells = cells.fuse();
    for header in headers {
        record.set(header, cells.next().unwrap_or(Value::Null));
    }
    record
}

fn synthetic_headers(width: usize) -> Vec<String> {
    (1..=width).map(|idx| format!("column_{idx}")).collect()
}

fn finalize_headers(names: impl Iterator<Item = String>) -> Vec<String> {
    names
        .enumerate()
        .map(|(idx, name)| {
            if name.is_empty() {
                format!("column_{}", idx + 1)
            } else {
                name
            }
        })
        .collect()
}

fn cell_to_header(cell: &Data) -> String {
    match cell_to_value(cell) {
        Value::Null => String::new(),
        value => value.as_display(),
    }
}

fn cell_to_value(cell: &Data) -> Value {
    match cell {
        Data::Empty => Value::Null,
        // Rich text arrives pre-flattened from calamine; trim and coerce so
        // workbook text behaves like delimited text.
        Data::String(s) => coerce_scalar(s),
        Data::Float(n) => Value::Number(*n),
        Data::Int(n) => Value::Number(*n as f64),
        Data::Bool(b) => Value::Boolean(*b),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(naive) => Value::Date(naive.date()),
            None => Value::Null,
        },
        Data::DateTimeIso(s) => coerce_scalar(s),
        Data::DurationIso(s) => Value::String(s.clone()),
        Data::Error(e) => Value::String(format!("#{e:?}")),
    }
}
