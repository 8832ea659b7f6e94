use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::schema::TargetSchema;

#[derive(Debug, Parser)]
#[command(author, version, about = "Cap-table import/export engine", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Decode a file and report the inferred field mappings and confidence
    Inspect(InspectArgs),
    /// Parse, transform, and load a file into the row store
    Import(ImportArgs),
    /// Render stored records through an export template
    Export(ExportArgs),
}

#[derive(Debug, Args)]
pub struct DecodeArgs {
    /// Delimiter character for delimited input (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Treat the first data row as values, not headers
    #[arg(long = "no-headers")]
    pub no_headers: bool,
    /// Number of leading rows to skip before the header row
    #[arg(long = "skip-rows", default_value_t = 0)]
    pub skip_rows: usize,
    /// Character encoding of the input file (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
    /// Worksheet name for spreadsheet input (defaults to the first sheet)
    #[arg(long)]
    pub sheet: Option<String>,
}

#[derive(Debug, Args)]
pub struct InspectArgs {
    /// Input file to inspect (.csv, .tsv, .xlsx, .xls)
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Target schema to map headers against (identity mapping if omitted)
    #[arg(short = 's', long = "schema", value_enum)]
    pub schema: Option<TargetSchema>,
    /// Number of transformed rows to preview
    #[arg(long, default_value_t = 5)]
    pub rows: usize,
    #[command(flatten)]
    pub decode: DecodeArgs,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    /// Input file to import (.csv, .tsv, .xlsx, .xls)
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Target schema the records are loaded into
    #[arg(short = 's', long = "schema", value_enum)]
    pub schema: TargetSchema,
    /// Company identifier the records belong to
    #[arg(short = 'c', long = "company")]
    pub company: String,
    /// Row store directory
    #[arg(long = "store")]
    pub store: PathBuf,
    /// Load a saved mapping set by name instead of inferring one
    #[arg(long = "mapping")]
    pub mapping: Option<String>,
    /// Save the mapping set under this name for reuse
    #[arg(long = "save-mapping")]
    pub save_mapping: Option<String>,
    #[command(flatten)]
    pub decode: DecodeArgs,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    /// Export template JSON file
    #[arg(
        short = 't',
        long = "template",
        required_unless_present = "template_name",
        conflicts_with = "template_name"
    )]
    pub template: Option<PathBuf>,
    /// Load a saved template by name instead of a file (requires --schema)
    #[arg(long = "template-name", requires = "schema")]
    pub template_name: Option<String>,
    /// Target schema the saved template is keyed under
    #[arg(short = 's', long = "schema", value_enum)]
    pub schema: Option<TargetSchema>,
    /// Save the template under this name for reuse
    #[arg(long = "save-template")]
    pub save_template: Option<String>,
    /// Company identifier to export records for
    #[arg(short = 'c', long = "company")]
    pub company: String,
    /// Row store directory
    #[arg(long = "store")]
    pub store: PathBuf,
    /// Output file; `.xlsx` renders a workbook, anything else CSV (stdout if omitted)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
    /// Prefix the CSV output with a `#`-comment metadata block
    #[arg(long)]
    pub metadata: bool,
}

pub fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value {
        "tab" | "\t" => Ok(b'\t'),
        "comma" | "," => Ok(b','),
        "|" | "pipe" => Ok(b'|'),
        ";" | "semicolon" => Ok(b';'),
        other => {
            let mut chars = other.chars();
            let first = chars
                .next()
                .ok_or_else(|| "Delimiter cannot be empty".to_string())?;
            if chars.next().is_some() {
                return Err("Delimiter must be a single character".to_string());
            }
            if !first.is_ascii() {
                return Err("Delimiter must be ASCII".to_string());
            }
            Ok(first as u8)
        }
    }
}
