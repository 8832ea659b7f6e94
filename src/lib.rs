pub mod cli;
pub mod data;
pub mod decode;
pub mod export;
pub mod formula;
pub mod import;
pub mod io_utils;
pub mod mapping;
pub mod pipeline;
pub mod schema;
pub mod similarity;
pub mod store;
pub mod table;

use std::{env, fs::File, io::BufReader, sync::OnceLock};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use log::{LevelFilter, info};

use crate::{
    cli::{Cli, Commands, DecodeArgs, ExportArgs, ImportArgs, InspectArgs},
    decode::DecodeOptions,
    export::ExportTemplate,
    import::{CancellationToken, ImportOrchestrator},
    store::{JsonRowStore, TemplateStore},
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("captable_io", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Inspect(args) => handle_inspect(&args),
        Commands::Import(args) => handle_import(&args),
        Commands::Export(args) => handle_export(&args),
    }
}

fn decode_options(args: &DecodeArgs) -> DecodeOptions {
    DecodeOptions {
        delimiter: args.delimiter,
        has_headers: !args.no_headers,
        skip_rows: args.skip_rows,
        encoding: args.input_encoding.clone(),
        sheet: args.sheet.clone(),
    }
}

fn handle_inspect(args: &InspectArgs) -> Result<()> {
    let options = decode_options(&args.decode);
    let result = mapping::parse_file(&args.input, &options, args.schema);
    if !result.success {
        let detail = result
            .errors
            .first()
            .map_or_else(|| "unknown decode failure".to_string(), |e| e.message.clone());
        bail!("Failed to decode {:?}: {detail}", args.input);
    }

    let mapping_headers = vec![
        "source".to_string(),
        "target".to_string(),
        "confidence".to_string(),
        "transformation".to_string(),
        "validation".to_string(),
    ];
    let mapping_rows: Vec<Vec<String>> = result
        .field_mappings
        .iter()
        .map(|m| {
            vec![
                m.source_field.clone(),
                m.target_field.clone(),
                format!("{:.2}", m.confidence),
                m.transformation
                    .map_or_else(String::new, |t| format!("{t:?}").to_lowercase()),
                m.validation
                    .map_or_else(String::new, |v| format!("{v:?}").to_lowercase()),
            ]
        })
        .collect();
    table::print_table(&mapping_headers, &mapping_rows);

    println!();
    println!(
        "{} row(s), {} error(s), {} warning(s), overall confidence {:.2}",
        result.row_count,
        result.error_count(),
        result.warning_count(),
        result.confidence
    );

    if args.rows > 0 && !result.rows.is_empty() {
        let preview_headers: Vec<String> = result.rows[0]
            .iter()
            .map(|(field, _)| field.to_string())
            .collect();
        let preview_rows: Vec<Vec<String>> = result
            .rows
            .iter()
            .take(args.rows)
            .map(|row| {
                preview_headers
                    .iter()
                    .map(|field| row.get(field).map_or_else(String::new, |v| v.as_display()))
                    .collect()
            })
            .collect();
        println!();
        table::print_table(&preview_headers, &preview_rows);
    }
    Ok(())
}

fn handle_import(args: &ImportArgs) -> Result<()> {
    let options = decode_options(&args.decode);
    let input_table = decode::decode(&args.input, &options)
        .with_context(|| format!("Decoding {:?}", args.input))?;

    let templates = TemplateStore::open(&args.store.join("templates"))?;
    let mappings = match &args.mapping {
        Some(name) => templates
            .load_mapping(&args.company, args.schema, name)
            .with_context(|| format!("Loading mapping set '{name}'"))?,
        None => mapping::map_fields(&input_table.headers, Some(args.schema)),
    };
    for warning in mapping::duplicate_target_warnings(&mappings) {
        info!("{}", warning.message);
    }
    if let Some(name) = &args.save_mapping {
        templates
            .save_mapping(&args.company, args.schema, name, &mappings)
            .with_context(|| format!("Saving mapping set '{name}'"))?;
    }

    let mut store = JsonRowStore::open(&args.store)?;
    let job = ImportOrchestrator::new(&mut store, &args.company).run(
        &input_table.rows,
        &mappings,
        args.schema,
        &CancellationToken::new(),
    )?;

    println!(
        "Job {}: {:?}, {}/{} record(s) loaded into '{}', {} issue(s)",
        job.id,
        job.status,
        job.processed_records,
        job.total_records,
        job.target_table,
        job.error_details.len()
    );
    for detail in &job.error_details {
        println!("  {detail}");
    }
    Ok(())
}

fn handle_export(args: &ExportArgs) -> Result<()> {
    let templates = TemplateStore::open(&args.store.join("templates"))?;
    let template: ExportTemplate = match (&args.template, &args.template_name) {
        (Some(path), _) => {
            let file =
                File::open(path).with_context(|| format!("Opening template {path:?}"))?;
            serde_json::from_reader(BufReader::new(file)).context("Parsing export template")?
        }
        (None, Some(name)) => {
            let schema = args
                .schema
                .ok_or_else(|| anyhow!("--schema is required with --template-name"))?;
            templates
                .load_template(&args.company, schema, name)
                .with_context(|| format!("Loading template '{name}'"))?
        }
        (None, None) => bail!("Provide --template or --template-name"),
    };
    if let Some(name) = &args.save_template {
        templates
            .save_template(&args.company, template.schema, name, &template)
            .with_context(|| format!("Saving template '{name}'"))?;
    }

    let store = JsonRowStore::open(&args.store)?;
    let records = store.load_rows(template.schema.table_name(), &args.company)?;
    let sheet = export::generate(&records, &template);

    match args.output.as_deref() {
        Some(path) if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("xlsx")) => {
            export::render_workbook(&sheet, path)?;
            println!("Wrote workbook {path:?} ({} record(s))", sheet.record_count);
        }
        other => {
            let writer = io_utils::open_raw_writer(other)?;
            export::render_csv(&sheet, writer, args.metadata)?;
            if let Some(path) = other {
                println!("Wrote {path:?} ({} record(s))", sheet.record_count);
            }
        }
    }
    Ok(())
}
