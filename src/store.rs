//! Collaborator implementations: a directory-backed JSONL row store for the
//! CLI, an in-memory store for tests, and the key-value template store for
//! reusable mapping sets and export templates.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use log::debug;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    data::Record,
    export::ExportTemplate,
    import::{ImportJob, RowStore},
    mapping::FieldMapping,
    schema::TargetSchema,
};

#[derive(Debug, Serialize, Deserialize)]
struct StoredRow {
    company_id: String,
    row: Record,
}

/// Row store that appends JSONL per table under a root directory and keeps
/// jobs as one JSON file each. Inserted batches are deduplicated by
/// idempotency key, so re-running a partially failed import is safe here.
pub struct JsonRowStore {
    root: PathBuf,
    seen_keys: BTreeSet<String>,
}

impl JsonRowStore {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join("jobs"))
            .with_context(|| format!("Creating store directory {root:?}"))?;
        let mut seen_keys = BTreeSet::new();
        let keys_path = root.join("batch_keys");
        if keys_path.exists() {
            let file = File::open(&keys_path)
                .with_context(|| format!("Opening batch key journal {keys_path:?}"))?;
            for line in BufReader::new(file).lines() {
                seen_keys.insert(line?);
            }
        }
        Ok(JsonRowStore {
            root: root.to_path_buf(),
            seen_keys,
        })
    }

    fn table_path(&self, table: &str) -> PathBuf {
        self.root.join(format!("{table}.jsonl"))
    }

    pub fn load_rows(&self, table: &str, company_id: &str) -> Result<Vec<Record>> {
        let path = self.table_path(table);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path).with_context(|| format!("Opening table file {path:?}"))?;
        let mut rows = Vec::new();
        for (ordinal, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let stored: StoredRow = serde_json::from_str(&line)
                .with_context(|| format!("Parsing row {} of {path:?}", ordinal + 1))?;
            if stored.company_id == company_id {
                rows.push(stored.row);
            }
        }
        Ok(rows)
    }

    pub fn load_job(&self, id: Uuid) -> Result<ImportJob> {
        let path = self.root.join("jobs").join(format!("{id}.json"));
        let file = File::open(&path).with_context(|| format!("Opening job file {path:?}"))?;
        serde_json::from_reader(BufReader::new(file)).context("Parsing job JSON")
    }

    fn record_key(&mut self, key: &str) -> Result<()> {
        self.seen_keys.insert(key.to_string());
        let keys_path = self.root.join("batch_keys");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&keys_path)
            .with_context(|| format!("Opening batch key journal {keys_path:?}"))?;
        writeln!(file, "{key}")?;
        Ok(())
    }
}

impl RowStore for JsonRowStore {
    fn bulk_insert(
        &mut self,
        table: &str,
        company_id: &str,
        rows: &[Record],
        idempotency_key: &str,
    ) -> Result<()> {
        if self.seen_keys.contains(idempotency_key) {
            debug!("Skipping batch with already-applied key {idempotency_key}");
            return Ok(());
        }
        let path = self.table_path(table);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Opening table file {path:?}"))?;
        for row in rows {
            let stored = StoredRow {
                company_id: company_id.to_string(),
                row: row.clone(),
            };
            let line = serde_json::to_string(&stored).context("Serializing row")?;
            writeln!(file, "{line}")?;
        }
        file.flush()?;
        self.record_key(idempotency_key)
    }

    fn save_job(&mut self, job: &ImportJob) -> Result<()> {
        let path = self.root.join("jobs").join(format!("{}.json", job.id));
        let file =
            File::create(&path).with_context(|| format!("Creating job file {path:?}"))?;
        serde_json::to_writer_pretty(file, job).context("Writing job JSON")
    }
}

/// In-memory store with optional injected batch failures, for tests and
/// dry runs.
#[derive(Debug, Default)]
pub struct MemoryRowStore {
    tables: BTreeMap<String, Vec<Record>>,
    jobs: BTreeMap<Uuid, ImportJob>,
    seen_keys: BTreeSet<String>,
    fail_on_calls: BTreeSet<usize>,
    insert_calls: usize,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        MemoryRowStore::default()
    }

    /// Makes the nth `bulk_insert` call (0-based) fail.
    pub fn failing_on_batch(mut self, call: usize) -> Self {
        self.fail_on_calls.insert(call);
        self
    }

    pub fn rows(&self, table: &str) -> &[Record] {
        self.tables.get(table).map_or(&[], Vec::as_slice)
    }

    pub fn job(&self, id: Uuid) -> Option<&ImportJob> {
        self.jobs.get(&id)
    }
}

impl RowStore for MemoryRowStore {
    fn bulk_insert(
        &mut self,
        table: &str,
        _company_id: &str,
        rows: &[Record],
        idempotency_key: &str,
    ) -> Result<()> {
        let call = self.insert_calls;
        self.insert_calls += 1;
        if self.fail_on_calls.contains(&call) {
            return Err(anyhow!("simulated backend failure"));
        }
        if !self.seen_keys.insert(idempotency_key.to_string()) {
            return Ok(());
        }
        self.tables
            .entry(table.to_string())
            .or_default()
            .extend(rows.iter().cloned());
        Ok(())
    }

    fn save_job(&mut self, job: &ImportJob) -> Result<()> {
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }
}

/// Simple key-value persistence for named mapping sets and export
/// templates, keyed by company and target schema.
pub struct TemplateStore {
    root: PathBuf,
}

impl TemplateStore {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("Creating template directory {root:?}"))?;
        Ok(TemplateStore {
            root: root.to_path_buf(),
        })
    }

    fn key_path(&self, company_id: &str, schema: TargetSchema, name: &str, kind: &str) -> PathBuf {
        self.root
            .join(company_id)
            .join(schema.table_name())
            .join(format!("{name}.{kind}.json"))
    }

    fn save<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Creating template directory {parent:?}"))?;
        }
        let file = File::create(path).with_context(|| format!("Creating {path:?}"))?;
        serde_json::to_writer_pretty(file, value).context("Writing template JSON")
    }

    fn load<T: for<'de> Deserialize<'de>>(&self, path: &Path) -> Result<T> {
        let file = File::open(path).with_context(|| format!("Opening {path:?}"))?;
        serde_json::from_reader(BufReader::new(file)).context("Parsing template JSON")
    }

    pub fn save_mapping(
        &self,
        company_id: &str,
        schema: TargetSchema,
        name: &str,
        mappings: &[FieldMapping],
    ) -> Result<()> {
        self.save(&self.key_path(company_id, schema, name, "mapping"), &mappings)
    }

    pub fn load_mapping(
        &self,
        company_id: &str,
        schema: TargetSchema,
        name: &str,
    ) -> Result<Vec<FieldMapping>> {
        self.load(&self.key_path(company_id, schema, name, "mapping"))
    }

    pub fn save_template(
        &self,
        company_id: &str,
        schema: TargetSchema,
        name: &str,
        template: &ExportTemplate,
    ) -> Result<()> {
        self.save(&self.key_path(company_id, schema, name, "template"), template)
    }

    pub fn load_template(
        &self,
        company_id: &str,
        schema: TargetSchema,
        name: &str,
    ) -> Result<ExportTemplate> {
        self.load(&self.key_path(company_id, schema, name, "template"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Value;

    fn sample_rows(count: usize) -> Vec<Record> {
        (0..count)
            .map(|idx| {
                let mut record = Record::new();
                record.set("name", Value::String(format!("holder-{idx}")));
                record
            })
            .collect()
    }

    #[test]
    fn json_store_round_trips_rows_per_company() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonRowStore::open(dir.path()).unwrap();
        store
            .bulk_insert("shareholders", "acme", &sample_rows(3), "key-a")
            .unwrap();
        store
            .bulk_insert("shareholders", "other", &sample_rows(2), "key-b")
            .unwrap();

        let rows = store.load_rows("shareholders", "acme").unwrap();
        assert_eq!(rows.len(), 3);
        assert!(store.load_rows("transactions", "acme").unwrap().is_empty());
    }

    #[test]
    fn json_store_skips_repeated_idempotency_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonRowStore::open(dir.path()).unwrap();
        store
            .bulk_insert("shareholders", "acme", &sample_rows(3), "same-key")
            .unwrap();
        store
            .bulk_insert("shareholders", "acme", &sample_rows(3), "same-key")
            .unwrap();
        assert_eq!(store.load_rows("shareholders", "acme").unwrap().len(), 3);

        // The key journal survives reopening.
        let mut reopened = JsonRowStore::open(dir.path()).unwrap();
        reopened
            .bulk_insert("shareholders", "acme", &sample_rows(3), "same-key")
            .unwrap();
        assert_eq!(reopened.load_rows("shareholders", "acme").unwrap().len(), 3);
    }

    #[test]
    fn template_store_round_trips_export_templates() {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::open(dir.path()).unwrap();
        let template = ExportTemplate {
            name: "Quarterly Holdings".to_string(),
            schema: TargetSchema::Shareholders,
            fields: vec![crate::export::TemplateField {
                source_field: "name".to_string(),
                display_name: "Shareholder".to_string(),
                data_type: crate::export::DataType::String,
                transformation: None,
                default_value: None,
            }],
            formatting: crate::export::TemplateFormatting::default(),
            filters: Vec::new(),
            grouping: None,
            calculations: Vec::new(),
        };
        store
            .save_template("acme", TargetSchema::Shareholders, "quarterly", &template)
            .unwrap();
        let loaded = store
            .load_template("acme", TargetSchema::Shareholders, "quarterly")
            .unwrap();
        assert_eq!(loaded.name, "Quarterly Holdings");
        assert_eq!(loaded.fields.len(), 1);
        assert!(
            store
                .load_template("acme", TargetSchema::Shareholders, "annual")
                .is_err()
        );
    }

    #[test]
    fn template_store_round_trips_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::open(dir.path()).unwrap();
        let mappings = crate::mapping::map_fields(
            &["name".to_string()],
            Some(TargetSchema::Shareholders),
        );
        store
            .save_mapping("acme", TargetSchema::Shareholders, "quarterly", &mappings)
            .unwrap();
        let loaded = store
            .load_mapping("acme", TargetSchema::Shareholders, "quarterly")
            .unwrap();
        assert_eq!(loaded, mappings);
        assert!(
            store
                .load_mapping("acme", TargetSchema::Transactions, "quarterly")
                .is_err()
        );
    }
}
