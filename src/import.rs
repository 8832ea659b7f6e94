//! Import Orchestrator: drives the pipeline over a dataset in fixed-size
//! batches, persisting progress and accumulating failures without ever
//! aborting the job for a bad batch.
//!
//! One orchestrator instance exclusively owns one `ImportJob`; batches are
//! processed strictly sequentially so `processed_records` stays monotonic
//! and backend write concurrency stays bounded. This is an at-least-once,
//! best-effort pipeline: successful batches are never rolled back, and
//! retried rows are not deduplicated here — the per-batch idempotency key
//! exists so a store that honours it can make retries safe.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{
    data::Record,
    mapping::FieldMapping,
    pipeline,
    schema::TargetSchema,
};

pub const BATCH_SIZE: usize = 100;

/// Abstract row-store capability. The engine never constructs a concrete
/// client; callers pass whatever backend they own.
pub trait RowStore {
    /// Inserts one batch. `idempotency_key` is stable across retries of the
    /// same job/batch pair; honouring it is the store's concern.
    fn bulk_insert(
        &mut self,
        table: &str,
        company_id: &str,
        rows: &[Record],
        idempotency_key: &str,
    ) -> Result<()>;

    /// Persists the job row. Called at creation, after every batch, and at
    /// finalization.
    fn save_job(&mut self, job: &ImportJob) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Processing,
    Completed,
    CompletedWithErrors,
    Failed,
}

/// Persisted import job record, mutated once per batch and terminal once
/// all batches are processed or the run is cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: Uuid,
    pub company_id: String,
    pub target_table: String,
    pub total_records: usize,
    pub processed_records: usize,
    pub status: JobStatus,
    pub error_details: Vec<String>,
    pub progress_percentage: u8,
}

impl ImportJob {
    fn new(company_id: &str, target_table: &str, total_records: usize) -> Self {
        ImportJob {
            id: Uuid::new_v4(),
            company_id: company_id.to_string(),
            target_table: target_table.to_string(),
            total_records,
            processed_records: 0,
            status: JobStatus::Processing,
            error_details: Vec::new(),
            progress_percentage: 0,
        }
    }

    fn update_progress(&mut self) {
        self.progress_percentage = if self.total_records == 0 {
            100
        } else {
            let percent =
                (self.processed_records as f64 / self.total_records as f64 * 100.0).round();
            percent as u8
        };
    }
}

/// Cooperative cancellation checked between batches. The in-flight batch is
/// never interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Stable retry key for one (job, batch) pair.
fn idempotency_key(job_id: Uuid, batch_index: usize) -> String {
    let digest = Sha256::digest(format!("{job_id}:{batch_index}").as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

pub struct ImportOrchestrator<'a, S: RowStore> {
    store: &'a mut S,
    company_id: String,
    batch_size: usize,
}

impl<'a, S: RowStore> ImportOrchestrator<'a, S> {
    pub fn new(store: &'a mut S, company_id: &str) -> Self {
        ImportOrchestrator {
            store,
            company_id: company_id.to_string(),
            batch_size: BATCH_SIZE,
        }
    }

    /// Runs the whole import. Batch-level failures are recorded and the job
    /// continues; only store failures while persisting the job itself (or
    /// other genuinely unexpected errors) propagate as `Err`.
    pub fn run(
        &mut self,
        data: &[Record],
        mappings: &[FieldMapping],
        schema: TargetSchema,
        cancel: &CancellationToken,
    ) -> Result<ImportJob> {
        let table = schema.table_name();
        let mut job = ImportJob::new(&self.company_id, table, data.len());
        self.store
            .save_job(&job)
            .context("Persisting new import job")?;
        info!(
            "Import job {} started: {} record(s) into '{}'",
            job.id,
            data.len(),
            table
        );

        for (batch_index, batch) in data.chunks(self.batch_size).enumerate() {
            if cancel.is_cancelled() {
                job.status = JobStatus::Failed;
                job.error_details
                    .push(format!("cancelled after batch {batch_index}"));
                self.store
                    .save_job(&job)
                    .context("Persisting cancelled import job")?;
                warn!("Import job {} cancelled after batch {batch_index}", job.id);
                return Ok(job);
            }

            let mut transformed = Vec::with_capacity(batch.len());
            for (offset, record) in batch.iter().enumerate() {
                let row_number = batch_index * self.batch_size + offset + 1;
                let (row, row_errors) =
                    pipeline::apply(record, row_number, mappings, Some(schema));
                for error in row_errors {
                    job.error_details.push(format!(
                        "Row {}, column '{}': {}",
                        error.row, error.column, error.message
                    ));
                }
                transformed.push(row);
            }

            let key = idempotency_key(job.id, batch_index);
            match self
                .store
                .bulk_insert(table, &self.company_id, &transformed, &key)
            {
                Ok(()) => {
                    job.processed_records += batch.len();
                    debug!(
                        "Job {}: batch {batch_index} inserted ({} row(s))",
                        job.id,
                        batch.len()
                    );
                }
                Err(err) => {
                    // Batch failures are never fatal to the job.
                    job.error_details
                        .push(format!("Batch {batch_index} failed: {err:#}"));
                    warn!("Job {}: batch {batch_index} failed: {err:#}", job.id);
                }
            }

            job.update_progress();
            self.store
                .save_job(&job)
                .context("Persisting import job progress")?;
        }

        // An empty dataset produces no batches, so progress is settled here.
        job.update_progress();
        job.status = if job.error_details.is_empty() {
            JobStatus::Completed
        } else {
            JobStatus::CompletedWithErrors
        };
        self.store
            .save_job(&job)
            .context("Persisting finished import job")?;
        info!(
            "Import job {} finished: {:?}, {}/{} record(s), {} issue(s)",
            job.id,
            job.status,
            job.processed_records,
            job.total_records,
            job.error_details.len()
        );
        Ok(job)
    }
}
