mod logic;
pub(crate) mod s3_upload;
pub(crate) mod archive;
pub(crate) mod db_dump;

use chrono::NaiveDateTime;

use crate::config::BackupJob;
use crate::errors::Result;

pub use logic::BackupReport;

/// Public entry point for the backup process.
/// Wires the real `pg_dump` producer and S3 store into the pipeline.
pub async fn run_backup_flow(job: &BackupJob, started_at: NaiveDateTime) -> Result<BackupReport> {
    let store = s3_upload::S3Store::connect(&job.storage).await;
    logic::perform_backup_orchestration(job, started_at, &db_dump::PgDump, &store).await
}
