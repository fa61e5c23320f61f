//! Scheduled PostgreSQL Backup Tool
//!
//! Dumps one database with pg_dump, gzips it into a staging directory,
//! ships it to S3 and optionally removes the local copy.

// pgdump-s3-backup/src/main.rs
mod backup;
mod config;
mod errors;
mod log;

use anyhow::{Context, Result};
use chrono::Local;
use config::{BackupJob, DEFAULT_CONFIG_PATH};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

const CONFIG_EXIT_CODE: u8 = 78;

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    // Sampled once so the artifact name matches every log line of the run.
    let started_at = Local::now().naive_local();
    dotenv::dotenv().ok();
    log::init();

    let job = match load_job() {
        Ok(job) => job,
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            return ExitCode::from(CONFIG_EXIT_CODE);
        }
    };

    match backup::run_backup_flow(&job, started_at).await {
        Ok(report) => {
            println!(
                "✅ Backup completed: {} bytes dumped in {} chunks, {} bytes stored at s3://{}/{}{}",
                report.artifact.raw_bytes,
                report.artifact.chunks,
                report.artifact.compressed_bytes,
                report.bucket,
                report.object_key,
                if report.local_copy_removed { "" } else { " (local copy kept)" }
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e.operator_message());
            ExitCode::from(e.exit_code())
        }
    }
}

/// Resolves the config file (first CLI argument, then `BACKUP_CONFIG`, then
/// `config.json`) and overlays the environment.
fn load_job() -> Result<BackupJob> {
    let (config_path, explicit) = match env::args().nth(1).or_else(|| env::var("BACKUP_CONFIG").ok()) {
        Some(path) => (PathBuf::from(path), true),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };

    let mut raw_config = config::load_raw_config(&config_path, explicit)
        .context(format!("Failed to load configuration from {}", config_path.display()))?;
    config::apply_env_overrides(&mut raw_config, |name| env::var(name).ok())
        .context("Failed to apply environment overrides")?;
    let job = config::load_backup_job(&raw_config).context("Invalid backup configuration")?;

    info!(
        "Backing up '{}' on {} as {} to bucket {}",
        job.database.name, job.database.host, job.database.user, job.storage.bucket_name
    );
    Ok(job)
}
