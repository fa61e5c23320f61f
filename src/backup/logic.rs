use chrono::NaiveDateTime;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::backup::archive::{BackupArtifact, artifact_file_name, compress_stream_to_gzip};
use crate::backup::db_dump::DumpSource;
use crate::backup::s3_upload::{ObjectStore, upload_artifact};
use crate::config::BackupJob;
use crate::errors::{BackupError, Result};

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub artifact: BackupArtifact,
    pub bucket: String,
    pub object_key: String,
    pub local_copy_removed: bool,
}

/// Dumps the database and compresses the output into the staging directory.
///
/// On a failed dump the partially written file is left in place.
pub fn create_backup<D: DumpSource + ?Sized>(
    job: &BackupJob,
    file_name: &str,
    dump: &D,
) -> Result<BackupArtifact> {
    info!("🔄 Creating backup for database '{}'...", job.database.name);

    let mut stream = dump.spawn(&job.database)?;
    let written = compress_stream_to_gzip(
        &mut *stream,
        &job.local_backup_dir,
        file_name,
        job.compression_level,
    );
    // Always reap the child, even when writing failed.
    let finished = stream.finish();

    match (written, finished) {
        (Ok(artifact), Ok(())) => {
            info!("✅ Backup file created: {}", artifact.local_path.display());
            Ok(artifact)
        }
        (Ok(artifact), Err(e)) => {
            warn!(
                "Dump failed; leaving partial file {} for diagnosis",
                artifact.local_path.display()
            );
            Err(e)
        }
        (Err(e), _) => Err(e),
    }
}

/// Removes the local artifact when `delete_local` is set. Returns whether it was removed.
pub fn clean_up(local_path: &Path, delete_local: bool, object_key: &str) -> Result<bool> {
    if !delete_local {
        info!("Keeping local backup file {}", local_path.display());
        return Ok(false);
    }
    fs::remove_file(local_path).map_err(|source| BackupError::CleanupFailed {
        path: local_path.to_path_buf(),
        key: object_key.to_string(),
        source,
    })?;
    info!("🧹 Local backup file removed.");
    Ok(true)
}

/// Dump, compress, upload, clean up. Each step runs only if the previous one succeeded.
pub async fn perform_backup_orchestration<D, S>(
    job: &BackupJob,
    started_at: NaiveDateTime,
    dump: &D,
    store: &S,
) -> Result<BackupReport>
where
    D: DumpSource + ?Sized,
    S: ObjectStore + ?Sized,
{
    let file_name = artifact_file_name(&job.database.name, &started_at);
    let artifact = create_backup(job, &file_name, dump)?;

    let object_key = job.object_key(&artifact.file_name);
    upload_artifact(
        store,
        &artifact.local_path,
        &job.storage.bucket_name,
        &object_key,
        job.storage.storage_class.as_deref(),
    )
    .await?;

    let local_copy_removed = clean_up(
        &artifact.local_path,
        job.delete_local_after_upload,
        &object_key,
    )?;

    Ok(BackupReport {
        artifact,
        bucket: job.storage.bucket_name.clone(),
        object_key,
        local_copy_removed,
    })
}
