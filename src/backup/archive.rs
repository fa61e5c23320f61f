// pgdump-s3-backup/src/backup/archive.rs
use chrono::NaiveDateTime;
use flate2::{Compression, GzBuilder};
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::errors::{BackupError, Result};

/// Upper bound on how much of the dump is held in memory at once.
pub const CHUNK_SIZE: usize = 64 * 1024;
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
pub const ARTIFACT_EXTENSION: &str = ".sql.gz";

/// `<database>_backup_<YYYY-MM-DD_HH-MM-SS>.sql.gz`
pub fn artifact_file_name(database_name: &str, started_at: &NaiveDateTime) -> String {
    format!(
        "{}_backup_{}{}",
        database_name,
        started_at.format(TIMESTAMP_FORMAT),
        ARTIFACT_EXTENSION
    )
}

/// The compressed dump written to the staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub file_name: String,
    pub local_path: PathBuf,
    /// Uncompressed bytes read from the dump.
    pub raw_bytes: u64,
    pub compressed_bytes: u64,
    /// Number of non-empty reads taken from the source.
    pub chunks: u64,
}

/// Streams `source` through gzip into `<staging_dir>/<file_name>`.
///
/// The source is consumed in reads of at most [`CHUNK_SIZE`] bytes, so memory
/// use does not grow with the size of the dump. The staging directory is
/// created (with parents) when missing and an existing file is overwritten.
pub fn compress_stream_to_gzip<R: Read + ?Sized>(
    source: &mut R,
    staging_dir: &Path,
    file_name: &str,
    compression_level: u32,
) -> Result<BackupArtifact> {
    if !staging_dir.exists() {
        fs::create_dir_all(staging_dir).map_err(|e| {
            BackupError::io(
                format!("creating staging directory {}", staging_dir.display()),
                e,
            )
        })?;
    }
    let local_path = staging_dir.join(file_name);
    debug!("Writing compressed dump to {}", local_path.display());

    let file = File::create(&local_path)
        .map_err(|e| BackupError::io(format!("creating {}", local_path.display()), e))?;
    let inner_name = file_name.strip_suffix(".gz").unwrap_or(file_name);
    let mut encoder = GzBuilder::new()
        .filename(inner_name)
        .write(BufWriter::new(file), Compression::new(compression_level));

    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut raw_bytes = 0u64;
    let mut chunks = 0u64;
    loop {
        let bytes_read = match source.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(BackupError::io("reading dump output", e)),
        };
        encoder
            .write_all(&buffer[..bytes_read])
            .map_err(|e| BackupError::io(format!("writing {}", local_path.display()), e))?;
        raw_bytes += bytes_read as u64;
        chunks += 1;
    }

    let writer = encoder
        .finish()
        .map_err(|e| BackupError::io(format!("finishing gzip stream for {}", local_path.display()), e))?;
    let file = writer
        .into_inner()
        .map_err(|e| BackupError::io(format!("flushing {}", local_path.display()), e.into_error()))?;
    file.sync_all()
        .map_err(|e| BackupError::io(format!("syncing {}", local_path.display()), e))?;

    let compressed_bytes = fs::metadata(&local_path)
        .map_err(|e| BackupError::io(format!("reading metadata of {}", local_path.display()), e))?
        .len();

    info!(
        "Compressed {} bytes in {} chunks to {} bytes",
        raw_bytes, chunks, compressed_bytes
    );

    Ok(BackupArtifact {
        file_name: file_name.to_string(),
        local_path,
        raw_bytes,
        compressed_bytes,
        chunks,
    })
}
