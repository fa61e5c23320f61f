use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to launch dump utility '{program}': {reason}")]
    DumpLaunchFailed { program: String, reason: String },

    #[error("Dump utility exited with {status}: {stderr}")]
    DumpFailed { status: String, stderr: String },

    #[error("I/O error while {context}: {source}")]
    IoFailure {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Upload of {path} to s3://{bucket}/{key} failed: {message}")]
    UploadFailed {
        path: PathBuf,
        bucket: String,
        key: String,
        message: String,
    },

    // The upload itself already succeeded when this is raised.
    #[error("Backup uploaded as '{key}', but local copy {path} could not be removed: {source}")]
    CleanupFailed {
        path: PathBuf,
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl BackupError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BackupError::IoFailure {
            context: context.into(),
            source,
        }
    }

    /// Process exit code for the stage that failed.
    ///
    /// 1 means no backup was produced, 2 means a backup exists locally but
    /// was not shipped, 3 means it was shipped but the local copy remains.
    pub fn exit_code(&self) -> u8 {
        match self {
            BackupError::DumpLaunchFailed { .. }
            | BackupError::DumpFailed { .. }
            | BackupError::IoFailure { .. } => 1,
            BackupError::UploadFailed { .. } => 2,
            BackupError::CleanupFailed { .. } => 3,
            BackupError::Config(_) => 78,
        }
    }

    /// Final line shown to the operator. A cleanup failure is only a warning:
    /// the backup is already off-host.
    pub fn operator_message(&self) -> String {
        match self {
            BackupError::CleanupFailed { .. } => format!("⚠️  {}", self),
            _ => format!("❌ Backup failed: {}", self),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
