// pgdump-s3-backup/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use url::Url;

use crate::errors::BackupError;

pub const DEFAULT_CONFIG_PATH: &str = "config.json";
pub const DEFAULT_BACKUP_DIR: &str = "/tmp/db_backups";
pub const DEFAULT_DUMP_PROGRAM: &str = "pg_dump";
pub const DEFAULT_STORAGE_CLASS: &str = "STANDARD_IA";
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JsonDatabaseConfig {
    pub name: Option<String>,
    pub user: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dump_program: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
    pub storage_class: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawJsonConfig {
    pub database: JsonDatabaseConfig,
    pub s3_storage: JsonS3StorageConfig,
    pub local_backup_dir: Option<PathBuf>,
    pub delete_local_after_upload: Option<bool>,
    pub compression_level: Option<u32>,
}

// Application's internal configuration structs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub name: String,
    pub user: String,
    pub host: String,
    pub port: Option<u16>,
    pub dump_program: String,
}

#[derive(Clone, PartialEq, Eq)]
pub struct StaticCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub bucket_name: String,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    /// When absent the default AWS credential chain is used.
    pub credentials: Option<StaticCredentials>,
    pub folder_prefix: Option<String>,
    pub storage_class: Option<String>,
}

/// Everything one backup run needs. Built once at startup and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupJob {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub local_backup_dir: PathBuf,
    pub delete_local_after_upload: bool,
    pub compression_level: u32,
}

impl BackupJob {
    /// Destination key for an artifact, honouring the optional folder prefix.
    pub fn object_key(&self, file_name: &str) -> String {
        match &self.storage.folder_prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), file_name),
            None => file_name.to_string(),
        }
    }
}

/// Reads config.json. A missing file is tolerated unless the path was given explicitly.
pub fn load_raw_config(config_path: &Path, required: bool) -> Result<RawJsonConfig> {
    if !config_path.exists() && !required {
        debug!("Config file not found at {}, relying on environment", config_path.display());
        return Ok(RawJsonConfig::default());
    }

    info!("Loading configuration from {}", config_path.display());
    let config_content = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
    let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content).with_context(|| {
        format!(
            "Failed to parse JSON from config file at {}",
            config_path.display()
        )
    })?;
    Ok(raw_json_config)
}

/// Overlays `BACKUP_*` environment variables on top of the file values.
pub fn apply_env_overrides<F>(raw: &mut RawJsonConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(v) = var("BACKUP_DB_NAME") {
        raw.database.name = Some(v);
    }
    if let Some(v) = var("BACKUP_DB_USER") {
        raw.database.user = Some(v);
    }
    if let Some(v) = var("BACKUP_DB_HOST") {
        raw.database.host = Some(v);
    }
    if let Some(v) = var("BACKUP_DB_PORT") {
        let port = v
            .trim()
            .parse::<u16>()
            .with_context(|| format!("BACKUP_DB_PORT is not a valid port: {}", v))?;
        raw.database.port = Some(port);
    }
    if let Some(v) = var("BACKUP_DUMP_PROGRAM") {
        raw.database.dump_program = Some(v);
    }
    if let Some(v) = var("BACKUP_S3_BUCKET") {
        raw.s3_storage.bucket_name = Some(v);
    }
    if let Some(v) = var("BACKUP_S3_REGION") {
        raw.s3_storage.region = Some(v);
    }
    if let Some(v) = var("BACKUP_S3_ENDPOINT_URL") {
        raw.s3_storage.endpoint_url = Some(v);
    }
    if let Some(v) = var("BACKUP_S3_ACCESS_KEY_ID") {
        raw.s3_storage.access_key_id = Some(v);
    }
    if let Some(v) = var("BACKUP_S3_SECRET_ACCESS_KEY") {
        raw.s3_storage.secret_access_key = Some(v);
    }
    if let Some(v) = var("BACKUP_S3_PREFIX") {
        raw.s3_storage.folder_prefix = Some(v);
    }
    if let Some(v) = var("BACKUP_S3_STORAGE_CLASS") {
        raw.s3_storage.storage_class = Some(v);
    }
    if let Some(v) = var("BACKUP_DIR") {
        raw.local_backup_dir = Some(PathBuf::from(v));
    }
    if let Some(v) = var("BACKUP_DELETE_LOCAL") {
        raw.delete_local_after_upload = Some(parse_flag(&v).with_context(|| {
            format!("BACKUP_DELETE_LOCAL must be true/false, got: {}", v)
        })?);
    }
    if let Some(v) = var("BACKUP_COMPRESSION_LEVEL") {
        let level = v
            .trim()
            .parse::<u32>()
            .with_context(|| format!("BACKUP_COMPRESSION_LEVEL is not a number: {}", v))?;
        raw.compression_level = Some(level);
    }
    Ok(())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn required(value: &Option<String>, field: &str) -> Result<String, BackupError> {
    value
        .as_ref()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| BackupError::Config(format!("{} must be set and non-empty", field)))
}

fn optional(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Validates the merged raw configuration into a [`BackupJob`].
pub fn load_backup_job(raw_config: &RawJsonConfig) -> Result<BackupJob, BackupError> {
    let db = &raw_config.database;
    let name = required(&db.name, "database.name")?;
    if name.contains(|c: char| !c.is_alphanumeric() && c != '_' && c != '-') {
        return Err(BackupError::Config(format!(
            "Invalid character in database name: {:?}. Only alphanumerics, '_' and '-' are allowed.",
            name
        )));
    }
    // pg_dump takes the name as a bare positional, so a leading dash would parse as an option.
    if name.starts_with('-') {
        return Err(BackupError::Config(format!(
            "Database name must not start with '-': {:?}",
            name
        )));
    }

    let database = DatabaseConfig {
        name,
        user: required(&db.user, "database.user")?,
        host: required(&db.host, "database.host")?,
        port: db.port,
        dump_program: optional(&db.dump_program).unwrap_or_else(|| DEFAULT_DUMP_PROGRAM.to_string()),
    };

    let s3_raw = &raw_config.s3_storage;
    let endpoint_url = optional(&s3_raw.endpoint_url);
    if let Some(endpoint) = &endpoint_url {
        Url::parse(endpoint).map_err(|e| {
            BackupError::Config(format!("s3_storage.endpoint_url is not a valid URL ({}): {}", endpoint, e))
        })?;
    }

    let credentials = match (optional(&s3_raw.access_key_id), optional(&s3_raw.secret_access_key)) {
        (Some(access_key_id), Some(secret_access_key)) => Some(StaticCredentials {
            access_key_id,
            secret_access_key,
        }),
        (None, None) => None,
        _ => {
            warn!("Only one of access_key_id/secret_access_key is set; falling back to the default AWS credential chain");
            None
        }
    };

    let storage = StorageConfig {
        bucket_name: required(&s3_raw.bucket_name, "s3_storage.bucket_name")?,
        region: optional(&s3_raw.region),
        endpoint_url,
        credentials,
        folder_prefix: optional(&s3_raw.folder_prefix)
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty()),
        storage_class: Some(
            optional(&s3_raw.storage_class).unwrap_or_else(|| DEFAULT_STORAGE_CLASS.to_string()),
        ),
    };

    let local_backup_dir = raw_config
        .local_backup_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BACKUP_DIR));
    if local_backup_dir.as_os_str().is_empty() {
        return Err(BackupError::Config("local_backup_dir cannot be empty".to_string()));
    }

    let compression_level = raw_config.compression_level.unwrap_or(DEFAULT_COMPRESSION_LEVEL);
    if compression_level > 9 {
        return Err(BackupError::Config(format!(
            "compression_level must be between 0 and 9, got {}",
            compression_level
        )));
    }

    Ok(BackupJob {
        database,
        storage,
        local_backup_dir,
        delete_local_after_upload: raw_config.delete_local_after_upload.unwrap_or(true),
        compression_level,
    })
}
