// pgdump-s3-backup/src/backup/db_dump.rs
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;
use tracing::{debug, info};
use which::which;

use crate::config::DatabaseConfig;
use crate::errors::{BackupError, Result};

/// Live output of a running dump.
///
/// Reading yields the raw, uncompressed dump. Once the reader returns EOF,
/// `finish` reaps the producer and turns a non-zero exit into
/// [`BackupError::DumpFailed`].
pub trait DumpStream: Read + Send {
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Something that can start a dump of a database.
pub trait DumpSource {
    fn spawn(&self, database: &DatabaseConfig) -> Result<Box<dyn DumpStream>>;
}

/// Runs `pg_dump` (or the configured replacement) as a child process.
#[derive(Debug, Default, Clone, Copy)]
pub struct PgDump;

// Helper function to find the dump executable
fn find_dump_executable(program: &str) -> Result<PathBuf> {
    which(program).map_err(|e| BackupError::DumpLaunchFailed {
        program: program.to_string(),
        reason: format!(
            "executable not found in PATH ({}). Please ensure PostgreSQL client tools are installed.",
            e
        ),
    })
}

pub fn pg_dump_args(database: &DatabaseConfig) -> Vec<String> {
    let mut args = vec![
        "-U".to_string(),
        database.user.clone(),
        "-h".to_string(),
        database.host.clone(),
    ];
    if let Some(port) = database.port {
        args.push("-p".to_string());
        args.push(port.to_string());
    }
    args.push(database.name.clone());
    args
}

impl DumpSource for PgDump {
    fn spawn(&self, database: &DatabaseConfig) -> Result<Box<dyn DumpStream>> {
        let program_path = find_dump_executable(&database.dump_program)?;
        debug!("Found dump executable at: {}", program_path.display());

        let mut child = Command::new(&program_path)
            .args(pg_dump_args(database))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BackupError::DumpLaunchFailed {
                program: program_path.display().to_string(),
                reason: e.to_string(),
            })?;

        let launch_failed = |reason: &str| BackupError::DumpLaunchFailed {
            program: program_path.display().to_string(),
            reason: reason.to_string(),
        };
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                return Err(launch_failed("stdout was not captured"));
            }
        };
        let mut stderr = match child.stderr.take() {
            Some(stderr) => stderr,
            None => {
                let _ = child.kill();
                return Err(launch_failed("stderr was not captured"));
            }
        };

        // Drained separately so a full stderr pipe cannot stall stdout.
        let stderr_reader = std::thread::spawn(move || {
            let mut captured = Vec::new();
            stderr.read_to_end(&mut captured).map(|_| captured)
        });

        info!(
            "Started {} for database '{}' (pid {})",
            database.dump_program,
            database.name,
            child.id()
        );

        Ok(Box::new(PgDumpStream {
            child,
            stdout,
            stderr_reader,
        }))
    }
}

struct PgDumpStream {
    child: Child,
    stdout: ChildStdout,
    stderr_reader: JoinHandle<io::Result<Vec<u8>>>,
}

impl Read for PgDumpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl DumpStream for PgDumpStream {
    fn finish(self: Box<Self>) -> Result<()> {
        let PgDumpStream {
            mut child,
            stdout,
            stderr_reader,
        } = *self;
        // Closing our end unblocks a producer we stopped reading early.
        drop(stdout);

        let status = child
            .wait()
            .map_err(|e| BackupError::io("waiting for the dump process to exit", e))?;
        let stderr = match stderr_reader.join() {
            Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).trim().to_string(),
            Ok(Err(e)) => format!("<stderr unavailable: {}>", e),
            Err(_) => "<stderr reader panicked>".to_string(),
        };

        if !status.success() {
            return Err(BackupError::DumpFailed {
                status: status.to_string(),
                stderr,
            });
        }
        if !stderr.is_empty() {
            debug!("Dump utility stderr: {}", stderr);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn database(program: &str) -> DatabaseConfig {
        DatabaseConfig {
            name: "orders".to_string(),
            user: "backup".to_string(),
            host: "db.internal".to_string(),
            port: None,
            dump_program: program.to_string(),
        }
    }

    #[test]
    fn test_pg_dump_args() {
        let mut db = database("pg_dump");
        assert_eq!(pg_dump_args(&db), vec!["-U", "backup", "-h", "db.internal", "orders"]);

        db.port = Some(5433);
        assert_eq!(
            pg_dump_args(&db),
            vec!["-U", "backup", "-h", "db.internal", "-p", "5433", "orders"]
        );
    }

    #[test]
    fn test_missing_program_is_launch_failure() {
        let result = PgDump.spawn(&database("definitely-not-a-real-dump-tool-7f3a"));
        match result {
            Err(BackupError::DumpLaunchFailed { program, reason }) => {
                assert_eq!(program, "definitely-not-a-real-dump-tool-7f3a");
                assert!(reason.contains("not found"));
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("spawn should have failed"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_real_process_dumps() -> anyhow::Result<()> {
        let _guard = test_support::process_lock();
        let dir = tempfile::tempdir()?;
        let ok_script =
            test_support::write_dump_script(dir.path(), "ok_dump.sh", r#"printf 'SELECT 1;'; echo "notice" >&2"#)?;
        let args_script = test_support::write_dump_script(dir.path(), "args_dump.sh", r#"printf '%s ' "$@""#)?;
        let failing_script = test_support::write_dump_script(
            dir.path(),
            "failing_dump.sh",
            r#"printf 'partial'; echo 'pg_dump: error: connection to server failed' >&2; exit 1"#,
        )?;

        let mut stream = PgDump.spawn(&database(&ok_script))?;
        let mut output = Vec::new();
        stream.read_to_end(&mut output)?;
        stream.finish()?;
        assert_eq!(output, b"SELECT 1;");

        let mut stream = PgDump.spawn(&database(&args_script))?;
        let mut output = String::new();
        stream.read_to_string(&mut output)?;
        stream.finish()?;
        assert_eq!(output, "-U backup -h db.internal orders ");

        let mut stream = PgDump.spawn(&database(&failing_script))?;
        let mut output = Vec::new();
        stream.read_to_end(&mut output)?;
        assert_eq!(output, b"partial");
        match stream.finish() {
            Err(BackupError::DumpFailed { stderr, .. }) => {
                assert_eq!(stderr, "pg_dump: error: connection to server failed");
            }
            other => panic!("expected DumpFailed, got {:?}", other),
        }
        Ok(())
    }
}
