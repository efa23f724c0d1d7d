// dbvault/src/backup/db_dump.rs
use anyhow::{Context, Result};
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;

use crate::config::ConnectionConfig;
use crate::utils::find_executable;

/// Plain-SQL output of a running dump producer.
pub trait DumpStream: Read + Send {
    /// Waits for the producer and fails if it did not exit cleanly.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Produces a logical, plain-text dump of one database.
pub trait Dumper: Send + Sync {
    fn open(&self, connection: &ConnectionConfig, schema_only: bool) -> Result<Box<dyn DumpStream>>;

    /// Version string recorded in artifact metadata.
    fn version(&self) -> String;
}

/// `pg_dump --format=plain --no-owner --no-privileges`, streamed from stdout.
pub struct PgDump {
    executable: PathBuf,
}

impl PgDump {
    pub fn locate() -> Result<Self> {
        Ok(Self {
            executable: find_executable("pg_dump")?,
        })
    }

    fn command(&self, connection: &ConnectionConfig, schema_only: bool) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.env("PGPASSWORD", &connection.password)
            .arg("--host")
            .arg(&connection.host)
            .arg("--port")
            .arg(connection.port.to_string())
            .arg("--username")
            .arg(&connection.user)
            .arg("--dbname")
            .arg(&connection.database)
            .arg("--format=plain")
            .arg("--no-owner")
            .arg("--no-privileges")
            .arg("--no-password");
        if schema_only {
            cmd.arg("--schema-only");
        }
        cmd
    }
}

impl Dumper for PgDump {
    fn open(&self, connection: &ConnectionConfig, schema_only: bool) -> Result<Box<dyn DumpStream>> {
        tracing::debug!(
            "Running {} for {} (schema only: {})",
            self.executable.display(),
            connection.describe(),
            schema_only
        );
        let mut child = self
            .command(connection, schema_only)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to execute pg_dump for database: {}", connection.database))?;

        let stdout = child.stdout.take().context("pg_dump stdout was not captured")?;
        let stderr = child.stderr.take().map(|mut err| {
            std::thread::spawn(move || {
                let mut text = String::new();
                let _ = err.read_to_string(&mut text);
                text
            })
        });

        Ok(Box::new(PgDumpStream {
            database: connection.database.clone(),
            child: Some(child),
            stdout: Some(stdout),
            stderr,
        }))
    }

    fn version(&self) -> String {
        Command::new(&self.executable)
            .arg("--version")
            .output()
            .ok()
            .filter(|out| out.status.success())
            .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

struct PgDumpStream {
    database: String,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    stderr: Option<JoinHandle<String>>,
}

impl Read for PgDumpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stdout.as_mut() {
            Some(out) => out.read(buf),
            None => Ok(0),
        }
    }
}

impl DumpStream for PgDumpStream {
    fn finish(mut self: Box<Self>) -> Result<()> {
        drop(self.stdout.take());
        let status = match self.child.take() {
            Some(mut child) => child.wait().context("Failed to wait for pg_dump")?,
            None => return Ok(()),
        };
        let stderr = self
            .stderr
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        if !status.success() {
            return Err(anyhow::anyhow!(
                "pg_dump for database {} failed with status: {}\nStderr: {}",
                self.database,
                status,
                stderr.trim()
            ));
        }
        if !stderr.trim().is_empty() {
            tracing::debug!("pg_dump stderr: {}", stderr.trim());
        }
        Ok(())
    }
}

impl Drop for PgDumpStream {
    fn drop(&mut self) {
        // Abandoned before finish(): do not leave the producer running.
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
