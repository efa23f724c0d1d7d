// dbvault/src/restore/db_restore.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::JoinHandle;

use crate::config::ConnectionConfig;
use crate::errors::PipelineError;
use crate::utils::find_executable;

/// Maintenance database used for admin connections; never a restore target
/// for destructive operations.
pub const MAINTENANCE_DB: &str = "postgres";

/// A stream of SQL being executed against one database.
pub trait SqlSession: Write + Send {
    /// Closes the input and waits for execution to end; fails on the first
    /// statement error.
    fn finish(self: Box<Self>) -> Result<()>;
}

pub trait SqlApplier: Send + Sync {
    fn begin(&self, connection: &ConnectionConfig) -> Result<Box<dyn SqlSession>>;
}

/// `psql -X -q -v ON_ERROR_STOP=1` reading SQL from stdin. The executable
/// is looked up when a session starts.
pub struct PsqlApplier;

impl PsqlApplier {
    fn command(executable: &Path, connection: &ConnectionConfig) -> Command {
        let mut cmd = Command::new(executable);
        cmd.env("PGPASSWORD", &connection.password)
            .arg("-X") // Do not read psqlrc
            .arg("-q")
            .arg("-v")
            .arg("ON_ERROR_STOP=1") // Exit on first error
            .arg("--no-password")
            .arg("--host")
            .arg(&connection.host)
            .arg("--port")
            .arg(connection.port.to_string())
            .arg("--username")
            .arg(&connection.user)
            .arg("--dbname")
            .arg(&connection.database);
        cmd
    }
}

impl SqlApplier for PsqlApplier {
    fn begin(&self, connection: &ConnectionConfig) -> Result<Box<dyn SqlSession>> {
        let executable = find_executable("psql")?;
        let mut child = Self::command(&executable, connection)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to execute psql for database: {}", connection.database))?;

        let stdin = child.stdin.take().context("psql stdin was not captured")?;
        let stderr = child.stderr.take().map(|mut err| {
            std::thread::spawn(move || {
                let mut text = String::new();
                let _ = err.read_to_string(&mut text);
                text
            })
        });
        Ok(Box::new(PsqlSession {
            database: connection.database.clone(),
            child: Some(child),
            stdin: Some(stdin),
            stderr,
        }))
    }
}

struct PsqlSession {
    database: String,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stderr: Option<JoinHandle<String>>,
}

impl Write for PsqlSession {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.write(buf),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "psql input already closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.flush(),
            None => Ok(()),
        }
    }
}

impl SqlSession for PsqlSession {
    fn finish(mut self: Box<Self>) -> Result<()> {
        drop(self.stdin.take());
        let status = match self.child.take() {
            Some(mut child) => child.wait().context("Failed to wait for psql")?,
            None => return Ok(()),
        };
        let stderr = self
            .stderr
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        if !status.success() {
            return Err(anyhow::anyhow!(
                "psql restore into {} failed with status: {}\nStderr: {}",
                self.database,
                status,
                stderr.trim()
            ));
        }
        if !stderr.trim().is_empty() {
            tracing::debug!("psql stderr: {}", stderr.trim());
        }
        Ok(())
    }
}

impl Drop for PsqlSession {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

pub const REVERIFY_HINT: &str =
    "Re-verify the source backup (checksum, then restore --dry-run) before retrying; the pre-restore backup holds the previous state";

/// Operator guidance for common psql failures. The last hint is always
/// [`REVERIFY_HINT`].
pub fn remediation_hints(error_text: &str) -> Vec<&'static str> {
    let text = error_text.to_ascii_lowercase();
    let mut hints = Vec::new();
    if text.contains("already exists") {
        hints.push("Objects already exist in the target; re-run with --drop to reset the public schema first");
    }
    if text.contains("permission denied") || text.contains("must be owner") {
        hints.push("The restoring role lacks privileges; run as the database owner or a superuser");
    }
    if text.contains("role") && text.contains("does not exist") {
        hints.push("The dump references a role missing on this server; create it or restore a dump taken with --no-owner");
    }
    if text.contains("extension") {
        hints.push("A required extension is unavailable; install it on the server before restoring");
    }
    if text.contains("no space left") || text.contains("could not extend file") {
        hints.push("The server ran out of disk space; free space and retry");
    }
    if text.contains("broken pipe") {
        hints.push("psql stopped reading input; see the psql error above");
    }
    if hints.is_empty() {
        hints.push("Re-run with --verbose for details");
    }
    hints.push(REVERIFY_HINT);
    hints
}

/// Database-level operations needed before SQL is applied.
#[async_trait]
pub trait DatabaseAdmin: Send + Sync {
    async fn database_exists(&self, name: &str) -> Result<bool>;
    async fn create_database(&self, name: &str) -> Result<()>;
    /// `DROP SCHEMA public CASCADE; CREATE SCHEMA public` in `name`.
    async fn reset_public_schema(&self, name: &str) -> Result<()>;
}

/// Admin operations over sqlx connections. Existence checks and creation go
/// through the maintenance database.
pub struct PgAdmin {
    connection: ConnectionConfig,
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl PgAdmin {
    pub fn new(connection: &ConnectionConfig) -> Self {
        Self {
            connection: connection.clone(),
        }
    }

    async fn connect(&self, database: &str) -> Result<PgConnection> {
        let target = self.connection.for_database(database);
        let url = target.url()?;
        PgConnection::connect(url.as_str()).await.map_err(|e| {
            PipelineError::Connection(format!("failed to connect to {}: {}", target.describe(), e)).into()
        })
    }
}

#[async_trait]
impl DatabaseAdmin for PgAdmin {
    async fn database_exists(&self, name: &str) -> Result<bool> {
        let mut conn = self.connect(MAINTENANCE_DB).await?;
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(name)
            .fetch_one(&mut conn)
            .await
            .with_context(|| format!("Failed to check existence of database '{}'", name))?;
        let _ = conn.close().await;
        Ok(exists)
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        if name.eq_ignore_ascii_case(MAINTENANCE_DB) {
            anyhow::bail!("refusing to create the '{}' maintenance database", MAINTENANCE_DB);
        }
        let mut conn = self.connect(MAINTENANCE_DB).await?;
        let mut sql = format!("CREATE DATABASE {}", quote_ident(name));
        if !self.connection.user.is_empty() {
            sql.push_str(&format!(" OWNER {}", quote_ident(&self.connection.user)));
        }
        sqlx::query(&sql)
            .execute(&mut conn)
            .await
            .with_context(|| format!("Failed to create database '{}'", name))?;
        let _ = conn.close().await;
        tracing::info!("Database '{}' created", name);
        Ok(())
    }

    async fn reset_public_schema(&self, name: &str) -> Result<()> {
        if name.eq_ignore_ascii_case(MAINTENANCE_DB) {
            anyhow::bail!("refusing to drop the public schema of the '{}' maintenance database", MAINTENANCE_DB);
        }
        let mut conn = self.connect(name).await?;
        sqlx::query("DROP SCHEMA IF EXISTS public CASCADE")
            .execute(&mut conn)
            .await
            .with_context(|| format!("Failed to drop schema public in '{}'", name))?;
        sqlx::query("CREATE SCHEMA public")
            .execute(&mut conn)
            .await
            .with_context(|| format!("Failed to recreate schema public in '{}'", name))?;
        let _ = conn.close().await;
        tracing::info!("Schema public of '{}' dropped and recreated", name);
        Ok(())
    }
}
