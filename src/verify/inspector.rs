// dbvault/src/verify/inspector.rs
//
// Catalog queries behind the verification checks. Everything is read-only.
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::time::Duration;

use crate::config::ConnectionConfig;
use crate::errors::PipelineError;

/// Tables that record applied schema migrations, in lookup order. Each has a
/// `version` column.
pub const MIGRATION_MARKERS: [&str; 4] = [
    "_sqlx_migrations",
    "schema_migrations",
    "__diesel_schema_migrations",
    "flyway_schema_history",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationMarker {
    pub table: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSize {
    pub bytes: u64,
    pub pretty: String,
    pub encoding: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionUsage {
    pub active: u64,
    pub max: u64,
}

/// Read-only facts about one live database (tables are in schema `public`).
#[async_trait]
pub trait DatabaseInspector: Send + Sync {
    async fn server_version(&self) -> Result<String>;
    async fn migration_marker(&self) -> Result<Option<MigrationMarker>>;
    /// Base table names, sorted.
    async fn tables(&self) -> Result<Vec<String>>;
    async fn rls_policy_count(&self) -> Result<u64>;
    async fn rls_enabled_table_count(&self) -> Result<u64>;
    async fn index_count(&self) -> Result<u64>;
    async fn tables_without_primary_key(&self) -> Result<Vec<String>>;
    async fn foreign_key_count(&self) -> Result<u64>;
    async fn tables_with_column(&self, column: &str) -> Result<Vec<String>>;
    /// Rows of `child` whose `column` names no row of `parent.id`.
    async fn orphan_count(&self, child: &str, column: &str, parent: &str) -> Result<u64>;
    async fn database_size(&self) -> Result<DatabaseSize>;
    async fn connection_usage(&self) -> Result<ConnectionUsage>;
    async fn never_analyzed_tables(&self) -> Result<Vec<String>>;
}

/// Opens an inspector for a database; the restore pipeline uses this to
/// verify a freshly restored target.
#[async_trait]
pub trait InspectorConnector: Send + Sync {
    async fn connect(&self, connection: &ConnectionConfig) -> Result<Box<dyn DatabaseInspector>>;
}

pub struct PgConnector;

#[async_trait]
impl InspectorConnector for PgConnector {
    async fn connect(&self, connection: &ConnectionConfig) -> Result<Box<dyn DatabaseInspector>> {
        Ok(Box::new(PgInspector::connect(connection).await?))
    }
}

pub struct PgInspector {
    pool: Pool<Postgres>,
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl PgInspector {
    pub async fn connect(connection: &ConnectionConfig) -> Result<Self> {
        let url = connection.url()?;
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url.as_str())
            .await
            .map_err(|e| {
                PipelineError::Connection(format!("failed to connect to {}: {}", connection.describe(), e))
            })?;
        Ok(Self { pool })
    }

    async fn count(&self, sql: &str, what: &str) -> Result<u64> {
        let n: i64 = sqlx::query_scalar(sql)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Failed to count {}", what))?;
        Ok(n.max(0) as u64)
    }

    async fn names(&self, sql: &str, what: &str) -> Result<Vec<String>> {
        sqlx::query_scalar(sql)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to list {}", what))
    }
}

#[async_trait]
impl DatabaseInspector for PgInspector {
    async fn server_version(&self) -> Result<String> {
        sqlx::query_scalar("SELECT version()")
            .fetch_one(&self.pool)
            .await
            .context("Failed to read server version")
    }

    async fn migration_marker(&self) -> Result<Option<MigrationMarker>> {
        let present: Vec<String> = sqlx::query_scalar(
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_name = ANY($1)",
        )
        .bind(MIGRATION_MARKERS.iter().map(|m| m.to_string()).collect::<Vec<_>>())
        .fetch_all(&self.pool)
        .await
        .context("Failed to look for migration tables")?;

        let Some(table) = MIGRATION_MARKERS
            .iter()
            .find(|m| present.iter().any(|p| p == *m))
        else {
            return Ok(None);
        };
        let version: Option<String> = sqlx::query_scalar(&format!(
            "SELECT MAX(version)::text FROM public.{}",
            quote_ident(table)
        ))
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to read migration version from {}", table))?;
        Ok(Some(MigrationMarker {
            table: table.to_string(),
            version,
        }))
    }

    async fn tables(&self) -> Result<Vec<String>> {
        self.names(
            "SELECT tablename::text FROM pg_catalog.pg_tables WHERE schemaname = 'public' ORDER BY 1",
            "tables",
        )
        .await
    }

    async fn rls_policy_count(&self) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM pg_catalog.pg_policies WHERE schemaname = 'public'",
            "row level security policies",
        )
        .await
    }

    async fn rls_enabled_table_count(&self) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM pg_catalog.pg_class c \
             JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = 'public' AND c.relkind = 'r' AND c.relrowsecurity",
            "tables with row level security",
        )
        .await
    }

    async fn index_count(&self) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM pg_catalog.pg_indexes WHERE schemaname = 'public'",
            "indexes",
        )
        .await
    }

    async fn tables_without_primary_key(&self) -> Result<Vec<String>> {
        self.names(
            "SELECT c.relname::text FROM pg_catalog.pg_class c \
             JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = 'public' AND c.relkind = 'r' \
             AND NOT EXISTS (SELECT 1 FROM pg_catalog.pg_constraint k \
                             WHERE k.conrelid = c.oid AND k.contype = 'p') \
             ORDER BY 1",
            "tables without a primary key",
        )
        .await
    }

    async fn foreign_key_count(&self) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM pg_catalog.pg_constraint k \
             JOIN pg_catalog.pg_namespace n ON n.oid = k.connamespace \
             WHERE n.nspname = 'public' AND k.contype = 'f'",
            "foreign keys",
        )
        .await
    }

    async fn tables_with_column(&self, column: &str) -> Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT c.table_name::text FROM information_schema.columns c \
             JOIN information_schema.tables t \
               ON t.table_schema = c.table_schema AND t.table_name = c.table_name \
             WHERE c.table_schema = 'public' AND c.column_name = $1 AND t.table_type = 'BASE TABLE' \
             ORDER BY 1",
        )
        .bind(column)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to find tables with column {}", column))
    }

    async fn orphan_count(&self, child: &str, column: &str, parent: &str) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM public.{child} c WHERE c.{col} IS NOT NULL \
             AND NOT EXISTS (SELECT 1 FROM public.{parent} p WHERE p.id = c.{col})",
            child = quote_ident(child),
            col = quote_ident(column),
            parent = quote_ident(parent),
        );
        self.count(&sql, &format!("orphaned rows in {}", child)).await
    }

    async fn database_size(&self) -> Result<DatabaseSize> {
        let (bytes, pretty, encoding): (i64, String, String) = sqlx::query_as(
            "SELECT pg_database_size(current_database()), \
                    pg_size_pretty(pg_database_size(current_database())), \
                    pg_encoding_to_char(encoding)::text \
             FROM pg_catalog.pg_database WHERE datname = current_database()",
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to read database size")?;
        Ok(DatabaseSize {
            bytes: bytes.max(0) as u64,
            pretty,
            encoding,
        })
    }

    async fn connection_usage(&self) -> Result<ConnectionUsage> {
        let active = self
            .count("SELECT COUNT(*) FROM pg_catalog.pg_stat_activity", "connections")
            .await?;
        let max: String = sqlx::query_scalar("SHOW max_connections")
            .fetch_one(&self.pool)
            .await
            .context("Failed to read max_connections")?;
        Ok(ConnectionUsage {
            active,
            max: max.trim().parse().unwrap_or(0),
        })
    }

    async fn never_analyzed_tables(&self) -> Result<Vec<String>> {
        self.names(
            "SELECT relname::text FROM pg_catalog.pg_stat_user_tables \
             WHERE schemaname = 'public' AND last_analyze IS NULL AND last_autoanalyze IS NULL \
             ORDER BY 1",
            "never analysed tables",
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
