//! Structural and statistical checks against a live database.

pub mod inspector;
pub mod report;

use anyhow::Result;
use std::collections::BTreeSet;
use std::path::Path;

use crate::config::VerifyConfig;
use crate::dump::analyze_artifact;
use crate::errors::PipelineError;
use inspector::{DatabaseInspector, PgInspector};
pub use report::{CheckResult, CheckStatus, VerificationReport};

/// Parent table and link column used by the orphaned reference scan.
pub const ORPHAN_PARENT: &str = "tenants";
pub const ORPHAN_LINK_COLUMN: &str = "tenant_id";
/// The inspector only reports tables of this schema.
pub const LIVE_SCHEMA: &str = "public";
/// Connection usage at or above this share of `max_connections` warns.
pub const CONNECTION_WARN_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// Table and row level security checks only.
    Quick,
    Full,
}

pub struct VerificationEngine<'a> {
    inspector: &'a dyn DatabaseInspector,
    database: String,
    core_tables: Vec<String>,
}

impl<'a> VerificationEngine<'a> {
    pub fn new(inspector: &'a dyn DatabaseInspector, database: &str, core_tables: &[String]) -> Self {
        Self {
            inspector,
            database: database.to_string(),
            core_tables: core_tables.to_vec(),
        }
    }

    pub async fn run(&self, mode: VerifyMode) -> Result<VerificationReport> {
        let mut report = VerificationReport::new(&self.database);
        if mode == VerifyMode::Full {
            report.push(self.connectivity().await);
            report.push(self.migration_marker().await?);
        }

        let tables = self.inspector.tables().await?;
        report.push(table_count(&tables));
        report.push(self.core_tables(&tables));
        report.push(self.rls_policies().await?);
        report.push(self.rls_enabled_tables().await?);

        if mode == VerifyMode::Full {
            report.push(self.index_count().await?);
            report.push(self.primary_keys().await?);
            report.push(self.foreign_keys().await?);
            report.push(self.orphaned_references(&tables).await?);
            report.push(self.database_size().await?);
            report.push(self.connections().await?);
            report.push(self.statistics().await?);
        }
        Ok(report)
    }

    /// Compares the tables and policy count of a dump with the live database.
    pub async fn compare(&self, artifact: &Path) -> Result<VerificationReport> {
        let path = artifact.to_path_buf();
        let dump = tokio::task::spawn_blocking(move || analyze_artifact(&path))
            .await
            .map_err(|e| anyhow::anyhow!("dump analysis task failed: {}", e))?
            .map_err(|e| PipelineError::BackupFile(format!("{:#}", e)))?;

        let live: BTreeSet<String> = self.inspector.tables().await?.into_iter().collect();
        let dumped = dump.tables_in(LIVE_SCHEMA);
        let elsewhere = dump.tables.len() - dumped.len();
        if elsewhere > 0 {
            tracing::info!("{} dump tables outside schema {} are not compared", elsewhere, LIVE_SCHEMA);
        }
        let mut report = VerificationReport::new(&self.database);

        let missing: Vec<&String> = dumped.difference(&live).collect();
        report.push(if missing.is_empty() {
            CheckResult::pass(
                "compare_missing_tables",
                format!("all {} dump tables in {} present", dumped.len(), LIVE_SCHEMA),
            )
        } else {
            CheckResult::fail("compare_missing_tables", format!("missing in database: {}", join(&missing)))
        });

        let extra: Vec<&String> = live.difference(&dumped).collect();
        report.push(if extra.is_empty() {
            CheckResult::pass("compare_extra_tables", "no tables beyond the dump")
        } else {
            CheckResult::warn("compare_extra_tables", format!("not in dump: {}", join(&extra)))
        });

        let policies = self.inspector.rls_policy_count().await?;
        report.push(if policies == dump.policy_count {
            CheckResult::pass("compare_rls_policies", format!("{} policies", policies))
        } else {
            CheckResult::warn(
                "compare_rls_policies",
                format!("dump has {} policies, database has {}", dump.policy_count, policies),
            )
        });
        Ok(report)
    }

    async fn connectivity(&self) -> CheckResult {
        match self.inspector.server_version().await {
            Ok(version) => CheckResult::pass("connectivity", version),
            Err(e) => CheckResult::fail("connectivity", format!("{:#}", e)),
        }
    }

    async fn migration_marker(&self) -> Result<CheckResult> {
        Ok(match self.inspector.migration_marker().await? {
            Some(marker) => match marker.version {
                Some(version) => CheckResult::pass("migration_marker", format!("{} at {}", marker.table, version)),
                None => CheckResult::warn("migration_marker", format!("{} is empty", marker.table)),
            },
            None => CheckResult::warn("migration_marker", "no migration table found"),
        })
    }

    fn core_tables(&self, tables: &[String]) -> CheckResult {
        let missing: Vec<&String> = self
            .core_tables
            .iter()
            .filter(|t| !tables.contains(t))
            .collect();
        if missing.is_empty() {
            CheckResult::pass("core_tables", format!("present: {}", self.core_tables.join(", ")))
        } else {
            CheckResult::fail("core_tables", format!("missing: {}", join(&missing)))
        }
    }

    async fn rls_policies(&self) -> Result<CheckResult> {
        let n = self.inspector.rls_policy_count().await?;
        Ok(if n > 0 {
            CheckResult::pass("rls_policies", format!("{} policies", n))
        } else {
            CheckResult::warn("rls_policies", "no row level security policies")
        })
    }

    async fn rls_enabled_tables(&self) -> Result<CheckResult> {
        let n = self.inspector.rls_enabled_table_count().await?;
        Ok(if n > 0 {
            CheckResult::pass("rls_enabled_tables", format!("{} tables", n))
        } else {
            CheckResult::warn("rls_enabled_tables", "no tables have row level security enabled")
        })
    }

    async fn index_count(&self) -> Result<CheckResult> {
        let n = self.inspector.index_count().await?;
        Ok(if n > 0 {
            CheckResult::pass("index_count", format!("{} indexes", n))
        } else {
            CheckResult::warn("index_count", "no indexes")
        })
    }

    async fn primary_keys(&self) -> Result<CheckResult> {
        let lacking = self.inspector.tables_without_primary_key().await?;
        Ok(if lacking.is_empty() {
            CheckResult::pass("primary_keys", "every table has a primary key")
        } else {
            CheckResult::warn("primary_keys", format!("no primary key: {}", lacking.join(", ")))
        })
    }

    async fn foreign_keys(&self) -> Result<CheckResult> {
        let n = self.inspector.foreign_key_count().await?;
        Ok(CheckResult::pass("foreign_keys", format!("{} foreign keys", n)))
    }

    async fn orphaned_references(&self, tables: &[String]) -> Result<CheckResult> {
        if !tables.iter().any(|t| t == ORPHAN_PARENT) {
            return Ok(CheckResult::pass(
                "orphaned_references",
                format!("skipped: no {} table", ORPHAN_PARENT),
            ));
        }
        let children: Vec<String> = self
            .inspector
            .tables_with_column(ORPHAN_LINK_COLUMN)
            .await?
            .into_iter()
            .filter(|t| t != ORPHAN_PARENT)
            .collect();
        if children.is_empty() {
            return Ok(CheckResult::pass(
                "orphaned_references",
                format!("skipped: no table has a {} column", ORPHAN_LINK_COLUMN),
            ));
        }

        let mut orphans = Vec::new();
        for child in &children {
            let n = self
                .inspector
                .orphan_count(child, ORPHAN_LINK_COLUMN, ORPHAN_PARENT)
                .await?;
            if n > 0 {
                orphans.push(format!("{} ({})", child, n));
            }
        }
        Ok(if orphans.is_empty() {
            CheckResult::pass(
                "orphaned_references",
                format!("{} tables linked to {} are consistent", children.len(), ORPHAN_PARENT),
            )
        } else {
            CheckResult::fail("orphaned_references", format!("orphaned rows: {}", orphans.join(", ")))
        })
    }

    async fn database_size(&self) -> Result<CheckResult> {
        let size = self.inspector.database_size().await?;
        let detail = format!("{} ({} bytes), encoding {}", size.pretty, size.bytes, size.encoding);
        Ok(if size.encoding.eq_ignore_ascii_case("UTF8") {
            CheckResult::pass("database_size", detail)
        } else {
            CheckResult::warn("database_size", detail)
        })
    }

    async fn connections(&self) -> Result<CheckResult> {
        let usage = self.inspector.connection_usage().await?;
        let detail = format!("{} of {} connections in use", usage.active, usage.max);
        Ok(if usage.max > 0 && usage.active as f64 >= usage.max as f64 * CONNECTION_WARN_RATIO {
            CheckResult::warn("connections", detail)
        } else {
            CheckResult::pass("connections", detail)
        })
    }

    async fn statistics(&self) -> Result<CheckResult> {
        let stale = self.inspector.never_analyzed_tables().await?;
        Ok(if stale.is_empty() {
            CheckResult::pass("statistics", "all tables analysed")
        } else {
            CheckResult::warn("statistics", format!("never analysed: {}", stale.join(", ")))
        })
    }
}

fn table_count(tables: &[String]) -> CheckResult {
    if tables.is_empty() {
        CheckResult::fail("table_count", "no tables in schema public")
    } else {
        CheckResult::pass("table_count", format!("{} tables", tables.len()))
    }
}

fn join(names: &[&String]) -> String {
    names.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
}

/// Public entry point for `dbvault verify`. Returns the report; the caller
/// turns its overall status into the exit code.
pub async fn run_verify_flow(config: &VerifyConfig) -> Result<VerificationReport> {
    let inspector = PgInspector::connect(&config.connection).await?;
    let engine = VerificationEngine::new(&inspector, &config.connection.database, &config.core_tables);

    let mode = if config.quick { VerifyMode::Quick } else { VerifyMode::Full };
    tracing::info!(
        "Verifying {} ({})",
        config.connection.describe(),
        if config.quick { "quick" } else { "full" }
    );
    let mut report = engine.run(mode).await?;

    if let Some(artifact) = &config.compare {
        tracing::info!("Comparing against {}", artifact.display());
        for check in engine.compare(artifact).await?.checks {
            report.push(check);
        }
    }

    if config.json {
        println!("{}", report.to_json()?);
    } else {
        report.log();
    }
    Ok(report)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::inspector::{ConnectionUsage, DatabaseSize, MigrationMarker};
    use super::*;
    use async_trait::async_trait;

    /// Answers from fixed values.
    #[derive(Clone)]
    pub(crate) struct FakeInspector {
        pub(crate) tables: Vec<String>,
        pub(crate) policies: u64,
        pub(crate) rls_tables: u64,
        pub(crate) indexes: u64,
        pub(crate) without_pk: Vec<String>,
        pub(crate) linked: Vec<String>,
        pub(crate) orphans: u64,
        pub(crate) encoding: String,
        pub(crate) connections: ConnectionUsage,
        pub(crate) unanalyzed: Vec<String>,
        pub(crate) marker: Option<MigrationMarker>,
    }

    impl FakeInspector {
        /// A healthy multi-tenant database.
        pub(crate) fn healthy() -> Self {
            Self {
                tables: vec!["tenants".into(), "users".into()],
                policies: 1,
                rls_tables: 1,
                indexes: 3,
                without_pk: Vec::new(),
                linked: vec!["users".into()],
                orphans: 0,
                encoding: "UTF8".into(),
                connections: ConnectionUsage { active: 5, max: 100 },
                unanalyzed: Vec::new(),
                marker: Some(MigrationMarker {
                    table: "_sqlx_migrations".into(),
                    version: Some("20260101000000".into()),
                }),
            }
        }
    }

    #[async_trait]
    impl DatabaseInspector for FakeInspector {
        async fn server_version(&self) -> Result<String> {
            Ok("PostgreSQL 16.2".into())
        }
        async fn migration_marker(&self) -> Result<Option<MigrationMarker>> {
            Ok(self.marker.clone())
        }
        async fn tables(&self) -> Result<Vec<String>> {
            Ok(self.tables.clone())
        }
        async fn rls_policy_count(&self) -> Result<u64> {
            Ok(self.policies)
        }
        async fn rls_enabled_table_count(&self) -> Result<u64> {
            Ok(self.rls_tables)
        }
        async fn index_count(&self) -> Result<u64> {
            Ok(self.indexes)
        }
        async fn tables_without_primary_key(&self) -> Result<Vec<String>> {
            Ok(self.without_pk.clone())
        }
        async fn foreign_key_count(&self) -> Result<u64> {
            Ok(1)
        }
        async fn tables_with_column(&self, _column: &str) -> Result<Vec<String>> {
            Ok(self.linked.clone())
        }
        async fn orphan_count(&self, _child: &str, _column: &str, _parent: &str) -> Result<u64> {
            Ok(self.orphans)
        }
        async fn database_size(&self) -> Result<DatabaseSize> {
            Ok(DatabaseSize {
                bytes: 8 * 1024 * 1024,
                pretty: "8192 kB".into(),
                encoding: self.encoding.clone(),
            })
        }
        async fn connection_usage(&self) -> Result<ConnectionUsage> {
            Ok(self.connections)
        }
        async fn never_analyzed_tables(&self) -> Result<Vec<String>> {
            Ok(self.unanalyzed.clone())
        }
    }

    fn core() -> Vec<String> {
        vec!["tenants".into(), "users".into()]
    }

    fn status(report: &VerificationReport, name: &str) -> CheckStatus {
        report
            .checks
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.status)
            .unwrap_or_else(|| panic!("no check named {}", name))
    }

    #[tokio::test]
    async fn test_healthy_database_passes_full() -> Result<()> {
        let fake = FakeInspector::healthy();
        let report = VerificationEngine::new(&fake, "acme", &core()).run(VerifyMode::Full).await?;
        assert_eq!(report.checks.len(), 13);
        assert_eq!(report.overall(), CheckStatus::Pass, "{:?}", report.non_passing().collect::<Vec<_>>());
        assert_eq!(report.exit_code(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_quick_runs_table_and_rls_checks_only() -> Result<()> {
        let fake = FakeInspector::healthy();
        let report = VerificationEngine::new(&fake, "acme", &core()).run(VerifyMode::Quick).await?;
        let names: Vec<&str> = report.checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["table_count", "core_tables", "rls_policies", "rls_enabled_tables"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_database_fails() -> Result<()> {
        let mut fake = FakeInspector::healthy();
        fake.tables.clear();
        fake.policies = 0;
        let report = VerificationEngine::new(&fake, "acme", &core()).run(VerifyMode::Quick).await?;
        assert_eq!(status(&report, "table_count"), CheckStatus::Fail);
        assert_eq!(status(&report, "core_tables"), CheckStatus::Fail);
        assert_eq!(status(&report, "rls_policies"), CheckStatus::Warn);
        assert_eq!(report.exit_code(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_warning_thresholds() -> Result<()> {
        let mut fake = FakeInspector::healthy();
        fake.encoding = "LATIN1".into();
        fake.connections = ConnectionUsage { active: 80, max: 100 };
        fake.unanalyzed = vec!["users".into()];
        fake.without_pk = vec!["audit".into()];
        fake.marker = None;
        let report = VerificationEngine::new(&fake, "acme", &core()).run(VerifyMode::Full).await?;
        for name in ["database_size", "connections", "statistics", "primary_keys", "migration_marker"] {
            assert_eq!(status(&report, name), CheckStatus::Warn, "{}", name);
        }
        assert_eq!(report.exit_code(), 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_orphans_fail_and_scan_is_skipped_without_parent() -> Result<()> {
        let mut fake = FakeInspector::healthy();
        fake.orphans = 2;
        let report = VerificationEngine::new(&fake, "acme", &core()).run(VerifyMode::Full).await?;
        assert_eq!(status(&report, "orphaned_references"), CheckStatus::Fail);

        fake.tables = vec!["users".into()];
        let report = VerificationEngine::new(&fake, "acme", &["users".to_string()])
            .run(VerifyMode::Full)
            .await?;
        assert_eq!(status(&report, "orphaned_references"), CheckStatus::Pass);
        Ok(())
    }

    #[tokio::test]
    async fn test_compare_reports_set_differences() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("acme_daily_20260101_020000.sql.gz");
        crate::artifact::integrity::tests::write_gz(&path, crate::dump::filter::tests::SAMPLE_DUMP.as_bytes());

        let mut fake = FakeInspector::healthy();
        let engine = VerificationEngine::new(&fake, "acme", &core());
        let report = engine.compare(&path).await?;
        assert_eq!(report.overall(), CheckStatus::Pass);

        fake.tables = vec!["tenants".into(), "invoices".into()];
        fake.policies = 3;
        let report = VerificationEngine::new(&fake, "acme", &core()).compare(&path).await?;
        assert_eq!(status(&report, "compare_missing_tables"), CheckStatus::Fail);
        assert_eq!(status(&report, "compare_extra_tables"), CheckStatus::Warn);
        assert_eq!(status(&report, "compare_rls_policies"), CheckStatus::Warn);
        assert!(report.checks[0].detail.contains("users"));
        Ok(())
    }

    #[tokio::test]
    async fn test_compare_matches_tables_by_schema() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("acme_daily_20260101_020000.sql.gz");
        let dump = "-- PostgreSQL database dump\n\
CREATE TABLE public.tenants (\n\
CREATE TABLE public.users (\n\
CREATE TABLE audit.tenants (\n\
CREATE TABLE audit.events (\n\
CREATE POLICY tenant_isolation ON public.users USING (true);\n";
        crate::artifact::integrity::tests::write_gz(&path, dump.as_bytes());

        let mut fake = FakeInspector::healthy();
        let report = VerificationEngine::new(&fake, "acme", &core()).compare(&path).await?;
        assert_eq!(report.overall(), CheckStatus::Pass);
        assert_eq!(report.exit_code(), 0);

        // audit.tenants must not stand in for a missing public.tenants
        fake.tables = vec!["users".into()];
        let report = VerificationEngine::new(&fake, "acme", &core()).compare(&path).await?;
        assert_eq!(status(&report, "compare_missing_tables"), CheckStatus::Fail);
        assert!(report.checks[0].detail.contains("tenants"));
        assert!(!report.checks[0].detail.contains("events"));
        Ok(())
    }
}
