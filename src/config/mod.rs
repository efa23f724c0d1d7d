// dbvault/src/config/mod.rs
pub mod cli;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

use crate::artifact::Tier;
use crate::errors::PipelineError;
use crate::restore::{RestoreMode, RestoreSource};
use cli::{BackupArgs, RestoreArgs, VerifyArgs};

const DEFAULT_BACKUP_DIR: &str = "./backups";
const DEFAULT_S3_PREFIX: &str = "backups";
const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_CORE_TABLES: &[&str] = &["tenants", "users"];

/// Read-only view of the process environment.
///
/// Empty values count as unset. Tests construct one from a map instead of
/// touching the real environment.
pub struct EnvSource {
    lookup: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl EnvSource {
    pub fn process() -> Self {
        Self {
            lookup: Box::new(|key| std::env::var(key).ok()),
        }
    }

    #[cfg(test)]
    pub fn from_map(values: std::collections::HashMap<String, String>) -> Self {
        Self {
            lookup: Box::new(move |key| values.get(key).cloned()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.get(key) {
            Some(raw) => raw.parse::<T>().map_err(|_| {
                PipelineError::Configuration(format!("{} has an invalid value: '{}'", key, raw)).into()
            }),
            None => Ok(default),
        }
    }

    fn flag_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(v) => Err(PipelineError::Configuration(format!(
                "{} must be a boolean (true/false), got '{}'",
                key, v
            ))
            .into()),
        }
    }
}

/// Connection parameters for one database on the PostgreSQL server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl ConnectionConfig {
    pub fn from_env(env: &EnvSource) -> Result<Self> {
        let password = env.get("PGPASSWORD").ok_or_else(|| {
            PipelineError::Configuration("PGPASSWORD must be set".to_string())
        })?;
        Ok(Self {
            host: env.get_or("POSTGRES_HOST", "localhost"),
            port: env.parse_or("POSTGRES_PORT", 5432)?,
            user: env.get_or("POSTGRES_USER", "postgres"),
            password,
            database: env.get_or("POSTGRES_DB", "postgres"),
        })
    }

    /// Same server and credentials, different database.
    pub fn for_database(&self, database: &str) -> Self {
        Self {
            database: database.to_string(),
            ..self.clone()
        }
    }

    /// Connection URL understood by both sqlx and libpq tools.
    pub fn url(&self) -> Result<Url> {
        let mut url = Url::parse(&format!("postgres://{}:{}", self.host, self.port))
            .with_context(|| format!("Invalid database host/port: {}:{}", self.host, self.port))?;
        url.set_username(&self.user)
            .map_err(|_| anyhow::anyhow!("Cannot encode database user '{}' in URL", self.user))?;
        url.set_password(Some(&self.password))
            .map_err(|_| anyhow::anyhow!("Cannot encode database password in URL"))?;
        url.set_path(&format!("/{}", self.database));
        Ok(url)
    }

    /// Host/port/user/database for logging, without the password.
    pub fn describe(&self) -> String {
        format!("{}@{}:{}/{}", self.user, self.host, self.port, self.database)
    }
}

/// Days each tier's artifacts are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub daily: u32,
    pub weekly: u32,
    pub monthly: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            daily: 7,
            weekly: 28,
            monthly: 360,
        }
    }
}

impl RetentionPolicy {
    pub fn from_env(env: &EnvSource) -> Result<Self> {
        let defaults = Self::default();
        let policy = Self {
            daily: env.parse_or("BACKUP_RETENTION_DAILY", defaults.daily)?,
            weekly: env.parse_or("BACKUP_RETENTION_WEEKLY", defaults.weekly)?,
            monthly: env.parse_or("BACKUP_RETENTION_MONTHLY", defaults.monthly)?,
        };
        for tier in Tier::ALL {
            if policy.days_for(tier) == 0 {
                return Err(PipelineError::Configuration(format!(
                    "retention for {} backups must be greater than zero days",
                    tier
                ))
                .into());
            }
        }
        Ok(policy)
    }

    pub fn days_for(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Daily => self.daily,
            Tier::Weekly => self.weekly,
            Tier::Monthly => self.monthly,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Settings {
    pub bucket: String,
    pub prefix: String,
    pub endpoint: Option<String>,
    pub region: String,
}

impl S3Settings {
    /// `None` when no bucket is configured.
    pub fn from_env(env: &EnvSource) -> Option<Self> {
        let bucket = env.get("BACKUP_S3_BUCKET")?;
        Some(Self {
            bucket,
            prefix: env
                .get_or("BACKUP_S3_PREFIX", DEFAULT_S3_PREFIX)
                .trim_matches('/')
                .to_string(),
            endpoint: env.get("BACKUP_S3_ENDPOINT"),
            region: env
                .get("AWS_REGION")
                .or_else(|| env.get("AWS_DEFAULT_REGION"))
                .unwrap_or_else(|| DEFAULT_REGION.to_string()),
        })
    }
}

/// Settings shared by everything that writes backup artifacts.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub backup_dir: PathBuf,
    pub compression_level: u32,
    pub parallel_workers: usize,
    pub retention: RetentionPolicy,
    pub s3: Option<S3Settings>,
}

impl StorageSettings {
    pub fn from_env(env: &EnvSource) -> Result<Self> {
        let compression_level: u32 = env.parse_or("BACKUP_COMPRESSION_LEVEL", 6)?;
        if !(1..=9).contains(&compression_level) {
            return Err(PipelineError::Configuration(format!(
                "BACKUP_COMPRESSION_LEVEL must be between 1 and 9, got {}",
                compression_level
            ))
            .into());
        }
        let parallel_workers: usize = env.parse_or("BACKUP_PARALLEL_JOBS", 1)?;
        if parallel_workers == 0 {
            return Err(PipelineError::Configuration(
                "BACKUP_PARALLEL_JOBS must be at least 1".to_string(),
            )
            .into());
        }
        Ok(Self {
            backup_dir: PathBuf::from(env.get_or("BACKUP_DIR", DEFAULT_BACKUP_DIR)),
            compression_level,
            parallel_workers,
            retention: RetentionPolicy::from_env(env)?,
            s3: S3Settings::from_env(env),
        })
    }
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub connection: ConnectionConfig,
    pub storage: StorageSettings,
    pub tier: Tier,
    pub schema_only: bool,
    pub verify_after: bool,
    pub metrics_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RestoreConfig {
    pub connection: ConnectionConfig,
    pub storage: StorageSettings,
    pub list_only: bool,
    pub source: RestoreSource,
    pub target_database: String,
    pub mode: RestoreMode,
    pub drop_existing: bool,
    pub dry_run: bool,
    pub skip_confirm: bool,
    pub pre_backup: bool,
    pub core_tables: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct VerifyConfig {
    pub connection: ConnectionConfig,
    pub quick: bool,
    pub compare: Option<PathBuf>,
    pub json: bool,
    pub core_tables: Vec<String>,
}

pub fn load_backup_config(env: &EnvSource, args: &BackupArgs) -> Result<BackupConfig> {
    Ok(BackupConfig {
        connection: ConnectionConfig::from_env(env)?,
        storage: StorageSettings::from_env(env)?,
        tier: args.tier,
        schema_only: args.schema_only,
        verify_after: args.verify,
        metrics_dir: env.get("BACKUP_METRICS_DIR").map(PathBuf::from),
    })
}

pub fn load_restore_config(env: &EnvSource, args: &RestoreArgs) -> Result<RestoreConfig> {
    let connection = ConnectionConfig::from_env(env)?;
    let storage = StorageSettings::from_env(env)?;

    let source = match (&args.backup_file, args.latest, args.from_s3) {
        (Some(file), false, false) => RestoreSource::Path(PathBuf::from(file)),
        (Some(file), false, true) => RestoreSource::Remote(file.clone()),
        (None, true, false) => RestoreSource::Latest,
        (None, true, true) => RestoreSource::LatestRemote,
        _ if args.list => RestoreSource::Latest,
        _ => {
            return Err(PipelineError::Configuration(
                "specify a BACKUP_FILE or --latest (see --help)".to_string(),
            )
            .into());
        }
    };

    if matches!(source, RestoreSource::Remote(_) | RestoreSource::LatestRemote) && storage.s3.is_none() {
        return Err(PipelineError::Configuration(
            "--from-s3 requires BACKUP_S3_BUCKET to be set".to_string(),
        )
        .into());
    }

    let target_database = args
        .target_db
        .clone()
        .unwrap_or_else(|| connection.database.clone());

    Ok(RestoreConfig {
        mode: RestoreMode::from_flags(args.schema_only, args.data_only)?,
        skip_confirm: args.skip_confirm || env.flag_or("RESTORE_SKIP_CONFIRM", false)?,
        pre_backup: !args.no_pre_backup && env.flag_or("RESTORE_PRE_BACKUP", true)?,
        core_tables: core_tables(env),
        list_only: args.list,
        drop_existing: args.drop,
        dry_run: args.dry_run,
        target_database,
        source,
        connection,
        storage,
    })
}

pub fn load_verify_config(env: &EnvSource, args: &VerifyArgs) -> Result<VerifyConfig> {
    Ok(VerifyConfig {
        connection: ConnectionConfig::from_env(env)?,
        quick: args.quick,
        compare: args.compare.clone(),
        json: args.json,
        core_tables: core_tables(env),
    })
}

fn core_tables(env: &EnvSource) -> Vec<String> {
    match env.get("VERIFY_CORE_TABLES") {
        Some(list) => list
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        None => DEFAULT_CORE_TABLES.iter().map(|t| t.to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{Command, exit_code_for};

    fn env(pairs: &[(&str, &str)]) -> EnvSource {
        EnvSource::from_map(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn restore_args() -> RestoreArgs {
        RestoreArgs {
            backup_file: None,
            list: false,
            latest: false,
            from_s3: false,
            dry_run: false,
            schema_only: false,
            data_only: false,
            drop: false,
            target_db: None,
            skip_confirm: false,
            no_pre_backup: false,
            verbose: false,
        }
    }

    #[test]
    fn test_missing_password_is_configuration_error() {
        let err = ConnectionConfig::from_env(&env(&[("POSTGRES_DB", "acme")])).unwrap_err();
        assert_eq!(exit_code_for(&err, Command::Backup), 2);
    }

    #[test]
    fn test_connection_defaults_and_url() -> anyhow::Result<()> {
        let conn = ConnectionConfig::from_env(&env(&[("PGPASSWORD", "p@ss word"), ("POSTGRES_DB", "acme")]))?;
        assert_eq!(conn.host, "localhost");
        assert_eq!(conn.port, 5432);
        assert_eq!(conn.user, "postgres");

        let url = conn.url()?;
        assert_eq!(url.scheme(), "postgres");
        assert_eq!(url.path(), "/acme");
        assert_eq!(url.host_str(), Some("localhost"));
        assert!(!conn.describe().contains("p@ss"));

        let other = conn.for_database("staging");
        assert_eq!(other.url()?.path(), "/staging");
        Ok(())
    }

    #[test]
    fn test_retention_defaults_and_overrides() -> anyhow::Result<()> {
        assert_eq!(RetentionPolicy::from_env(&env(&[]))?, RetentionPolicy::default());

        let policy = RetentionPolicy::from_env(&env(&[("BACKUP_RETENTION_WEEKLY", "35")]))?;
        assert_eq!(policy.days_for(Tier::Weekly), 35);
        assert_eq!(policy.days_for(Tier::Monthly), 360);
        Ok(())
    }

    #[test]
    fn test_retention_must_be_positive() {
        assert!(RetentionPolicy::from_env(&env(&[("BACKUP_RETENTION_DAILY", "0")])).is_err());
        assert!(RetentionPolicy::from_env(&env(&[("BACKUP_RETENTION_MONTHLY", "a year")])).is_err());
    }

    #[test]
    fn test_s3_settings_require_bucket() {
        assert!(S3Settings::from_env(&env(&[("BACKUP_S3_PREFIX", "x")])).is_none());

        let s3 = S3Settings::from_env(&env(&[
            ("BACKUP_S3_BUCKET", "acme-backups"),
            ("BACKUP_S3_PREFIX", "/prod/db/"),
            ("BACKUP_S3_ENDPOINT", "https://minio.internal:9000"),
        ]))
        .unwrap();
        assert_eq!(s3.prefix, "prod/db");
        assert_eq!(s3.endpoint.as_deref(), Some("https://minio.internal:9000"));
        assert_eq!(s3.region, "us-east-1");
    }

    #[test]
    fn test_compression_level_bounds() {
        let base = [("BACKUP_COMPRESSION_LEVEL", "12")];
        assert!(StorageSettings::from_env(&env(&base)).is_err());
        assert!(StorageSettings::from_env(&env(&[("BACKUP_PARALLEL_JOBS", "0")])).is_err());
    }

    #[test]
    fn test_restore_config_sources() -> anyhow::Result<()> {
        let e = env(&[("PGPASSWORD", "x"), ("POSTGRES_DB", "acme")]);

        let mut args = restore_args();
        args.backup_file = Some("acme_daily_20260101_020000.sql.gz".into());
        let cfg = load_restore_config(&e, &args)?;
        assert!(matches!(cfg.source, RestoreSource::Path(_)));
        assert_eq!(cfg.target_database, "acme");
        assert_eq!(cfg.mode, RestoreMode::Full);
        assert!(cfg.pre_backup);
        assert!(!cfg.skip_confirm);

        let mut args = restore_args();
        args.latest = true;
        args.target_db = Some("acme_copy".into());
        args.schema_only = true;
        let cfg = load_restore_config(&e, &args)?;
        assert!(matches!(cfg.source, RestoreSource::Latest));
        assert_eq!(cfg.target_database, "acme_copy");
        assert_eq!(cfg.mode, RestoreMode::SchemaOnly);

        let err = load_restore_config(&e, &restore_args()).unwrap_err();
        assert_eq!(exit_code_for(&err, Command::Restore), 2);
        Ok(())
    }

    #[test]
    fn test_restore_env_flags() -> anyhow::Result<()> {
        let e = env(&[
            ("PGPASSWORD", "x"),
            ("RESTORE_SKIP_CONFIRM", "true"),
            ("RESTORE_PRE_BACKUP", "false"),
        ]);
        let mut args = restore_args();
        args.latest = true;
        let cfg = load_restore_config(&e, &args)?;
        assert!(cfg.skip_confirm);
        assert!(!cfg.pre_backup);

        let e = env(&[("PGPASSWORD", "x"), ("RESTORE_PRE_BACKUP", "maybe")]);
        assert!(load_restore_config(&e, &args).is_err());
        Ok(())
    }

    #[test]
    fn test_from_s3_requires_bucket() {
        let mut args = restore_args();
        args.backup_file = Some("acme_daily_20260101_020000.sql.gz".into());
        args.from_s3 = true;
        let err = load_restore_config(&env(&[("PGPASSWORD", "x")]), &args).unwrap_err();
        assert_eq!(exit_code_for(&err, Command::Restore), 2);
    }

    #[test]
    fn test_core_tables_override() {
        assert_eq!(core_tables(&env(&[])), vec!["tenants", "users"]);
        assert_eq!(
            core_tables(&env(&[("VERIFY_CORE_TABLES", "orgs, members,,")])),
            vec!["orgs", "members"]
        );
    }
}
