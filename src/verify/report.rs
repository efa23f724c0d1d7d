// dbvault/src/verify/report.rs
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CheckStatus::Pass => "PASS",
            CheckStatus::Warn => "WARN",
            CheckStatus::Fail => "FAIL",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckResult {
    pub fn new(name: &str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
        }
    }

    pub fn pass(name: &str, detail: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Pass, detail)
    }

    pub fn warn(name: &str, detail: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Warn, detail)
    }

    pub fn fail(name: &str, detail: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Fail, detail)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub pass: usize,
    pub warn: usize,
    pub fail: usize,
}

/// Ordered check results for one database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub database: String,
    pub checks: Vec<CheckResult>,
}

/// Serialized form printed by `verify --json`.
#[derive(Serialize)]
struct JsonReport<'a> {
    database: &'a str,
    overall: CheckStatus,
    counts: Counts,
    checks: &'a [CheckResult],
}

impl VerificationReport {
    pub fn new(database: &str) -> Self {
        Self {
            database: database.to_string(),
            checks: Vec::new(),
        }
    }

    pub fn push(&mut self, result: CheckResult) {
        self.checks.push(result);
    }

    pub fn counts(&self) -> Counts {
        let mut counts = Counts::default();
        for check in &self.checks {
            match check.status {
                CheckStatus::Pass => counts.pass += 1,
                CheckStatus::Warn => counts.warn += 1,
                CheckStatus::Fail => counts.fail += 1,
            }
        }
        counts
    }

    /// Worst status present; an empty report passes.
    pub fn overall(&self) -> CheckStatus {
        self.checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(CheckStatus::Pass)
    }

    /// `verify` exit code: 0 pass, 5 warnings, 4 failures.
    pub fn exit_code(&self) -> u8 {
        match self.overall() {
            CheckStatus::Pass => 0,
            CheckStatus::Warn => 5,
            CheckStatus::Fail => 4,
        }
    }

    pub fn non_passing(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| c.status != CheckStatus::Pass)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&JsonReport {
            database: &self.database,
            overall: self.overall(),
            counts: self.counts(),
            checks: &self.checks,
        })
    }

    /// Stand-in for [`Self::to_json`] when verification could not run.
    pub fn error_json(message: &str, exit_code: u8) -> String {
        serde_json::json!({
            "overall": "ERROR",
            "error": message,
            "exit_code": exit_code,
        })
        .to_string()
    }

    /// One log line per check plus a summary.
    pub fn log(&self) {
        for check in &self.checks {
            match check.status {
                CheckStatus::Pass => tracing::info!("[{}] {}: {}", check.status, check.name, check.detail),
                CheckStatus::Warn => tracing::warn!("[{}] {}: {}", check.status, check.name, check.detail),
                CheckStatus::Fail => tracing::error!("[{}] {}: {}", check.status, check.name, check.detail),
            }
        }
        let counts = self.counts();
        let line = format!(
            "Verification of {}: {} passed, {} warnings, {} failed",
            self.database, counts.pass, counts.warn, counts.fail
        );
        match self.overall() {
            CheckStatus::Pass => crate::success!("{}", line),
            CheckStatus::Warn => tracing::warn!("{}", line),
            CheckStatus::Fail => tracing::error!("{}", line),
        }
    }
}
