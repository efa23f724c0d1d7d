// dbvault/src/dump/analyzer.rs
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use regex::bytes::Regex;
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::LazyLock;

use super::filter::{LineClassifier, LineKind, StructuralAnomaly, trim_eol};

/// Statement keywords counted in the histogram.
pub const STATEMENT_KEYWORDS: [&str; 9] = [
    "CREATE", "ALTER", "DROP", "INSERT", "COPY", "SET", "COMMENT", "GRANT", "REVOKE",
];

static CREATE_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^CREATE\s+(?:UNLOGGED\s+)?TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?([A-Za-z0-9_."]+)"#)
        .expect("static regex")
});

/// What a dry run learned about a dump.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DryRunReport {
    /// `(keyword, count)`, highest count first.
    pub statement_histogram: Vec<(String, u64)>,
    /// `schema.table`, sorted; unqualified names are put in `public`.
    pub tables: BTreeSet<String>,
    pub copy_blocks: u64,
    pub insert_statements: u64,
    pub policy_count: u64,
    pub extensions: Vec<String>,
    pub lines: u64,
    pub anomaly: Option<StructuralAnomaly>,
}

impl DryRunReport {
    #[cfg(test)]
    pub fn statements(&self, keyword: &str) -> u64 {
        self.statement_histogram
            .iter()
            .find(|(k, _)| k == keyword)
            .map_or(0, |(_, n)| *n)
    }

    /// Bare names of the tables in `schema`.
    pub fn tables_in(&self, schema: &str) -> BTreeSet<String> {
        self.tables
            .iter()
            .filter_map(|t| t.split_once('.'))
            .filter(|(s, _)| *s == schema)
            .map(|(_, name)| name.to_string())
            .collect()
    }

    /// Emits the report through the log, one item per line.
    pub fn log(&self) {
        tracing::info!("Dry run: {} lines scanned", self.lines);
        tracing::info!("Statement types:");
        for (keyword, count) in &self.statement_histogram {
            tracing::info!("  {:<8} {}", keyword, count);
        }
        tracing::info!("Tables ({}): {}", self.tables.len(), join(&self.tables));
        tracing::info!(
            "Data operations: {} COPY blocks, {} INSERT statements",
            self.copy_blocks,
            self.insert_statements
        );
        tracing::info!("Row level security policies: {}", self.policy_count);
        for ext in &self.extensions {
            tracing::info!("Extension: {}", ext);
        }
        if let Some(anomaly) = &self.anomaly {
            tracing::warn!("Structural anomaly: {}", anomaly);
        }
    }
}

fn join(names: &BTreeSet<String>) -> String {
    names.iter().cloned().collect::<Vec<_>>().join(", ")
}

/// Scans a plain-text dump without executing or filtering anything.
pub fn analyze<R: BufRead>(mut input: R) -> Result<DryRunReport> {
    let mut classifier = LineClassifier::new();
    let mut histogram: HashMap<&'static str, u64> = HashMap::new();
    let mut report = DryRunReport::default();
    let mut line = Vec::with_capacity(8 * 1024);

    loop {
        line.clear();
        if input
            .read_until(b'\n', &mut line)
            .context("Failed to read dump while analysing")?
            == 0
        {
            break;
        }
        match classifier.classify(&line) {
            LineKind::CopyRow | LineKind::CopyTerminator => continue,
            LineKind::CopyHeader => report.copy_blocks += 1,
            LineKind::Insert => report.insert_statements += 1,
            LineKind::Ddl => {}
        }

        let text = trim_eol(&line);
        if let Some(keyword) = leading_keyword(text) {
            *histogram.entry(keyword).or_default() += 1;
        }
        if let Some(caps) = CREATE_TABLE.captures(text) {
            report.tables.insert(qualify(&caps[1]));
        }
        if text.starts_with(b"CREATE POLICY ") {
            report.policy_count += 1;
        }
        if text.starts_with(b"CREATE EXTENSION ") {
            report
                .extensions
                .push(String::from_utf8_lossy(text).trim_end_matches(';').to_string());
        }
    }

    let mut histogram: Vec<(String, u64)> = histogram
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    histogram.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    report.statement_histogram = histogram;
    report.lines = classifier.lines_seen();
    report.anomaly = classifier.finish();
    Ok(report)
}

/// Dry run over a gzip-compressed artifact.
pub fn analyze_artifact(path: &Path) -> Result<DryRunReport> {
    let file = File::open(path).with_context(|| format!("Failed to open backup file: {}", path.display()))?;
    analyze(BufReader::new(GzDecoder::new(file)))
        .with_context(|| format!("Failed to analyse backup file: {}", path.display()))
}

fn leading_keyword(line: &[u8]) -> Option<&'static str> {
    STATEMENT_KEYWORDS.into_iter().find(|kw| {
        line.starts_with(kw.as_bytes())
            && line
                .get(kw.len())
                .is_none_or(|c| c.is_ascii_whitespace() || *c == b';')
    })
}

/// `public."Users"` -> `public.Users`, `cache` -> `public.cache`
fn qualify(raw: &[u8]) -> String {
    let name = String::from_utf8_lossy(raw);
    let (schema, table) = name.rsplit_once('.').unwrap_or(("public", &name));
    format!("{}.{}", schema.trim_matches('"'), table.trim_matches('"'))
}
