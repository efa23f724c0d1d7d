//! Line-oriented splitting of plain-text `pg_dump` output.
//!
//! No SQL is parsed. Lines are classified by anchors only:
//! a `COPY ... FROM stdin;` header opens a data block that runs until a line
//! that is exactly `\.`; outside such blocks `INSERT ` lines are data and
//! everything else is schema.

use regex::bytes::Regex;
use std::io::{self, BufRead, Write};
use std::sync::LazyLock;

static COPY_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^COPY .* FROM stdin;$").expect("static regex"));

const COPY_TERMINATOR: &[u8] = b"\\.";
const INSERT_PREFIX: &[u8] = b"INSERT ";

/// Which part of a dump to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    #[default]
    Full,
    SchemaOnly,
    DataOnly,
}

impl FilterMode {
    pub fn keeps(&self, kind: LineKind) -> bool {
        match self {
            FilterMode::Full => true,
            FilterMode::SchemaOnly => !kind.is_data(),
            FilterMode::DataOnly => kind.is_data(),
        }
    }
}

/// Structural role of one dump line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Ddl,
    CopyHeader,
    CopyRow,
    CopyTerminator,
    Insert,
}

impl LineKind {
    pub fn is_data(&self) -> bool {
        !matches!(self, LineKind::Ddl)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyState {
    OutsideCopy,
    InsideCopy { started_at: u64 },
}

/// Something structurally wrong with a dump that did not stop the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuralAnomaly {
    /// A COPY block opened on this (1-based) line was never terminated.
    UnterminatedCopy { started_at_line: u64 },
}

impl std::fmt::Display for StructuralAnomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StructuralAnomaly::UnterminatedCopy { started_at_line } => write!(
                f,
                "COPY block starting at line {} has no terminating \\. line",
                started_at_line
            ),
        }
    }
}

/// The two-state automaton behind both filtering and dry-run analysis.
#[derive(Debug, Clone)]
pub struct LineClassifier {
    state: CopyState,
    line_no: u64,
}

impl Default for LineClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl LineClassifier {
    pub fn new() -> Self {
        Self {
            state: CopyState::OutsideCopy,
            line_no: 0,
        }
    }

    /// Classifies the next line. A trailing `\n` or `\r\n` is ignored.
    pub fn classify(&mut self, line: &[u8]) -> LineKind {
        self.line_no += 1;
        let line = trim_eol(line);
        match self.state {
            CopyState::InsideCopy { .. } if line == COPY_TERMINATOR => {
                self.state = CopyState::OutsideCopy;
                LineKind::CopyTerminator
            }
            CopyState::InsideCopy { .. } => LineKind::CopyRow,
            CopyState::OutsideCopy if COPY_HEADER.is_match(line) => {
                self.state = CopyState::InsideCopy {
                    started_at: self.line_no,
                };
                LineKind::CopyHeader
            }
            CopyState::OutsideCopy if line.starts_with(INSERT_PREFIX) => LineKind::Insert,
            CopyState::OutsideCopy => LineKind::Ddl,
        }
    }

    pub fn lines_seen(&self) -> u64 {
        self.line_no
    }

    /// Reports an unterminated COPY block once input is exhausted.
    pub fn finish(&self) -> Option<StructuralAnomaly> {
        match self.state {
            CopyState::OutsideCopy => None,
            CopyState::InsideCopy { started_at } => Some(StructuralAnomaly::UnterminatedCopy {
                started_at_line: started_at,
            }),
        }
    }
}

pub(crate) fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSummary {
    pub lines_read: u64,
    pub lines_emitted: u64,
    pub copy_blocks: u64,
    pub insert_lines: u64,
    pub anomaly: Option<StructuralAnomaly>,
}

/// Copies the lines of `input` that `mode` keeps into `output`.
///
/// Single forward pass, one line buffered at a time. Lines are written
/// byte-for-byte, so [`FilterMode::Full`] reproduces the input exactly.
pub fn filter_stream<R: BufRead, W: Write + ?Sized>(
    mut input: R,
    output: &mut W,
    mode: FilterMode,
) -> io::Result<FilterSummary> {
    let mut classifier = LineClassifier::new();
    let mut summary = FilterSummary::default();
    let mut line = Vec::with_capacity(8 * 1024);

    loop {
        line.clear();
        if input.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        let kind = classifier.classify(&line);
        match kind {
            LineKind::CopyHeader => summary.copy_blocks += 1,
            LineKind::Insert => summary.insert_lines += 1,
            _ => {}
        }
        if mode.keeps(kind) {
            output.write_all(&line)?;
            summary.lines_emitted += 1;
        }
    }
    output.flush()?;

    summary.lines_read = classifier.lines_seen();
    summary.anomaly = classifier.finish();
    Ok(summary)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE_DUMP: &str = "\
--
-- PostgreSQL database dump
--

SET statement_timeout = 0;
CREATE EXTENSION IF NOT EXISTS pgcrypto WITH SCHEMA public;
CREATE TABLE public.tenants (
    id integer NOT NULL,
    name text
);
CREATE TABLE public.users (
    id integer NOT NULL,
    tenant_id integer
);
ALTER TABLE public.users ENABLE ROW LEVEL SECURITY;
CREATE POLICY tenant_isolation ON public.users USING ((tenant_id = 1));
COPY public.tenants (id, name) FROM stdin;
1\tacme
2\tglobex
\\.
COPY public.users (id, tenant_id) FROM stdin;
10\t1
\\.
INSERT INTO public.audit VALUES (1, 'created');
INSERT INTO public.audit VALUES (2, 'INSERT into users');
ALTER TABLE ONLY public.tenants ADD CONSTRAINT tenants_pkey PRIMARY KEY (id);
";

    fn run(input: &str, mode: FilterMode) -> (String, FilterSummary) {
        let mut out = Vec::new();
        let summary = filter_stream(input.as_bytes(), &mut out, mode).unwrap();
        (String::from_utf8(out).unwrap(), summary)
    }

    #[test]
    fn test_transitions_outside_copy() {
        let mut c = LineClassifier::new();
        assert_eq!(c.classify(b"CREATE TABLE t (id int);\n"), LineKind::Ddl);
        assert_eq!(c.classify(b"INSERT INTO t VALUES (1);\n"), LineKind::Insert);
        assert_eq!(c.classify(b"\\.\n"), LineKind::Ddl);
        assert_eq!(c.classify(b"COPY t (id) FROM stdin;\n"), LineKind::CopyHeader);
        assert_eq!(c.finish(), Some(StructuralAnomaly::UnterminatedCopy { started_at_line: 4 }));
    }

    #[test]
    fn test_transitions_inside_copy() {
        let mut c = LineClassifier::new();
        c.classify(b"COPY t (id) FROM stdin;\n");
        assert_eq!(c.classify(b"INSERT INTO looks like data\n"), LineKind::CopyRow);
        assert_eq!(c.classify(b"COPY x (y) FROM stdin;\n"), LineKind::CopyRow);
        assert_eq!(c.classify(b"\\.x\n"), LineKind::CopyRow);
        assert_eq!(c.classify(b"\\.\r\n"), LineKind::CopyTerminator);
        assert_eq!(c.classify(b"SELECT 1;\n"), LineKind::Ddl);
        assert_eq!(c.finish(), None);
    }

    #[test]
    fn test_copy_header_needs_full_anchor() {
        let mut c = LineClassifier::new();
        assert_eq!(c.classify(b"COPY t TO stdout;\n"), LineKind::Ddl);
        assert_eq!(c.classify(b" COPY t (id) FROM stdin;\n"), LineKind::Ddl);
        assert_eq!(c.classify(b"COPY t (id) FROM stdin; -- trailing\n"), LineKind::Ddl);
        assert_eq!(c.classify(b"INSERTS are not inserts\n"), LineKind::Ddl);
    }

    #[test]
    fn test_mode_table() {
        let kinds = [
            LineKind::Ddl,
            LineKind::CopyHeader,
            LineKind::CopyRow,
            LineKind::CopyTerminator,
            LineKind::Insert,
        ];
        for kind in kinds {
            assert!(FilterMode::Full.keeps(kind));
            assert_eq!(FilterMode::SchemaOnly.keeps(kind), kind == LineKind::Ddl);
            assert_eq!(FilterMode::DataOnly.keeps(kind), kind != LineKind::Ddl);
        }
    }

    #[test]
    fn test_full_mode_is_byte_identical() {
        let (out, summary) = run(SAMPLE_DUMP, FilterMode::Full);
        assert_eq!(out, SAMPLE_DUMP);
        assert_eq!(summary.copy_blocks, 2);
        assert_eq!(summary.insert_lines, 2);
        assert_eq!(summary.lines_read, summary.lines_emitted);
        assert_eq!(summary.anomaly, None);

        let no_trailing_newline = "CREATE TABLE a (id int);\nCOPY a (id) FROM stdin;\n1\n\\.";
        assert_eq!(run(no_trailing_newline, FilterMode::Full).0, no_trailing_newline);
    }

    #[test]
    fn test_schema_only_drops_all_data() {
        let (out, _) = run(SAMPLE_DUMP, FilterMode::SchemaOnly);
        assert_eq!(out.matches("CREATE TABLE").count(), 2);
        assert!(out.contains("CREATE POLICY tenant_isolation"));
        assert!(!out.contains("COPY "));
        assert!(!out.contains("INSERT "));
        assert!(!out.contains("acme"));
        assert!(!out.contains("\\."));
    }

    #[test]
    fn test_data_only_keeps_blocks_and_inserts() {
        let (out, summary) = run(SAMPLE_DUMP, FilterMode::DataOnly);
        let expected = "\
COPY public.tenants (id, name) FROM stdin;
1\tacme
2\tglobex
\\.
COPY public.users (id, tenant_id) FROM stdin;
10\t1
\\.
INSERT INTO public.audit VALUES (1, 'created');
INSERT INTO public.audit VALUES (2, 'INSERT into users');
";
        assert_eq!(out, expected);
        assert_eq!(summary.lines_emitted, 9);
    }

    #[test]
    fn test_unterminated_copy_is_flagged_not_fatal() {
        let dump = "CREATE TABLE a (id int);\nCOPY a (id) FROM stdin;\n1\n2\nCREATE INDEX a_idx ON a (id);\n";
        let (schema, summary) = run(dump, FilterMode::SchemaOnly);
        assert_eq!(schema, "CREATE TABLE a (id int);\n");
        assert_eq!(
            summary.anomaly,
            Some(StructuralAnomaly::UnterminatedCopy { started_at_line: 2 })
        );
        assert_eq!(summary.lines_read, 5);
    }

    #[test]
    fn test_non_utf8_rows_pass_through() {
        let dump: &[u8] = b"COPY b (v) FROM stdin;\n\xff\xfe raw\n\\.\n";
        let mut out = Vec::new();
        filter_stream(dump, &mut out, FilterMode::DataOnly).unwrap();
        assert_eq!(out, dump);
    }
}
