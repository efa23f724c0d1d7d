//! Reading plain-text dumps: filtering for restore and dry-run analysis.

pub mod analyzer;
pub mod filter;

pub use analyzer::{DryRunReport, analyze_artifact};
pub use filter::{FilterMode, FilterSummary, filter_stream};
