//! Tab-separated dumps of result and failure lists.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use crate::bundle::ArgValue;
use crate::stream::{FailureEntry, ResultEntry};

/// Renders results as TSV: `idx, worker, bytes, launch_ms` plus the sorted
/// union of the extra columns the workers supplied.
#[must_use]
pub fn results_to_tsv(results: &[ResultEntry]) -> String {
    let extra_columns: BTreeSet<&str> = results
        .iter()
        .flat_map(|entry| entry.extras.keys().map(String::as_str))
        .collect();

    let mut out = String::from("idx\tworker\tbytes\tlaunch_ms");
    for column in &extra_columns {
        let _ = write!(out, "\t{column}");
    }
    out.push('\n');

    for entry in results {
        let _ = write!(
            out,
            "{}\t{}\t{}\t{}",
            entry.idx, entry.worker, entry.bytes, entry.launch_ms
        );
        for column in &extra_columns {
            let value = entry.extras.get(*column).unwrap_or(&ArgValue::Null);
            let _ = write!(out, "\t{value}");
        }
        out.push('\n');
    }
    out
}

/// Renders failures as TSV: `idx, worker, error, message`.
#[must_use]
pub fn failures_to_tsv(failures: &[FailureEntry]) -> String {
    let mut out = String::from("idx\tworker\terror\tmessage\n");
    for entry in failures {
        let _ = writeln!(
            out,
            "{}\t{}\t{}\t{}",
            entry.idx, entry.worker, entry.error, entry.message
        );
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_results_tsv_includes_extra_columns() {
        let mut first = ResultEntry::new(0, "W0", 2048).with_extra("filename", "0000.txt");
        first.launch_ms = 1.5;
        let second = ResultEntry::new(1, "W1", 4096);

        let tsv = results_to_tsv(&[first, second]);
        let mut lines = tsv.lines();
        assert_eq!(lines.next().unwrap(), "idx\tworker\tbytes\tlaunch_ms\tfilename");
        assert_eq!(lines.next().unwrap(), "0\tW0\t2048\t1.5\t0000.txt");
        // missing extras render empty
        assert_eq!(lines.next().unwrap(), "1\tW1\t4096\t0\t");
    }

    #[test]
    fn test_failures_tsv_layout() {
        let entry = FailureEntry {
            idx: 2,
            worker: "W0".to_string(),
            error: "TooManyRetries".to_string(),
            message: "W0 aborted job 2 (expected)".to_string(),
        };
        let tsv = failures_to_tsv(&[entry]);
        assert_eq!(
            tsv,
            "idx\tworker\terror\tmessage\n2\tW0\tTooManyRetries\tW0 aborted job 2 (expected)\n"
        );
    }

    #[test]
    fn test_empty_lists_render_headers_only() {
        assert_eq!(results_to_tsv(&[]), "idx\tworker\tbytes\tlaunch_ms\n");
        assert_eq!(failures_to_tsv(&[]), "idx\tworker\terror\tmessage\n");
    }
}
