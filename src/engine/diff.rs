use crate::engine::models::{DiffLine, DiffReport, DiffStatus};

/// Strictly positional comparison: line `i` of `expected` is only ever
/// compared with line `i` of `actual`. An inserted or dropped line shifts
/// every later line into mismatch, and graders rely on that.
pub fn diff(expected: &str, actual: &str) -> DiffReport {
    let expected_lines = split_lines(expected);
    let actual_lines = split_lines(actual);
    let len = expected_lines.len().max(actual_lines.len());

    let lines = (0..len)
        .map(|i| {
            let exp = expected_lines.get(i).copied();
            let act = actual_lines.get(i).copied();
            let status = match (exp, act) {
                (Some(e), Some(a)) if e == a => DiffStatus::Match,
                (Some(_), Some(_)) => DiffStatus::Mismatch,
                (Some(_), None) => DiffStatus::Missing,
                (None, _) => DiffStatus::Extra,
            };
            DiffLine {
                line_num: i + 1,
                expected: exp.map(str::to_string),
                actual: act.map(str::to_string),
                status,
            }
        })
        .collect();

    DiffReport(lines)
}

/// Trims the whole text, then splits on `\n`, tolerating `\r\n`. Empty text
/// is one empty line.
fn split_lines(text: &str) -> Vec<&str> {
    text.trim()
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_output_matches() {
        let report = diff("4\n", "4\n");
        assert!(report.matched());
        assert_eq!(report.len(), 1);
        assert_eq!(report.lines()[0].status, DiffStatus::Match);
    }

    #[test]
    fn missing_trailing_line_is_reported() {
        let report = diff("4\n5\n", "4\n");
        assert!(!report.matched());
        assert_eq!(report.lines()[0].status, DiffStatus::Match);
        assert_eq!(
            report.lines()[1],
            DiffLine {
                line_num: 2,
                expected: Some("5".into()),
                actual: None,
                status: DiffStatus::Missing,
            }
        );
    }

    #[test]
    fn extra_lines_are_reported() {
        let report = diff("a", "a\nb\nc");
        let statuses: Vec<_> = report.lines().iter().map(|l| l.status).collect();
        assert_eq!(
            statuses,
            [DiffStatus::Match, DiffStatus::Extra, DiffStatus::Extra]
        );
        assert_eq!(report.lines()[2].expected, None);
    }

    #[test]
    fn inserted_line_cascades_into_mismatches() {
        let report = diff("a\nb\nc", "x\na\nb\nc");
        let statuses: Vec<_> = report.lines().iter().map(|l| l.status).collect();
        assert_eq!(
            statuses,
            [
                DiffStatus::Mismatch,
                DiffStatus::Mismatch,
                DiffStatus::Mismatch,
                DiffStatus::Extra
            ]
        );
    }

    #[test]
    fn whole_text_is_trimmed_but_inner_lines_are_not() {
        assert!(diff("\n\n  hello\nworld \n\n", "hello\nworld").matched());
        assert!(!diff("a\n  b", "a\nb").matched());
    }

    #[test]
    fn crlf_output_matches_lf_expectation() {
        assert!(diff("1\n2\n", "1\r\n2\r\n").matched());
    }

    #[test]
    fn length_is_max_of_line_counts_and_matched_iff_all_match() {
        let cases = [
            ("", ""),
            ("a", ""),
            ("a\nb\nc", "a"),
            ("a", "a\nb\nc\nd"),
            ("x\ny", "x\nz"),
            ("same\ntext", "same\ntext"),
        ];
        for (expected, actual) in cases {
            let report = diff(expected, actual);
            let expected_len = split_lines(expected).len().max(split_lines(actual).len());
            assert_eq!(report.len(), expected_len, "{expected:?} vs {actual:?}");
            let all_match = report
                .lines()
                .iter()
                .all(|l| l.status == DiffStatus::Match);
            assert_eq!(report.matched(), all_match);
        }
    }
}
