//! Parsing of toolchain text reports.
//!
//! The tools print free-form progress and end with a fixed trailer. Offsets
//! are counted from the end of the output split on `\n` (so index `-1` is
//! the empty string after the final newline).

use crate::error::OracleError;

const SLICE_WITH_SLICE: &str = "Dependencies exported and slice";
const SLICE_NEEDS_VEIN: &str = "Dependencies exported but no slice";
const INJECTION_DONE: &str = "Injection done";

/// Outcome reported by the slice extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceStatus {
    /// Slice and its dependencies were exported.
    Sliced,
    /// Dependencies exported but the organ needs auxiliary scaffolding (a "vein").
    NeedsVein,
}

/// Trailer of the host injector report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InjectionTrailer {
    /// Average cyclomatic complexity after injection
    pub avg_cc: i64,
    /// Application classes after injection
    pub classes: i64,
}

fn from_end<'a>(lines: &[&'a str], offset: usize) -> Option<&'a str> {
    lines.len().checked_sub(offset).map(|i| lines[i])
}

/// Status marker on the second-to-last line of the slice extractor's report.
pub(crate) fn parse_slice_status(lines: &[&str]) -> Option<SliceStatus> {
    let line = from_end(lines, 2)?;
    if line.contains(SLICE_WITH_SLICE) {
        Some(SliceStatus::Sliced)
    } else if line.contains(SLICE_NEEDS_VEIN) {
        Some(SliceStatus::NeedsVein)
    } else {
        None
    }
}

/// The template injector reports completion on the third-to-last line.
pub(crate) fn template_injection_done(lines: &[&str]) -> bool {
    lines.len() >= 3 && from_end(lines, 3).is_some_and(|l| l.contains(INJECTION_DONE))
}

/// Parse the injector's trailer:
///
/// ```text
/// AVG CC final :<n>
/// The number of Application classes at the end is <n>
/// Injection done :)
/// ```
pub(crate) fn parse_injection_trailer(tool: &str, lines: &[&str]) -> Result<InjectionTrailer, OracleError> {
    let tail = || {
        let start = lines.len().saturating_sub(4);
        lines[start..].join(" | ")
    };

    if lines.len() < 4 || !from_end(lines, 2).is_some_and(|l| l.contains(INJECTION_DONE)) {
        return Err(OracleError::malformed(
            tool,
            format!("missing completion marker in [{}]", tail()),
        ));
    }

    let avg_cc = from_end(lines, 4)
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse::<i64>().ok())
        .ok_or_else(|| OracleError::malformed(tool, format!("bad average CC in [{}]", tail())))?;

    let classes = from_end(lines, 3)
        .and_then(|l| l.trim_end().split(' ').next_back())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .ok_or_else(|| OracleError::malformed(tool, format!("bad class count in [{}]", tail())))?;

    Ok(InjectionTrailer { avg_cc, classes })
}

/// Average CC printed by the complexity calculator on its second-to-last line
/// (`AVG found :<value>`).
pub(crate) fn parse_avg_cc(lines: &[&str]) -> Option<f64> {
    from_end(lines, 2)?
        .split(':')
        .nth(1)?
        .trim()
        .parse::<f64>()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(s: &str) -> Vec<&str> {
        s.split('\n').collect()
    }

    #[test]
    fn test_slice_status() {
        let out = "Extracting...\nNow writing files into folder x :) \nDependencies exported and slice\n";
        assert_eq!(parse_slice_status(&lines(out)), Some(SliceStatus::Sliced));

        let out = "Extracting...\nDependencies exported but no slice\n";
        assert_eq!(parse_slice_status(&lines(out)), Some(SliceStatus::NeedsVein));

        let out = "Sorry, it was not possible to retrieve the intended feature from this application :( \n";
        assert_eq!(parse_slice_status(&lines(out)), None);
        assert_eq!(parse_slice_status(&lines("")), None);
    }

    #[test]
    fn test_template_injection_done() {
        assert!(template_injection_done(&lines("a\nInjection done :) \nexcluded\n")));
        assert!(!template_injection_done(&lines("a\nb\nInjection done :) \n")));
        assert!(!template_injection_done(&lines("")));
    }

    #[test]
    fn test_injection_trailer() {
        let out = "Configuring the framework..\nAVG CC final :7\nThe number of Application classes at the end is 123\nInjection done :) \n";
        let trailer = parse_injection_trailer("injector", &lines(out)).unwrap();
        assert_eq!(trailer, InjectionTrailer { avg_cc: 7, classes: 123 });
    }

    #[test]
    fn test_injection_trailer_missing_marker() {
        let out = "AVG CC final :7\nThe number of Application classes at the end is 123\nERROR: Injection of goodware x was not possible\n";
        let err = parse_injection_trailer("injector", &lines(out)).unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("missing completion marker"));
    }

    #[test]
    fn test_injection_trailer_bad_numbers() {
        let out = "AVG CC final :seven\nThe number of Application classes at the end is 123\nInjection done :) \n";
        assert!(parse_injection_trailer("injector", &lines(out)).is_err());
        let out = "x\nAVG CC final :7\nclasses: many\nInjection done :) \n";
        assert!(parse_injection_trailer("injector", &lines(out)).is_err());
    }

    #[test]
    fn test_parse_avg_cc() {
        assert_eq!(parse_avg_cc(&lines("Now calculating...\nAVG found :3.5\n")), Some(3.5));
        assert_eq!(parse_avg_cc(&lines("crashed\n")), None);
    }
}
