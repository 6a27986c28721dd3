//! Critical-issue extraction and the refinement stop decision.

use crate::config::RefinementConfig;

/// Outcome of one convergence check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergenceDecision {
    pub converged: bool,
    pub reason: String,
}

impl ConvergenceDecision {
    fn stop(reason: impl Into<String>) -> Self {
        Self {
            converged: true,
            reason: reason.into(),
        }
    }

    fn continue_with(reason: impl Into<String>) -> Self {
        Self {
            converged: false,
            reason: reason.into(),
        }
    }
}

/// Collects critique lines that mention a critical keyword, renumbered as
/// `Issue N: <line>`.
///
/// Returns `None` for blank input or when fewer than
/// `min_critical_issues` lines match.
pub fn extract_critical_issues(critique: Option<&str>, config: &RefinementConfig) -> Option<String> {
    let critique = critique.filter(|c| !c.trim().is_empty())?;
    let keywords: Vec<String> = config
        .critical_keywords
        .iter()
        .map(|k| k.to_uppercase())
        .filter(|k| !k.is_empty())
        .collect();

    let hits: Vec<&str> = critique
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| {
            let upper = line.to_uppercase();
            keywords.iter().any(|k| upper.contains(k.as_str()))
        })
        .collect();

    if hits.is_empty() || hits.len() < config.min_critical_issues {
        return None;
    }
    Some(
        hits.iter()
            .enumerate()
            .map(|(i, line)| format!("Issue {}: {line}", i + 1))
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

/// Number of outstanding issues in an issue summary.
///
/// Lines carrying an `Issue N:` marker are counted; text without markers
/// counts each non-empty line.
pub fn count_issues(summary: &str) -> usize {
    let marked = summary.lines().filter(|line| has_issue_marker(line)).count();
    if marked > 0 {
        marked
    } else {
        summary.lines().filter(|line| !line.trim().is_empty()).count()
    }
}

fn has_issue_marker(line: &str) -> bool {
    line.match_indices("Issue ").any(|(idx, marker)| {
        let rest = &line[idx + marker.len()..];
        let digits = rest.chars().take_while(char::is_ascii_digit).count();
        digits > 0 && rest[digits..].starts_with(':')
    })
}

/// Decides whether the refinement loop should stop.
///
/// Equal issue counts stop the loop, so the loop cannot oscillate.
pub fn check_convergence(current: Option<&str>, previous: Option<&str>) -> ConvergenceDecision {
    let Some(current) = current else {
        return ConvergenceDecision::stop("No critical issues remain; converged");
    };
    let Some(previous) = previous else {
        return ConvergenceDecision::continue_with("First iteration; continuing refinement");
    };

    let before = count_issues(previous);
    let after = count_issues(current);
    if after < before {
        ConvergenceDecision::continue_with(format!(
            "Progress detected: issue count {before} → {after}; continuing"
        ))
    } else {
        ConvergenceDecision::stop(format!(
            "No progress: issue count {before} → {after} did not decrease; stopping"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_current_issues_converges() {
        let decision = check_convergence(None, Some("Issue 1: old"));
        assert!(decision.converged);
        assert!(decision.reason.contains("No critical issues"));
    }

    #[test]
    fn first_iteration_continues() {
        let decision = check_convergence(Some("Issue 1: something"), None);
        assert!(!decision.converged);
        assert!(decision.reason.contains("First iteration"));
    }

    #[test]
    fn fewer_issues_is_progress() {
        let previous = "Issue 1: Problem A\nIssue 2: Problem B\nIssue 3: Problem C";
        let current = "Issue 1: Problem A";
        let decision = check_convergence(Some(current), Some(previous));
        assert!(!decision.converged);
        assert!(decision.reason.contains("Progress detected"));
        assert!(decision.reason.contains("3 → 1"));
    }

    #[test]
    fn more_issues_is_no_progress() {
        let previous = "\n    Issue 1: Problem A\n    Issue 2: Problem B\n";
        let current = "Issue 1: X\nIssue 2: Y\nIssue 3: Z";
        let decision = check_convergence(Some(current), Some(previous));
        assert!(decision.converged);
        assert!(decision.reason.contains("No progress"));
        assert!(decision.reason.contains("2 → 3"));
    }

    #[test]
    fn equal_counts_stop_the_loop() {
        let decision = check_convergence(Some("Issue 1: X\nIssue 2: Y"), Some("Issue 1: A\nIssue 2: B"));
        assert!(decision.converged);
        assert!(decision.reason.contains("No progress"));
    }

    #[test]
    fn unmarked_text_counts_non_empty_lines() {
        assert_eq!(count_issues("first\n\nsecond\n"), 2);
        assert_eq!(count_issues("Issue 1: a\nnote\nIssue 2: b"), 2);
        assert_eq!(count_issues("Issue one: not a marker"), 1);
    }

    #[test]
    fn extraction_keeps_keyword_lines_only() {
        let critique = "
            Issue 1: API Gateway - Technology Choice (Kong)
            Problem: Kong is a heavy solution.
            CRITICAL: Missing authentication validation in WebSocket server.
            This is a SECURITY vulnerability that must be fixed immediately.
            ERROR: The code uses the wrong CRDT library.
            This is INCORRECT and will cause data corruption.
        ";
        let issues = extract_critical_issues(Some(critique), &RefinementConfig::default()).expect("issues");
        assert_eq!(count_issues(&issues), 4);
        assert!(issues.starts_with("Issue 1: CRITICAL"));
        assert!(issues.contains("ERROR"));
        assert!(!issues.contains("Kong"));
    }

    #[test]
    fn positive_feedback_has_no_issues() {
        let critique = "The implementation looks good overall.\nSome minor suggestions:\n- Consider adding comments";
        assert!(extract_critical_issues(Some(critique), &RefinementConfig::default()).is_none());
    }

    #[test]
    fn blank_or_missing_critique_has_no_issues() {
        let config = RefinementConfig::default();
        assert!(extract_critical_issues(Some(""), &config).is_none());
        assert!(extract_critical_issues(None, &config).is_none());
    }

    #[test]
    fn lowercase_keywords_match() {
        let issues = extract_critical_issues(
            Some("This is a critical bug that needs fixing."),
            &RefinementConfig::default(),
        )
        .expect("issues");
        assert!(issues.to_lowercase().contains("critical"));
    }

    #[test]
    fn min_critical_issues_threshold_applies() {
        let config = RefinementConfig {
            min_critical_issues: 2,
            ..RefinementConfig::default()
        };
        assert!(extract_critical_issues(Some("CRITICAL: one thing"), &config).is_none());
        assert!(extract_critical_issues(Some("CRITICAL: one\nERROR: two"), &config).is_some());
    }
}
