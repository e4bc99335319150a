//! Quality assessment of one design attempt.

use serde::{Deserialize, Serialize};

use crate::core::router::{REFINE_THRESHOLD, SUCCESS_THRESHOLD};

pub const GEOMETRIC_WEIGHT: f64 = 0.4;
pub const SEMANTIC_WEIGHT: f64 = 0.4;
pub const REVIEWER_WEIGHT: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    /// Which assessment raised the issue (`geometric`, `semantic`, `reviewer`).
    pub source: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DesignValidationResult {
    pub is_valid: bool,
    pub geometric_score: Option<f64>,
    pub semantic_score: Option<f64>,
    pub reviewer_score: Option<f64>,
    pub overall_score: f64,
    pub issues: Vec<ValidationIssue>,
    pub should_refine: bool,
    pub suggestions: Vec<String>,
}

impl DesignValidationResult {
    /// Weighted average of the sub-scores that are present.
    ///
    /// Weights of missing sub-scores are dropped and the rest renormalized;
    /// with no sub-scores at all the score is 0.
    pub fn calculate_overall_score(&self) -> f64 {
        let weighted = [
            (self.geometric_score, GEOMETRIC_WEIGHT),
            (self.semantic_score, SEMANTIC_WEIGHT),
            (self.reviewer_score, REVIEWER_WEIGHT),
        ];
        let (sum, total_weight) = weighted
            .iter()
            .filter_map(|(score, weight)| score.map(|s| (s.clamp(0.0, 1.0) * weight, *weight)))
            .fold((0.0, 0.0), |(sum, total), (value, weight)| {
                (sum + value, total + weight)
            });
        if total_weight == 0.0 {
            return 0.0;
        }
        sum / total_weight
    }

    /// Recompute `overall_score`, `should_refine` and `is_valid` from the
    /// sub-scores and issues. `should_refine` matches the router's refine band.
    pub fn finalize(&mut self, execution_succeeded: bool) {
        self.overall_score = self.calculate_overall_score();
        self.should_refine =
            (REFINE_THRESHOLD..SUCCESS_THRESHOLD).contains(&self.overall_score);
        self.is_valid = execution_succeeded && !self.has_blocking_issues();
    }

    pub fn push_issue(&mut self, severity: Severity, source: &str, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity,
            source: source.to_string(),
            message: message.into(),
        });
    }

    /// True if any issue is `error` or `critical`.
    pub fn has_blocking_issues(&self) -> bool {
        self.issues
            .iter()
            .any(|issue| issue.severity >= Severity::Error)
    }

    /// Issues and suggestions rendered as feedback for the next attempt.
    pub fn feedback(&self) -> String {
        let mut lines = Vec::new();
        for issue in &self.issues {
            let severity = match issue.severity {
                Severity::Info => "info",
                Severity::Warning => "warning",
                Severity::Error => "error",
                Severity::Critical => "critical",
            };
            lines.push(format!("- [{severity}] {}: {}", issue.source, issue.message));
        }
        for suggestion in &self.suggestions {
            lines.push(format!("- suggestion: {suggestion}"));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(g: Option<f64>, s: Option<f64>, r: Option<f64>) -> DesignValidationResult {
        DesignValidationResult {
            geometric_score: g,
            semantic_score: s,
            reviewer_score: r,
            ..DesignValidationResult::default()
        }
    }

    #[test]
    fn weighted_score_of_all_three() {
        let score = scores(Some(0.8), Some(0.9), Some(0.85)).calculate_overall_score();
        assert!((score - 0.85).abs() < 1e-9);
        assert!((0.8..=0.9).contains(&score));
    }

    #[test]
    fn two_scores_renormalize_to_plain_average() {
        let score = scores(Some(0.6), Some(0.9), None).calculate_overall_score();
        assert!((score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn single_score_stands_alone_and_none_is_zero() {
        assert!((scores(None, None, Some(0.3)).calculate_overall_score() - 0.3).abs() < 1e-9);
        assert_eq!(scores(None, None, None).calculate_overall_score(), 0.0);
    }

    #[test]
    fn out_of_range_scores_are_clamped() {
        let score = scores(Some(1.7), Some(-0.2), None).calculate_overall_score();
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn finalize_sets_refine_only_between_thresholds() {
        let mut result = scores(Some(0.6), Some(0.6), Some(0.6));
        result.finalize(true);
        assert!(result.should_refine);
        assert!(result.is_valid);

        let mut result = scores(Some(0.9), Some(0.9), Some(0.9));
        result.finalize(true);
        assert!(!result.should_refine);

        let mut result = scores(Some(0.3), Some(0.3), None);
        result.finalize(true);
        assert!(!result.should_refine);

        let mut result = scores(Some(0.4), Some(0.4), Some(0.4));
        result.finalize(true);
        assert!(result.should_refine, "{}", result.overall_score);

        let mut result = scores(Some(0.2), Some(0.2), Some(0.2));
        result.finalize(true);
        assert!(!result.should_refine, "{}", result.overall_score);
    }

    #[test]
    fn blocking_issue_makes_result_invalid() {
        let mut result = scores(Some(0.9), Some(0.9), Some(0.9));
        result.push_issue(Severity::Warning, "reviewer", "magic numbers");
        result.finalize(true);
        assert!(result.is_valid);

        result.push_issue(Severity::Critical, "geometric", "no solid produced");
        result.finalize(true);
        assert!(!result.is_valid);
        assert!(result.feedback().contains("- [critical] geometric: no solid produced"));
    }
}
