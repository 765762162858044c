//! Thresholds and the category-to-strategy table.

use draftgate_store::ReprocessStrategy;
use std::collections::BTreeSet;

use crate::traits::{StepArtifact, ValidationReport};

/// A category sub-score below this value marks the category as failing.
pub const CATEGORY_PASS_THRESHOLD: f64 = 80.0;

/// A non-improving score more than this far below target counts as stalled.
pub const STALL_TARGET_MARGIN: f64 = 10.0;

/// Number of trailing scores the plateau check looks at.
pub const PLATEAU_WINDOW: usize = 3;

/// Minimum mean per-iteration improvement across the plateau window.
pub const PLATEAU_MIN_MEAN_DELTA: f64 = 2.0;

/// How a failing category wants its items redone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryPolicy {
    /// The whole artifact must be rebuilt when this category fails.
    FullReprocess,
    /// Only the failing items need another pass.
    IncrementalFix,
    /// Redo everything that has not been locked yet.
    TargetedReprocess,
}

/// Static policy table. Unknown categories get the conservative middle
/// ground: reprocess whatever is not locked.
pub fn category_policy(category: &str) -> CategoryPolicy {
    match category {
        "structure" | "layout" | "ordering" => CategoryPolicy::FullReprocess,
        "formatting" | "completeness" | "clarity" | "grammar" => CategoryPolicy::IncrementalFix,
        _ => CategoryPolicy::TargetedReprocess,
    }
}

/// Textual guidance attached to the next input for a failing category.
pub fn guidance_for(category: &str) -> String {
    match category {
        "structure" => "Rebuild the artifact with the required section order.".to_string(),
        "layout" => "Rebalance item placement; keep locked items where they are.".to_string(),
        "ordering" => "Reorder items into the expected sequence.".to_string(),
        "formatting" => "Fix formatting on the listed items only.".to_string(),
        "completeness" => "Fill in the missing content for the listed items.".to_string(),
        "clarity" => "Rewrite the listed items for readability.".to_string(),
        "grammar" => "Correct grammar in the listed items.".to_string(),
        other => format!("Improve the '{other}' quality of the unlocked items."),
    }
}

/// Categories whose sub-score falls below the pass threshold.
pub fn failing_categories(report: &ValidationReport) -> Vec<String> {
    report
        .categories
        .iter()
        .filter(|(_, score)| **score < CATEGORY_PASS_THRESHOLD)
        .map(|(name, _)| name.clone())
        .collect()
}

/// Item ids referenced by the report's issues. A failure signal with no
/// item ids marks the entire artifact as failing (conservative fallback);
/// a clean report marks nothing.
pub fn failing_items(report: &ValidationReport, artifact: &StepArtifact) -> BTreeSet<String> {
    let tagged: BTreeSet<String> = report
        .issues
        .iter()
        .filter_map(|i| i.item_id.clone())
        .collect();
    if !tagged.is_empty() {
        return tagged;
    }
    if report.issues.is_empty() && failing_categories(report).is_empty() {
        return BTreeSet::new();
    }
    artifact.item_ids()
}

/// Pick the reprocessing strategy for the next iteration.
///
/// Any full-reprocess category forces a full rebuild; when every category
/// can be fixed incrementally, only failing items are forwarded; otherwise
/// everything not yet locked goes back through.
pub fn select_strategy(failing: &[String]) -> ReprocessStrategy {
    let policies: Vec<CategoryPolicy> = failing.iter().map(|c| category_policy(c)).collect();
    if policies
        .iter()
        .any(|p| *p == CategoryPolicy::FullReprocess)
    {
        ReprocessStrategy::FullReprocess
    } else if !policies.is_empty()
        && policies.iter().all(|p| *p == CategoryPolicy::IncrementalFix)
    {
        ReprocessStrategy::IncrementalFix
    } else {
        ReprocessStrategy::TargetedReprocess
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{ContentItem, ValidationIssue};
    use std::collections::BTreeMap;

    fn artifact() -> StepArtifact {
        StepArtifact::new(vec![
            ContentItem {
                id: "a".into(),
                content: "one".into(),
            },
            ContentItem {
                id: "b".into(),
                content: "two".into(),
            },
        ])
    }

    #[test]
    fn test_failing_categories_threshold() {
        let report = ValidationReport {
            score: 75.0,
            categories: BTreeMap::from([
                ("formatting".to_string(), 79.9),
                ("clarity".to_string(), 80.0),
                ("structure".to_string(), 40.0),
            ]),
            issues: vec![],
        };
        let mut failing = failing_categories(&report);
        failing.sort();
        assert_eq!(failing, vec!["formatting".to_string(), "structure".to_string()]);
    }

    #[test]
    fn test_failing_items_from_tagged_issues() {
        let report = ValidationReport {
            score: 60.0,
            categories: BTreeMap::new(),
            issues: vec![ValidationIssue {
                category: "formatting".into(),
                message: "ragged line".into(),
                item_id: Some("b".into()),
            }],
        };
        let failing = failing_items(&report, &artifact());
        assert_eq!(failing, BTreeSet::from(["b".to_string()]));
    }

    #[test]
    fn test_untagged_issues_fail_whole_artifact() {
        let report = ValidationReport {
            score: 60.0,
            categories: BTreeMap::new(),
            issues: vec![ValidationIssue {
                category: "structure".into(),
                message: "sections out of order".into(),
                item_id: None,
            }],
        };
        let failing = failing_items(&report, &artifact());
        assert_eq!(failing, artifact().item_ids());
    }

    #[test]
    fn test_no_issues_no_failing_items() {
        let report = ValidationReport::default();
        assert!(failing_items(&report, &artifact()).is_empty());
    }

    #[test]
    fn test_strategy_full_wins() {
        let failing = vec!["formatting".to_string(), "structure".to_string()];
        assert_eq!(select_strategy(&failing), ReprocessStrategy::FullReprocess);
    }

    #[test]
    fn test_strategy_all_incremental() {
        let failing = vec!["formatting".to_string(), "grammar".to_string()];
        assert_eq!(select_strategy(&failing), ReprocessStrategy::IncrementalFix);
    }

    #[test]
    fn test_strategy_mixed_falls_back_to_targeted() {
        let failing = vec!["formatting".to_string(), "tone".to_string()];
        assert_eq!(
            select_strategy(&failing),
            ReprocessStrategy::TargetedReprocess
        );
    }

    #[test]
    fn test_unknown_category_guidance_mentions_it() {
        assert!(guidance_for("tone").contains("tone"));
    }
}
