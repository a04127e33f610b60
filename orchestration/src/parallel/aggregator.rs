//! Fan-in aggregation of per-domain results.

use super::layer_executor::DomainResult;

/// Folded view over a set of domain results.
#[derive(Debug, Clone, Default)]
pub struct Aggregated {
    /// Union of modified files, deduplicated, first-seen order.
    pub files_modified: Vec<String>,
    /// AND of every domain's test outcome; false when empty.
    pub all_tests_passed: bool,
    /// Sum of budget spent across domains.
    pub total_budget_used: f64,
    pub failed_domains: Vec<String>,
    pub has_failures: bool,
}

/// Aggregate domain results: union files (stable dedup), AND tests, sum
/// budget, collect failures.
pub fn aggregate_results(results: &[DomainResult]) -> Aggregated {
    let mut files_modified = Vec::new();
    let mut failed_domains = Vec::new();
    let mut total_budget_used = 0.0;
    let mut all_tests_passed = !results.is_empty();

    for result in results {
        for file in &result.files_modified {
            if !files_modified.contains(file) {
                files_modified.push(file.clone());
            }
        }
        total_budget_used += result.budget_used;
        if !result.tests_passed {
            all_tests_passed = false;
        }
        if !result.success {
            failed_domains.push(result.domain.clone());
        }
    }

    Aggregated {
        files_modified,
        all_tests_passed,
        total_budget_used,
        has_failures: !failed_domains.is_empty(),
        failed_domains,
    }
}
