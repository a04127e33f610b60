//! Layer-by-layer concurrent domain execution.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::safety::emergency_stop;

use super::aggregator::aggregate_results;
use super::dependency_sort::compute_execution_layers;
use super::{ParallelError, ParallelResult};

/// Outcome of one domain's execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainResult {
    pub domain: String,
    pub success: bool,
    pub files_modified: Vec<String>,
    pub tests_passed: bool,
    pub budget_used: f64,
    pub error: Option<String>,
    /// Critical domains stop the run when they fail.
    pub critical: bool,
}

impl DomainResult {
    pub fn failure(domain: &str, error: &str, critical: bool) -> Self {
        Self {
            domain: domain.to_string(),
            success: false,
            files_modified: Vec::new(),
            tests_passed: false,
            budget_used: 0.0,
            error: Some(error.to_string()),
            critical,
        }
    }
}

/// Capability that runs one domain's work for a story.
#[async_trait]
pub trait DomainExecutor: Send + Sync {
    async fn execute_domain(&self, domain: &str, story_id: &str) -> DomainResult;
}

/// Final state of a parallel run.
#[derive(Debug, Clone)]
pub struct ParallelOutcome {
    pub layers: Vec<Vec<String>>,
    pub domain_results: Vec<DomainResult>,
    pub aggregated_files: Vec<String>,
    pub all_tests_passed: bool,
    pub total_budget_used: f64,
    pub failed_domains: Vec<String>,
    /// A non-critical domain failed but the run continued.
    pub partial_failure: bool,
    /// False when a critical failure stopped remaining layers.
    pub completed_all_layers: bool,
}

/// Domains whose failure stops the run outright.
pub const DEFAULT_CRITICAL_DOMAINS: [&str; 3] = ["auth", "payments", "data"];

/// Fans domains out layer by layer through a [`DomainExecutor`].
pub struct ParallelExecutor {
    executor: Arc<dyn DomainExecutor>,
    critical_domains: HashSet<String>,
}

impl ParallelExecutor {
    pub fn new(executor: Arc<dyn DomainExecutor>) -> Self {
        Self {
            executor,
            critical_domains: DEFAULT_CRITICAL_DOMAINS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn with_critical_domains(mut self, domains: &[&str]) -> Self {
        self.critical_domains = domains.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Execute every domain of a story respecting the dependency graph.
    ///
    /// Each layer's members run concurrently; the run waits for the whole
    /// layer before folding results and moving on. A failed non-critical
    /// domain flags `partial_failure` and the run continues; a failed
    /// critical domain stops further layers.
    pub async fn run(
        &self,
        domains: &[String],
        dependencies: &HashMap<String, Vec<String>>,
        story_id: &str,
    ) -> ParallelResult<ParallelOutcome> {
        let layers = compute_execution_layers(domains, dependencies)?;
        let mut results: Vec<DomainResult> = Vec::new();
        let mut completed_all_layers = true;

        'layers: for (index, layer) in layers.iter().enumerate() {
            if emergency_stop::is_active() {
                return Err(ParallelError::EmergencyStop(emergency_stop::reason()));
            }

            info!(story_id, layer = index, domains = ?layer, "Executing layer");
            let futures = layer
                .iter()
                .map(|domain| self.executor.execute_domain(domain, story_id));
            let mut layer_results = join_all(futures).await;

            for result in &mut layer_results {
                result.critical =
                    result.critical || self.critical_domains.contains(&result.domain);
            }

            let critical_failure = layer_results
                .iter()
                .find(|result| !result.success && result.critical)
                .map(|result| result.domain.clone());
            for result in &layer_results {
                if !result.success {
                    warn!(
                        story_id,
                        domain = %result.domain,
                        critical = result.critical,
                        error = result.error.as_deref().unwrap_or("unknown"),
                        "Domain failed"
                    );
                }
            }
            results.extend(layer_results);

            if let Some(domain) = critical_failure {
                warn!(story_id, domain = %domain, "Critical domain failed, stopping run");
                if index + 1 < layers.len() {
                    completed_all_layers = false;
                }
                break 'layers;
            }
        }

        let aggregated = aggregate_results(&results);
        let partial_failure = aggregated.has_failures;

        Ok(ParallelOutcome {
            layers,
            domain_results: results,
            aggregated_files: aggregated.files_modified,
            all_tests_passed: aggregated.all_tests_passed,
            total_budget_used: aggregated.total_budget_used,
            failed_domains: aggregated.failed_domains,
            partial_failure,
            completed_all_layers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedExecutor {
        /// Domains that should fail.
        failing: HashSet<String>,
        /// Observed execution order with layer boundaries visible via
        /// concurrent in-flight counting.
        log: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn new(failing: &[&str]) -> Self {
            Self {
                failing: failing.iter().map(|s| s.to_string()).collect(),
                log: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DomainExecutor for ScriptedExecutor {
        async fn execute_domain(&self, domain: &str, _story_id: &str) -> DomainResult {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.log.lock().unwrap().push(domain.to_string());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.failing.contains(domain) {
                DomainResult::failure(domain, "scripted failure", false)
            } else {
                DomainResult {
                    domain: domain.to_string(),
                    success: true,
                    files_modified: vec![format!("src/{domain}.ts"), "src/shared.ts".to_string()],
                    tests_passed: true,
                    budget_used: 1.0,
                    error: None,
                    critical: false,
                }
            }
        }
    }

    fn domains(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_fan_out_respects_layers() {
        let scripted = Arc::new(ScriptedExecutor::new(&[]));
        let executor = ParallelExecutor::new(Arc::clone(&scripted) as _);

        let mut dependencies = HashMap::new();
        dependencies.insert(
            "qa".to_string(),
            vec!["fe".to_string(), "be".to_string()],
        );

        let outcome = executor
            .run(&domains(&["fe", "be", "qa"]), &dependencies, "S-1")
            .await
            .unwrap();

        assert_eq!(
            outcome.layers,
            vec![
                vec!["be".to_string(), "fe".to_string()],
                vec!["qa".to_string()]
            ]
        );
        // fe and be ran concurrently; qa only after both.
        assert_eq!(scripted.max_in_flight.load(Ordering::SeqCst), 2);
        let log = scripted.log.lock().unwrap();
        assert_eq!(log.last().map(String::as_str), Some("qa"));

        // Aggregation is the deduplicated union.
        assert_eq!(
            outcome.aggregated_files.len(),
            4,
            "three per-domain files plus one shared"
        );
        assert!(outcome.all_tests_passed);
        assert!((outcome.total_budget_used - 3.0).abs() < 1e-9);
        assert!(outcome.completed_all_layers);
    }

    #[tokio::test]
    async fn test_non_critical_failure_continues() {
        let scripted = Arc::new(ScriptedExecutor::new(&["fe"]));
        let executor = ParallelExecutor::new(Arc::clone(&scripted) as _);

        let mut dependencies = HashMap::new();
        dependencies.insert("qa".to_string(), vec!["fe".to_string()]);

        let outcome = executor
            .run(&domains(&["fe", "qa"]), &dependencies, "S-1")
            .await
            .unwrap();

        assert!(outcome.partial_failure);
        assert_eq!(outcome.failed_domains, vec!["fe"]);
        assert!(outcome.completed_all_layers);
        // qa still ran.
        assert!(scripted.log.lock().unwrap().contains(&"qa".to_string()));
    }

    #[tokio::test]
    async fn test_critical_failure_stops_remaining_layers() {
        let scripted = Arc::new(ScriptedExecutor::new(&["auth"]));
        let executor = ParallelExecutor::new(Arc::clone(&scripted) as _);

        let mut dependencies = HashMap::new();
        dependencies.insert("qa".to_string(), vec!["auth".to_string()]);

        let outcome = executor
            .run(&domains(&["auth", "qa"]), &dependencies, "S-1")
            .await
            .unwrap();

        assert!(!outcome.completed_all_layers);
        assert_eq!(outcome.failed_domains, vec!["auth"]);
        // qa never ran.
        assert!(!scripted.log.lock().unwrap().contains(&"qa".to_string()));
    }

    #[tokio::test]
    async fn test_cycle_is_an_error() {
        let scripted = Arc::new(ScriptedExecutor::new(&[]));
        let executor = ParallelExecutor::new(scripted as _);

        let mut dependencies = HashMap::new();
        dependencies.insert("a".to_string(), vec!["b".to_string()]);
        dependencies.insert("b".to_string(), vec!["a".to_string()]);

        assert!(matches!(
            executor.run(&domains(&["a", "b"]), &dependencies, "S-1").await,
            Err(ParallelError::CircularDependency(_))
        ));
    }
}
