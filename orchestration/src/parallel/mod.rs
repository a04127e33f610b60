//! Dependency-aware parallel domain execution.
//!
//! Domains are topologically layered so that every layer's members
//! depend only on earlier layers; each layer fans out concurrently and
//! its results are folded into the running state before the next layer
//! starts.

mod aggregator;
mod conflict_detector;
mod dependency_sort;
mod layer_executor;

pub use aggregator::{aggregate_results, Aggregated};
pub use conflict_detector::{
    check_cross_domain_conflicts, ConflictResult, ConflictSeverity, ConflictType,
};
pub use dependency_sort::{
    compute_execution_layers, topological_sort, validate_dependencies, DependencyValidation,
};
pub use layer_executor::{DomainExecutor, DomainResult, ParallelExecutor, ParallelOutcome};

/// Error type for parallel execution
#[derive(Debug, thiserror::Error)]
pub enum ParallelError {
    #[error("Circular dependency detected in domains: {0}")]
    CircularDependency(String),

    #[error("Invalid dependency graph: {0}")]
    InvalidGraph(String),

    #[error("Emergency stop active: {0}")]
    EmergencyStop(String),
}

/// Result type for parallel execution
pub type ParallelResult<T> = Result<T, ParallelError>;
