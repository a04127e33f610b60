//! Cross-domain conflict detection.
//!
//! After a fan-out, file conflicts are files touched by more than one
//! domain (warning severity); schema conflicts are simultaneous
//! migrations from two domains and API conflicts are shared API-shaped
//! files (both blocking).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::layer_executor::DomainResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictType {
    File,
    Schema,
    Api,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    Blocking,
    Warning,
    None,
}

/// Result of cross-domain conflict detection.
#[derive(Debug, Clone)]
pub struct ConflictResult {
    pub has_conflicts: bool,
    /// File path → domains that modified it (file conflicts only).
    pub conflicting_files: HashMap<String, Vec<String>>,
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub schema_conflicts: Vec<String>,
    pub api_conflicts: Vec<String>,
}

const MIGRATION_MARKERS: &[&str] = &["migration", "schema", ".sql", "alembic"];
const API_MARKERS: &[&str] = &["api", "endpoint", "route", "controller", "openapi", "swagger"];

fn file_domains(results: &[DomainResult]) -> HashMap<&str, Vec<&str>> {
    let mut map: HashMap<&str, Vec<&str>> = HashMap::new();
    for result in results {
        for file in &result.files_modified {
            let domains = map.entry(file.as_str()).or_default();
            if !domains.contains(&result.domain.as_str()) {
                domains.push(&result.domain);
            }
        }
    }
    map
}

/// Files modified by more than one domain.
pub fn detect_file_conflicts(results: &[DomainResult]) -> Vec<String> {
    let mut conflicts: Vec<String> = file_domains(results)
        .into_iter()
        .filter(|(_, domains)| domains.len() > 1)
        .map(|(file, _)| file.to_string())
        .collect();
    conflicts.sort();
    conflicts
}

/// Migration/schema changes coming from more than one domain at once.
pub fn detect_schema_conflicts(results: &[DomainResult]) -> Vec<String> {
    let with_migrations: Vec<&str> = results
        .iter()
        .filter(|result| {
            result.files_modified.iter().any(|file| {
                let lower = file.to_lowercase();
                MIGRATION_MARKERS.iter().any(|marker| lower.contains(marker))
            })
        })
        .map(|result| result.domain.as_str())
        .collect();

    let mut conflicts = Vec::new();
    for (i, a) in with_migrations.iter().enumerate() {
        for b in &with_migrations[i + 1..] {
            conflicts.push(format!("Schema conflict: {a} and {b} both have migrations"));
        }
    }
    conflicts
}

/// API-shaped files shared between domains.
pub fn detect_api_conflicts(results: &[DomainResult]) -> Vec<String> {
    let mut shared: HashMap<&str, Vec<&str>> = HashMap::new();
    for result in results {
        for file in &result.files_modified {
            let lower = file.to_lowercase();
            if API_MARKERS.iter().any(|marker| lower.contains(marker)) {
                let domains = shared.entry(file.as_str()).or_default();
                if !domains.contains(&result.domain.as_str()) {
                    domains.push(&result.domain);
                }
            }
        }
    }

    let mut conflicts: Vec<String> = shared
        .into_iter()
        .filter(|(_, domains)| domains.len() > 1)
        .map(|(file, domains)| format!("API conflict: {file} modified by {}", domains.join(", ")))
        .collect();
    conflicts.sort();
    conflicts
}

/// Run every conflict check and classify the combined outcome.
pub fn check_cross_domain_conflicts(results: &[DomainResult]) -> ConflictResult {
    let file_conflicts = detect_file_conflicts(results);
    let schema_conflicts = detect_schema_conflicts(results);
    let api_conflicts = detect_api_conflicts(results);

    let mut conflicting_files: HashMap<String, Vec<String>> = HashMap::new();
    for (file, domains) in file_domains(results) {
        if domains.len() > 1 {
            conflicting_files.insert(
                file.to_string(),
                domains.into_iter().map(String::from).collect(),
            );
        }
    }

    let has_conflicts =
        !file_conflicts.is_empty() || !schema_conflicts.is_empty() || !api_conflicts.is_empty();

    let (conflict_type, severity) = if !schema_conflicts.is_empty() {
        (ConflictType::Schema, ConflictSeverity::Blocking)
    } else if !api_conflicts.is_empty() {
        (ConflictType::Api, ConflictSeverity::Blocking)
    } else if !file_conflicts.is_empty() {
        (ConflictType::File, ConflictSeverity::Warning)
    } else {
        (ConflictType::None, ConflictSeverity::None)
    };

    ConflictResult {
        has_conflicts,
        conflicting_files,
        conflict_type,
        severity,
        schema_conflicts,
        api_conflicts,
    }
}
