//! Constitutional safety scoring.
//!
//! Six principles, each with a category, a severity, and regex
//! signatures. The pattern pass is authoritative: any severity-1.0 match
//! blocks outright and the advisory model is never consulted for it, so
//! the advisor can soften an ambiguous verdict but never clear a
//! critical one.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::advisor::AdvisoryModel;

/// Categories of safety concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyCategory {
    /// Irreversible actions.
    Destructive,
    /// Credential and secret exposure.
    Security,
    /// Outside allowed boundaries.
    Scope,
    /// Budget and resource violations.
    Resource,
    /// High-risk uncertain actions.
    Uncertainty,
}

/// A constitutional safety principle.
#[derive(Debug, Clone)]
pub struct SafetyPrinciple {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub category: SafetyCategory,
    /// 0.0 = informational, 1.0 = critical.
    pub severity: f64,
    pub patterns: &'static [&'static str],
}

/// The core principle set.
pub fn default_principles() -> Vec<SafetyPrinciple> {
    vec![
        SafetyPrinciple {
            id: "P001",
            name: "No Destructive Commands",
            description: "Never execute destructive commands without explicit approval",
            category: SafetyCategory::Destructive,
            severity: 1.0,
            patterns: &[
                r"rm\s+-rf",
                r"git\s+push\s+--force",
                r"git\s+push\s+-f",
                r"DROP\s+TABLE",
                r"DROP\s+DATABASE",
                r"TRUNCATE",
                r"git\s+reset\s+--hard",
                r":\s*>",
            ],
        },
        SafetyPrinciple {
            id: "P002",
            name: "No Secret Exposure",
            description: "Never expose secrets, credentials, or API keys",
            category: SafetyCategory::Security,
            severity: 1.0,
            patterns: &[
                r"API_KEY",
                r"SECRET",
                r"PASSWORD",
                r"PRIVATE_KEY",
                r"AWS_ACCESS",
                r"\.env",
                r"credentials",
                r"token\s*=",
            ],
        },
        SafetyPrinciple {
            id: "P003",
            name: "Stay In Scope",
            description: "Never modify files outside the assigned worktree",
            category: SafetyCategory::Scope,
            severity: 0.9,
            patterns: &[
                r"\.\./\.\./",
                r"/etc/",
                r"/usr/",
                r"/var/",
                r"~/\.ssh",
                r"~/\.aws",
            ],
        },
        SafetyPrinciple {
            id: "P004",
            name: "Validate Inputs",
            description: "Always validate inputs before processing",
            category: SafetyCategory::Security,
            severity: 0.7,
            patterns: &[
                r"eval\s*\(",
                r"exec\s*\(",
                r"subprocess\.call.*shell\s*=\s*True",
                r"os\.system\s*\(",
            ],
        },
        SafetyPrinciple {
            id: "P005",
            name: "Respect Budgets",
            description: "Respect token and cost budgets",
            category: SafetyCategory::Resource,
            severity: 0.8,
            // Enforced programmatically by the budget tracker.
            patterns: &[],
        },
        SafetyPrinciple {
            id: "P006",
            name: "Escalate Uncertainty",
            description: "Escalate uncertainty rather than guessing",
            category: SafetyCategory::Uncertainty,
            severity: 0.6,
            // Fired by the uncertainty heuristics and the advisor.
            patterns: &[],
        },
    ]
}

/// Escalation posture, ordered `none < warning < critical < e-stop`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EscalationLevel {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "warning")]
    Warning,
    #[serde(rename = "critical")]
    Critical,
    #[serde(rename = "e-stop")]
    EStop,
}

impl EscalationLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            EscalationLevel::None => "none",
            EscalationLevel::Warning => "warning",
            EscalationLevel::Critical => "critical",
            EscalationLevel::EStop => "e-stop",
        }
    }
}

/// What to do with the checked content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Recommendation {
    Allow,
    Warn,
    Block,
}

/// A detected safety violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyViolation {
    pub principle_id: String,
    pub principle_name: String,
    pub category: SafetyCategory,
    pub severity: f64,
    pub description: String,
    pub matched_pattern: Option<String>,
    pub context: Option<String>,
}

/// Result of a safety check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyResult {
    pub safe: bool,
    /// 0.0 = unsafe, 1.0 = fully safe.
    pub score: f64,
    pub violations: Vec<SafetyViolation>,
    pub recommendation: Recommendation,
    pub escalation: EscalationLevel,
    pub checked_at: DateTime<Utc>,
}

impl SafetyResult {
    pub fn allow() -> Self {
        Self {
            safe: true,
            score: 1.0,
            violations: Vec::new(),
            recommendation: Recommendation::Allow,
            escalation: EscalationLevel::None,
            checked_at: Utc::now(),
        }
    }
}

/// Per-story safety posture carried in the workflow state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SafetyState {
    pub violations: Vec<String>,
    pub constitutional_score: f64,
    pub escalation_level: EscalationLevel,
    pub emergency_stop: bool,
}

struct CompiledPrinciple {
    principle: SafetyPrinciple,
    regexes: Vec<regex::Regex>,
}

/// Pattern-based safety checker with an optional advisory-model hook.
pub struct ConstitutionalChecker {
    compiled: Vec<CompiledPrinciple>,
    advisor: Option<Arc<dyn AdvisoryModel>>,
}

impl ConstitutionalChecker {
    pub fn new() -> Self {
        Self::with_principles(default_principles())
    }

    pub fn with_principles(principles: Vec<SafetyPrinciple>) -> Self {
        let compiled = principles
            .into_iter()
            .map(|principle| {
                let regexes = principle
                    .patterns
                    .iter()
                    .filter_map(|pattern| {
                        match RegexBuilder::new(pattern).case_insensitive(true).build() {
                            Ok(regex) => Some(regex),
                            Err(e) => {
                                warn!(pattern, error = %e, "Skipping unparseable safety pattern");
                                None
                            }
                        }
                    })
                    .collect();
                CompiledPrinciple { principle, regexes }
            })
            .collect();
        Self {
            compiled,
            advisor: None,
        }
    }

    /// Enable the advisory-model hook for nuanced analysis.
    pub fn with_advisor(mut self, advisor: Arc<dyn AdvisoryModel>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn principles(&self) -> impl Iterator<Item = &SafetyPrinciple> {
        self.compiled.iter().map(|c| &c.principle)
    }

    /// Check content against the principle signatures. At most one
    /// violation per principle.
    pub fn check_patterns(&self, content: &str) -> Vec<SafetyViolation> {
        let mut violations = Vec::new();
        for compiled in &self.compiled {
            for regex in &compiled.regexes {
                if regex.is_match(content) {
                    violations.push(SafetyViolation {
                        principle_id: compiled.principle.id.to_string(),
                        principle_name: compiled.principle.name.to_string(),
                        category: compiled.principle.category,
                        severity: compiled.principle.severity,
                        description: compiled.principle.description.to_string(),
                        matched_pattern: Some(regex.as_str().to_string()),
                        context: Some(truncate(content, 200)),
                    });
                    break;
                }
            }
        }
        violations
    }

    /// Full safety check: the pattern pass first, then the advisory
    /// model when enabled and no pattern matched.
    ///
    /// Any severity-1.0 pattern violation blocks with `score = 0` and an
    /// e-stop escalation; the advisor is not consulted and cannot
    /// override it.
    pub async fn check(&self, content: &str, context: &str) -> SafetyResult {
        let pattern_violations = self.check_patterns(content);

        if pattern_violations.iter().any(|v| v.severity >= 1.0) {
            return SafetyResult {
                safe: false,
                score: 0.0,
                violations: pattern_violations,
                recommendation: Recommendation::Block,
                escalation: EscalationLevel::EStop,
                checked_at: Utc::now(),
            };
        }

        if pattern_violations.is_empty() {
            if let Some(advisor) = &self.advisor {
                return self.check_with_advisor(advisor.as_ref(), content, context).await;
            }
            return SafetyResult::allow();
        }

        let max_severity = pattern_violations
            .iter()
            .map(|v| v.severity)
            .fold(0.0, f64::max);
        let score = 1.0 - max_severity;
        SafetyResult {
            safe: score > 0.5,
            score,
            escalation: escalation_for(score, &pattern_violations),
            recommendation: if score > 0.3 {
                Recommendation::Warn
            } else {
                Recommendation::Block
            },
            violations: pattern_violations,
            checked_at: Utc::now(),
        }
    }

    async fn check_with_advisor(
        &self,
        advisor: &dyn AdvisoryModel,
        content: &str,
        context: &str,
    ) -> SafetyResult {
        let principles_text: Vec<String> = self
            .principles()
            .map(|p| format!("- {}: {} - {}", p.id, p.name, p.description))
            .collect();
        let prompt = format!(
            "Analyze this action for safety violations against these principles:\n\n\
             {}\n\nAction to analyze:\n{content}\n\nContext: {context}\n\n\
             Respond with:\nSAFE: YES or NO\nSCORE: 0.0 to 1.0 (1.0 = fully safe)\n\
             VIOLATIONS: List any principle IDs violated\n\
             RECOMMENDATION: ALLOW, WARN, or BLOCK\nREASON: Brief explanation\n",
            principles_text.join("\n"),
        );

        let reply = match advisor
            .query(&prompt, Some("You are a safety reviewer. Be strict and thorough."))
            .await
        {
            Ok(reply) if reply.success => reply,
            Ok(reply) => {
                warn!(error = ?reply.error, "Advisory model declined, conservative verdict");
                return conservative_result();
            }
            Err(e) => {
                warn!(error = %e, "Advisory model failed, conservative verdict");
                return conservative_result();
            }
        };

        let verdict = parse_advisor_verdict(&reply.content, &self.compiled);
        debug!(score = verdict.score, safe = verdict.safe, "Advisory verdict");
        verdict
    }
}

impl Default for ConstitutionalChecker {
    fn default() -> Self {
        Self::new()
    }
}

// On advisor failure, neither allow nor hard-block.
fn conservative_result() -> SafetyResult {
    SafetyResult {
        safe: false,
        score: 0.5,
        violations: Vec::new(),
        recommendation: Recommendation::Warn,
        escalation: EscalationLevel::Warning,
        checked_at: Utc::now(),
    }
}

/// Escalation mapping: any severity-1 violation ⇒ e-stop; score < 0.3 ⇒
/// critical; score < 0.6 or any violation ⇒ warning; else none.
pub(crate) fn escalation_for(score: f64, violations: &[SafetyViolation]) -> EscalationLevel {
    if violations.iter().any(|v| v.severity >= 1.0) {
        EscalationLevel::EStop
    } else if score < 0.3 {
        EscalationLevel::Critical
    } else if score < 0.6 || !violations.is_empty() {
        EscalationLevel::Warning
    } else {
        EscalationLevel::None
    }
}

fn truncate(content: &str, max: usize) -> String {
    if content.len() > max {
        let mut end = max;
        while !content.is_char_boundary(end) {
            end -= 1;
        }
        content[..end].to_string()
    } else {
        content.to_string()
    }
}

fn parse_advisor_verdict(response: &str, compiled: &[CompiledPrinciple]) -> SafetyResult {
    let upper = response.to_uppercase();
    let safe = upper.contains("SAFE: YES");

    let score = regex::Regex::new(r"(?i)SCORE:\s*([\d.]+)")
        .ok()
        .and_then(|re| re.captures(response))
        .and_then(|caps| caps[1].parse::<f64>().ok())
        .unwrap_or(0.5);

    let recommendation = if upper.contains("RECOMMENDATION: BLOCK") {
        Recommendation::Block
    } else if upper.contains("RECOMMENDATION: WARN") {
        Recommendation::Warn
    } else {
        Recommendation::Allow
    };

    let mut violations = Vec::new();
    if let Some(caps) = regex::Regex::new(r"(?i)VIOLATIONS:\s*([^\n]+)")
        .ok()
        .and_then(|re| re.captures(response))
    {
        let ids: Vec<&str> = regex::Regex::new(r"P\d{3}")
            .map(|re| re.find_iter(&caps[1]).map(|m| m.as_str()).collect())
            .unwrap_or_default();
        for id in ids {
            if let Some(found) = compiled.iter().find(|c| c.principle.id == id) {
                violations.push(SafetyViolation {
                    principle_id: found.principle.id.to_string(),
                    principle_name: found.principle.name.to_string(),
                    category: found.principle.category,
                    severity: found.principle.severity,
                    description: found.principle.description.to_string(),
                    matched_pattern: None,
                    context: None,
                });
            }
        }
    }

    SafetyResult {
        safe,
        score,
        escalation: escalation_for(score, &violations),
        recommendation,
        violations,
        checked_at: Utc::now(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// P006 uncertainty triggers
// ─────────────────────────────────────────────────────────────────────────────

/// Confidence below this escalates to a human.
pub const CONFIDENCE_THRESHOLD: f64 = 0.6;

/// Keywords indicating ambiguous or uncertain requirements.
pub const AMBIGUOUS_KEYWORDS: &[&str] = &[
    "maybe",
    "perhaps",
    "possibly",
    "might",
    "some kind of",
    "something like",
    "not sure",
    "tbd",
    "todo",
    "unclear",
    "ambiguous",
    "could be",
    "either",
    "or maybe",
    "not certain",
    "probably",
    "i think",
    "i guess",
    "potentially",
    "figure out",
    "to be determined",
    "decide later",
];

const UNCERTAIN_DECISIONS: &[&str] = &["unsure", "uncertain", "unclear", "unknown", "undecided"];

/// Decision context evaluated by the uncertainty triggers.
#[derive(Debug, Clone, Default)]
pub struct UncertaintySignals {
    pub confidence: Option<f64>,
    pub requirements: Option<String>,
    pub options: Vec<String>,
    pub selected: Option<String>,
    pub decision: Option<String>,
}

/// Whether P006 (Escalate Uncertainty) should fire.
///
/// Triggers: (1) confidence below [`CONFIDENCE_THRESHOLD`], (2) an
/// ambiguous keyword in the requirements, (3) more than one viable
/// option with none selected, (4) an uncertain decision label.
pub fn should_escalate_uncertainty(signals: &UncertaintySignals) -> bool {
    if signals.confidence.unwrap_or(1.0) < CONFIDENCE_THRESHOLD {
        return true;
    }

    if let Some(requirements) = &signals.requirements {
        let lower = requirements.to_lowercase();
        if AMBIGUOUS_KEYWORDS.iter().any(|keyword| lower.contains(keyword)) {
            return true;
        }
    }

    if signals.options.len() > 1 && signals.selected.is_none() {
        return true;
    }

    if let Some(decision) = &signals.decision {
        let uncertain: HashSet<&str> = UNCERTAIN_DECISIONS.iter().copied().collect();
        if uncertain.contains(decision.to_lowercase().as_str()) {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::advisor::AdvisorReply;
    use async_trait::async_trait;

    struct CannedAdvisor {
        reply: String,
    }

    #[async_trait]
    impl AdvisoryModel for CannedAdvisor {
        async fn query(
            &self,
            _prompt: &str,
            _system_prompt: Option<&str>,
        ) -> anyhow::Result<AdvisorReply> {
            Ok(AdvisorReply {
                content: self.reply.clone(),
                success: true,
                error: None,
            })
        }
    }

    #[tokio::test]
    async fn test_destructive_command_blocks_with_estop() {
        let checker = ConstitutionalChecker::new();
        let result = checker.check("rm -rf /", "story AUTH-001").await;
        assert!(!result.safe);
        assert_eq!(result.score, 0.0);
        assert_eq!(result.recommendation, Recommendation::Block);
        assert_eq!(result.escalation, EscalationLevel::EStop);
        assert!(result.violations.iter().any(|v| v.principle_id == "P001"));
    }

    #[tokio::test]
    async fn test_secret_exposure_is_critical() {
        let checker = ConstitutionalChecker::new();
        let result = checker.check("export API_KEY=abc123", "").await;
        assert_eq!(result.escalation, EscalationLevel::EStop);
        assert!(result.violations.iter().any(|v| v.principle_id == "P002"));
    }

    #[tokio::test]
    async fn test_scope_violation_warns() {
        let checker = ConstitutionalChecker::new();
        let result = checker.check("open('../../outside.txt')", "").await;
        assert!(!result.violations.is_empty());
        assert!((result.score - 0.1).abs() < 1e-9);
        assert_eq!(result.recommendation, Recommendation::Block);
        assert_eq!(result.escalation, EscalationLevel::Critical);
    }

    #[tokio::test]
    async fn test_input_validation_violation_warns() {
        let checker = ConstitutionalChecker::new();
        let result = checker.check("result = eval(user_input)", "").await;
        assert!((result.score - 0.3).abs() < 1e-9);
        assert_eq!(result.recommendation, Recommendation::Block);
        assert!(result.violations.iter().any(|v| v.principle_id == "P004"));
    }

    #[tokio::test]
    async fn test_clean_content_allows() {
        let checker = ConstitutionalChecker::new();
        let result = checker.check("fn add(a: u32, b: u32) -> u32 { a + b }", "").await;
        assert!(result.safe);
        assert_eq!(result.score, 1.0);
        assert_eq!(result.recommendation, Recommendation::Allow);
        assert_eq!(result.escalation, EscalationLevel::None);
    }

    #[test]
    fn test_one_violation_per_principle() {
        let checker = ConstitutionalChecker::new();
        let violations = checker.check_patterns("rm -rf / && git push --force");
        assert_eq!(
            violations
                .iter()
                .filter(|v| v.principle_id == "P001")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_advisor_consulted_only_when_patterns_clean() {
        let advisor = Arc::new(CannedAdvisor {
            reply: "SAFE: NO\nSCORE: 0.4\nVIOLATIONS: P006\nRECOMMENDATION: WARN\nREASON: vague"
                .to_string(),
        });
        let checker = ConstitutionalChecker::new().with_advisor(advisor);

        let result = checker.check("please do the thing", "").await;
        assert!(!result.safe);
        assert!((result.score - 0.4).abs() < 1e-9);
        assert_eq!(result.recommendation, Recommendation::Warn);
        assert!(result.violations.iter().any(|v| v.principle_id == "P006"));
        assert_eq!(result.escalation, EscalationLevel::Warning);
    }

    #[tokio::test]
    async fn test_advisor_cannot_clear_critical_pattern_violation() {
        let advisor = Arc::new(CannedAdvisor {
            reply: "SAFE: YES\nSCORE: 1.0\nVIOLATIONS:\nRECOMMENDATION: ALLOW\nREASON: fine"
                .to_string(),
        });
        let checker = ConstitutionalChecker::new().with_advisor(advisor);

        let result = checker.check("DROP TABLE users;", "").await;
        assert!(!result.safe);
        assert_eq!(result.score, 0.0);
        assert_eq!(result.recommendation, Recommendation::Block);
        assert_eq!(result.escalation, EscalationLevel::EStop);
    }

    #[test]
    fn test_escalation_mapping() {
        let severe = vec![SafetyViolation {
            principle_id: "P001".to_string(),
            principle_name: "x".to_string(),
            category: SafetyCategory::Destructive,
            severity: 1.0,
            description: String::new(),
            matched_pattern: None,
            context: None,
        }];
        assert_eq!(escalation_for(0.0, &severe), EscalationLevel::EStop);
        assert_eq!(escalation_for(0.2, &[]), EscalationLevel::Critical);
        assert_eq!(escalation_for(0.5, &[]), EscalationLevel::Warning);
        assert_eq!(escalation_for(0.9, &[]), EscalationLevel::None);
    }

    #[test]
    fn test_escalation_ordering() {
        assert!(EscalationLevel::None < EscalationLevel::Warning);
        assert!(EscalationLevel::Warning < EscalationLevel::Critical);
        assert!(EscalationLevel::Critical < EscalationLevel::EStop);
    }

    #[test]
    fn test_uncertainty_triggers() {
        // Low confidence.
        assert!(should_escalate_uncertainty(&UncertaintySignals {
            confidence: Some(0.4),
            ..Default::default()
        }));
        // Ambiguous keyword.
        assert!(should_escalate_uncertainty(&UncertaintySignals {
            requirements: Some("Maybe add a login page, TBD".to_string()),
            ..Default::default()
        }));
        // Multiple options without a selection.
        assert!(should_escalate_uncertainty(&UncertaintySignals {
            options: vec!["jwt".to_string(), "session".to_string()],
            ..Default::default()
        }));
        // Uncertain decision label.
        assert!(should_escalate_uncertainty(&UncertaintySignals {
            decision: Some("Unsure".to_string()),
            ..Default::default()
        }));
        // Confident, unambiguous, selected.
        assert!(!should_escalate_uncertainty(&UncertaintySignals {
            confidence: Some(0.9),
            requirements: Some("Add a login endpoint".to_string()),
            options: vec!["jwt".to_string(), "session".to_string()],
            selected: Some("jwt".to_string()),
            decision: Some("jwt".to_string()),
        }));
    }
}
