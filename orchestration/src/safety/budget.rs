//! Token and cost budget tracking.
//!
//! Thresholds: warning at 75 %, critical at 90 %, exceeded at 100 %. In
//! hard-limit mode an exceeded budget denies further work; in soft mode
//! it only alerts.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::constitutional::EscalationLevel;

/// Budget alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetAlertLevel {
    /// Under 75 %.
    Normal,
    /// 75-89 %.
    Warning,
    /// 90-99 %.
    Critical,
    /// 100 %+.
    Exceeded,
}

impl BudgetAlertLevel {
    /// The escalation posture this alert maps to.
    pub fn escalation(self) -> EscalationLevel {
        match self {
            BudgetAlertLevel::Normal => EscalationLevel::None,
            BudgetAlertLevel::Warning => EscalationLevel::Warning,
            BudgetAlertLevel::Critical => EscalationLevel::Warning,
            BudgetAlertLevel::Exceeded => EscalationLevel::Critical,
        }
    }
}

/// A budget alert notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetAlert {
    pub level: BudgetAlertLevel,
    pub message: String,
    pub percentage: f64,
    pub tokens_used: u64,
    pub token_limit: u64,
    pub cost_usd: f64,
    pub cost_limit_usd: f64,
    pub story_id: String,
    pub created_at: DateTime<Utc>,
}

/// Result of a budget check.
#[derive(Debug, Clone)]
pub struct BudgetResult {
    pub allowed: bool,
    pub alert: Option<BudgetAlert>,
    pub percentage: f64,
    pub remaining_tokens: u64,
    pub remaining_cost: f64,
}

/// Per-story budget counters carried in the workflow state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetState {
    pub tokens_used: u64,
    pub token_limit: u64,
    pub cost_usd: f64,
    pub cost_limit_usd: f64,
}

impl Default for BudgetState {
    fn default() -> Self {
        Self {
            tokens_used: 0,
            token_limit: 100_000,
            cost_usd: 0.0,
            cost_limit_usd: 10.0,
        }
    }
}

// Cost per 1K tokens, approximate.
const COST_PER_1K_TOKENS: &[(&str, f64)] = &[
    ("claude-3-sonnet", 0.003),
    ("claude-3-opus", 0.015),
    ("grok-3", 0.005),
];
const DEFAULT_COST_PER_1K: f64 = 0.005;

/// Tracks and enforces budget limits.
pub struct BudgetTracker {
    warning_threshold: f64,
    critical_threshold: f64,
    hard_limit: bool,
    alerts: Mutex<Vec<BudgetAlert>>,
}

impl BudgetTracker {
    pub fn new() -> Self {
        Self {
            warning_threshold: 0.75,
            critical_threshold: 0.90,
            hard_limit: true,
            alerts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_thresholds(mut self, warning: f64, critical: f64) -> Self {
        self.warning_threshold = warning;
        self.critical_threshold = critical;
        self
    }

    /// Soft mode: exceeded budgets alert but never deny work.
    pub fn soft_limit(mut self) -> Self {
        self.hard_limit = false;
        self
    }

    /// Rough token estimate: ~4 characters per token.
    pub fn estimate_tokens(&self, text: &str) -> u64 {
        (text.len() / 4) as u64
    }

    /// Estimated cost for a token count on a model, with a default rate
    /// for unknown models.
    pub fn estimate_cost(&self, tokens: u64, model: &str) -> f64 {
        let per_1k = COST_PER_1K_TOKENS
            .iter()
            .find(|(name, _)| *name == model)
            .map(|(_, rate)| *rate)
            .unwrap_or(DEFAULT_COST_PER_1K);
        (tokens as f64 / 1000.0) * per_1k
    }

    /// Check whether the budget allows continued operation.
    pub fn check_budget(&self, state: &BudgetState, story_id: &str) -> BudgetResult {
        let token_percentage = if state.token_limit > 0 {
            state.tokens_used as f64 / state.token_limit as f64
        } else {
            0.0
        };
        let cost_percentage = if state.cost_limit_usd > 0.0 {
            state.cost_usd / state.cost_limit_usd
        } else {
            0.0
        };
        let percentage = token_percentage.max(cost_percentage);

        let (level, allowed, message) = if percentage >= 1.0 {
            (
                BudgetAlertLevel::Exceeded,
                !self.hard_limit,
                format!("Budget exceeded! {:.0}% used", percentage * 100.0),
            )
        } else if percentage >= self.critical_threshold {
            (
                BudgetAlertLevel::Critical,
                true,
                format!("Critical: {:.0}% of budget used", percentage * 100.0),
            )
        } else if percentage >= self.warning_threshold {
            (
                BudgetAlertLevel::Warning,
                true,
                format!("Warning: {:.0}% of budget used", percentage * 100.0),
            )
        } else {
            (BudgetAlertLevel::Normal, true, String::new())
        };

        let alert = if level != BudgetAlertLevel::Normal {
            let alert = BudgetAlert {
                level,
                message,
                percentage,
                tokens_used: state.tokens_used,
                token_limit: state.token_limit,
                cost_usd: state.cost_usd,
                cost_limit_usd: state.cost_limit_usd,
                story_id: story_id.to_string(),
                created_at: Utc::now(),
            };
            self.alerts
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(alert.clone());
            Some(alert)
        } else {
            None
        };

        BudgetResult {
            allowed,
            alert,
            percentage,
            remaining_tokens: state.token_limit.saturating_sub(state.tokens_used),
            remaining_cost: (state.cost_limit_usd - state.cost_usd).max(0.0),
        }
    }

    /// Add new token usage to the state and re-check the budget.
    /// Returns the updated state alongside the check result.
    pub fn track_usage(
        &self,
        mut state: BudgetState,
        new_tokens: u64,
        model: &str,
        story_id: &str,
    ) -> (BudgetState, BudgetResult) {
        state.tokens_used += new_tokens;
        state.cost_usd = self.estimate_cost(state.tokens_used, model);
        let result = self.check_budget(&state, story_id);
        (state, result)
    }

    /// All alerts so far, optionally filtered by level.
    pub fn alerts(&self, level: Option<BudgetAlertLevel>) -> Vec<BudgetAlert> {
        let alerts = self.alerts.lock().unwrap_or_else(|e| e.into_inner());
        match level {
            Some(level) => alerts.iter().filter(|a| a.level == level).cloned().collect(),
            None => alerts.clone(),
        }
    }

    pub fn clear_alerts(&self) {
        self.alerts.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Default for BudgetTracker {
    fn default() -> Self {
        Self::new()
    }
}
