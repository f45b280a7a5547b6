pub mod guard;

use serde::Serialize;

pub use self::guard::BudgetGuard;

/// How far through its monthly allowance a project is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetLevel {
    Ok,
    /// At or past the warning threshold.
    Warning,
    /// At or past the emergency threshold.
    Emergency,
    /// `current_usage >= monthly_budget`; requests are rejected.
    Exceeded,
}

/// Result of a budget check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetCheck {
    pub within_budget: bool,
    pub usage_fraction: f64,
    pub level: BudgetLevel,
}

impl BudgetCheck {
    /// Value for the `X-Budget-Warning` response header, if one applies.
    pub fn warning_message(&self) -> Option<String> {
        let pct = self.usage_fraction * 100.0;
        match self.level {
            BudgetLevel::Warning => Some(format!("warning: {pct:.0}% of monthly budget used")),
            BudgetLevel::Emergency => Some(format!("emergency: {pct:.0}% of monthly budget used")),
            BudgetLevel::Ok | BudgetLevel::Exceeded => None,
        }
    }
}
