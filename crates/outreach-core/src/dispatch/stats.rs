//! Aggregate counts over a run's outcomes

use outreach_common::types::SendOutcome;
use serde::Serialize;
use std::collections::BTreeMap;

/// Per-account share of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AccountTally {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

/// Result of a campaign or follow-up run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CampaignStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// Percentage of delivered attempts, 0 for an empty run
    pub success_rate: f64,
    pub by_account: BTreeMap<String, AccountTally>,
    /// The run stopped early on cancellation
    pub cancelled: bool,
    #[serde(skip)]
    pub outcomes: Vec<SendOutcome>,
}

impl CampaignStats {
    pub fn from_outcomes(outcomes: Vec<SendOutcome>) -> Self {
        let mut by_account: BTreeMap<String, AccountTally> = BTreeMap::new();
        let mut successful = 0;

        for outcome in &outcomes {
            let tally = by_account.entry(outcome.account().to_string()).or_default();
            tally.total += 1;
            if outcome.success() {
                tally.successful += 1;
                successful += 1;
            } else {
                tally.failed += 1;
            }
        }

        let total = outcomes.len();
        let success_rate = if total > 0 {
            successful as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        Self {
            total,
            successful,
            failed: total - successful,
            success_rate,
            by_account,
            cancelled: false,
            outcomes,
        }
    }

    pub fn with_cancelled(mut self, cancelled: bool) -> Self {
        self.cancelled = cancelled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use outreach_common::types::{SendError, NO_ACCOUNT};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_run_has_zero_rate() {
        let stats = CampaignStats::from_outcomes(Vec::new());
        assert_eq!(stats.total, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert!(stats.by_account.is_empty());
    }

    #[test]
    fn test_counts_by_account() {
        let now = Utc::now();
        let stats = CampaignStats::from_outcomes(vec![
            SendOutcome::delivered("a@example.com", "a1", now),
            SendOutcome::delivered("b@example.com", "a2", now),
            SendOutcome::failed("c@example.com", "a1", SendError::EmptyBody, now),
            SendOutcome::failed("d@example.com", NO_ACCOUNT, SendError::NoAvailableAccount, now),
        ]);

        assert_eq!(stats.total, 4);
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.success_rate, 50.0);
        assert_eq!(
            stats.by_account["a1"],
            AccountTally {
                total: 2,
                successful: 1,
                failed: 1
            }
        );
        assert_eq!(stats.by_account[NO_ACCOUNT].failed, 1);
    }
}
