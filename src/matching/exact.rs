//! Deterministic pass: identical reference id and identical amount

use super::MatchPools;
use crate::models::{MatchPair, Transaction};
use std::collections::HashSet;
use tracing::debug;

/// First-fit exact matcher.
///
/// Bank transactions are scanned in pool order; each takes the first
/// still-available policy transaction with the same non-empty reference id
/// and the same amount.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactMatcher;

impl ExactMatcher {
    pub fn new() -> Self {
        Self
    }

    pub fn is_exact_match(bank: &Transaction, policy: &Transaction) -> bool {
        match (usable_reference(bank), usable_reference(policy)) {
            (Some(b), Some(p)) => b == p && bank.amount == policy.amount,
            _ => false,
        }
    }

    /// Collect pairs without touching the pools
    pub fn find_pairs(&self, pools: &MatchPools) -> Vec<MatchPair> {
        let mut consumed: HashSet<i64> = HashSet::new();
        let mut pairs = Vec::new();

        for bank in pools.bank() {
            let candidate = pools
                .policy()
                .iter()
                .find(|policy| !consumed.contains(&policy.id) && Self::is_exact_match(bank, policy));

            if let Some(policy) = candidate {
                debug!(
                    bank_id = bank.id,
                    policy_id = policy.id,
                    reference_id = ?bank.reference_id,
                    "Exact match"
                );
                consumed.insert(policy.id);
                pairs.push(MatchPair {
                    bank_id: bank.id,
                    policy_id: policy.id,
                });
            }
        }

        pairs
    }

    /// Find pairs, then apply them to the pools
    pub fn run(&self, pools: &mut MatchPools) -> Vec<MatchPair> {
        let pairs = self.find_pairs(pools);

        pairs
            .into_iter()
            .filter(|pair| pools.apply(*pair))
            .collect()
    }
}

fn usable_reference(txn: &Transaction) -> Option<&str> {
    txn.reference_id.as_deref().filter(|r| !r.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::test_support::{bank, policy};
    use crate::models::TransactionStatus;

    #[test]
    fn test_exact_pair_linked_both_ways() {
        let mut pools = MatchPools::from_transactions(vec![
            bank(1, Some("POL-1"), "100.0"),
            policy(2, Some("POL-1"), "100.0"),
        ]);

        let pairs = ExactMatcher::new().run(&mut pools);

        assert_eq!(pairs, vec![MatchPair { bank_id: 1, policy_id: 2 }]);
        let matched = pools.matched();
        assert!(matched.iter().all(|t| t.status == TransactionStatus::Matched));
        assert_eq!(matched.iter().find(|t| t.id == 1).unwrap().match_id, Some(2));
        assert_eq!(matched.iter().find(|t| t.id == 2).unwrap().match_id, Some(1));
    }

    #[test]
    fn test_amount_off_by_a_cent_stays_unmatched() {
        let mut pools = MatchPools::from_transactions(vec![
            bank(1, Some("POL-1"), "100.0"),
            policy(2, Some("POL-1"), "100.01"),
        ]);

        assert!(ExactMatcher::new().run(&mut pools).is_empty());
        assert_eq!(pools.bank().len(), 1);
        assert_eq!(pools.policy().len(), 1);
        assert!(pools.bank()[0].is_unmatched());
    }

    #[test]
    fn test_trailing_zeros_are_the_same_amount() {
        let mut pools = MatchPools::from_transactions(vec![
            bank(1, Some("POL-1"), "100.10"),
            policy(2, Some("POL-1"), "100.1"),
        ]);

        assert_eq!(ExactMatcher::new().run(&mut pools).len(), 1);
    }

    #[test]
    fn test_first_fit_in_input_order() {
        let mut pools = MatchPools::from_transactions(vec![
            bank(1, Some("A1"), "500"),
            policy(2, Some("A1"), "500"),
            policy(3, Some("A1"), "500"),
        ]);

        let pairs = ExactMatcher::new().run(&mut pools);

        assert_eq!(pairs, vec![MatchPair { bank_id: 1, policy_id: 2 }]);
        assert_eq!(pools.policy().len(), 1);
        assert_eq!(pools.policy()[0].id, 3);
        assert!(pools.policy()[0].is_unmatched());
    }

    #[test]
    fn test_policy_never_reused() {
        let mut pools = MatchPools::from_transactions(vec![
            bank(1, Some("A1"), "500"),
            bank(2, Some("A1"), "500"),
            policy(3, Some("A1"), "500"),
        ]);

        let pairs = ExactMatcher::new().run(&mut pools);

        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].bank_id, 1);
        assert_eq!(pools.bank()[0].id, 2);
    }

    #[test]
    fn test_missing_or_blank_reference_never_matches() {
        let mut pools = MatchPools::from_transactions(vec![
            bank(1, None, "300"),
            bank(2, Some(""), "300"),
            policy(3, None, "300"),
            policy(4, Some(""), "300"),
        ]);

        assert!(ExactMatcher::new().run(&mut pools).is_empty());
    }

    #[test]
    fn test_reference_comparison_is_exact() {
        let mut pools = MatchPools::from_transactions(vec![
            bank(1, Some("pol-1"), "10"),
            policy(2, Some("POL-1"), "10"),
        ]);

        assert!(ExactMatcher::new().run(&mut pools).is_empty());
    }
}
