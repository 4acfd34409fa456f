//! Matching engines and the candidate pools they consume
//!
//! Pools hold the still-unmatched transactions of one batch per source, in
//! id order. Engines first collect pairs, then apply them; nothing is removed
//! from a pool while it is being scanned.

use crate::models::{MatchPair, Transaction, TransactionSource};

pub mod exact;
pub mod fuzzy;

pub use exact::ExactMatcher;
pub use fuzzy::{FuzzyMatcher, ProposedPair};

#[derive(Debug, Clone, Default)]
pub struct MatchPools {
    bank: Vec<Transaction>,
    policy: Vec<Transaction>,
    matched: Vec<Transaction>,
}

impl MatchPools {
    /// Partition unmatched transactions by source, keeping input order
    pub fn from_transactions<I>(transactions: I) -> Self
    where
        I: IntoIterator<Item = Transaction>,
    {
        let mut pools = Self::default();

        for txn in transactions.into_iter().filter(Transaction::is_unmatched) {
            match txn.source {
                TransactionSource::BankStatement => pools.bank.push(txn),
                TransactionSource::PolicyLog => pools.policy.push(txn),
            }
        }

        pools
    }

    pub fn bank(&self) -> &[Transaction] {
        &self.bank
    }

    pub fn policy(&self) -> &[Transaction] {
        &self.policy
    }

    /// Transactions paired so far, both sides
    pub fn matched(&self) -> &[Transaction] {
        &self.matched
    }

    /// Another pass is only worthwhile with candidates on both sides
    pub fn both_sides_pending(&self) -> bool {
        !self.bank.is_empty() && !self.policy.is_empty()
    }

    fn take(pool: &mut Vec<Transaction>, id: i64) -> Option<Transaction> {
        let idx = pool.iter().position(|t| t.id == id)?;
        Some(pool.remove(idx))
    }

    /// Pair two pooled transactions: both leave their pools marked `matched`
    /// and pointing at each other. Returns false, changing nothing, if either
    /// is no longer pending.
    pub fn apply(&mut self, pair: MatchPair) -> bool {
        let bank_pending = self.bank.iter().any(|t| t.id == pair.bank_id);
        let policy_pending = self.policy.iter().any(|t| t.id == pair.policy_id);
        if !bank_pending || !policy_pending {
            return false;
        }

        let (Some(mut bank), Some(mut policy)) = (
            Self::take(&mut self.bank, pair.bank_id),
            Self::take(&mut self.policy, pair.policy_id),
        ) else {
            return false;
        };

        bank.pair_with(policy.id);
        policy.pair_with(bank.id);
        self.matched.push(bank);
        self.matched.push(policy);

        true
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{bank, policy};
    use super::*;
    use crate::models::TransactionStatus;

    #[test]
    fn test_pools_partition_and_skip_matched() {
        let mut already = bank(3, None, "1");
        already.pair_with(99);

        let pools = MatchPools::from_transactions(vec![
            bank(1, None, "1"),
            policy(2, None, "1"),
            already,
        ]);

        assert_eq!(pools.bank().len(), 1);
        assert_eq!(pools.policy().len(), 1);
        assert!(pools.both_sides_pending());
    }

    #[test]
    fn test_apply_links_both_sides_once() {
        let mut pools =
            MatchPools::from_transactions(vec![bank(1, None, "1"), policy(2, None, "1")]);
        let pair = MatchPair { bank_id: 1, policy_id: 2 };

        assert!(pools.apply(pair));
        assert!(!pools.apply(pair));
        assert!(!pools.both_sides_pending());

        let matched = pools.matched();
        assert_eq!(matched.len(), 2);
        assert!(matched.iter().all(|t| t.status == TransactionStatus::Matched));
        assert_eq!(matched[0].match_id, Some(2));
        assert_eq!(matched[1].match_id, Some(1));
    }

    #[test]
    fn test_apply_rejects_unknown_ids() {
        let mut pools =
            MatchPools::from_transactions(vec![bank(1, None, "1"), policy(2, None, "1")]);

        assert!(!pools.apply(MatchPair { bank_id: 1, policy_id: 42 }));
        assert!(!pools.apply(MatchPair { bank_id: 2, policy_id: 1 }));
        assert_eq!(pools.bank().len(), 1);
        assert_eq!(pools.policy().len(), 1);
    }
}
