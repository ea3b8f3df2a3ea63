use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

/// Resource balances a caller offers when validating an upgrade.
pub type ResourceAmounts = HashMap<String, i64>;

/// Summed resource costs, ordered by resource name.
pub type ResourceCosts = BTreeMap<String, i64>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger holds {available} of '{resource}', {requested} requested")]
    Insufficient {
        resource: String,
        available: i64,
        requested: i64,
    },
}

/// Holder of a player's resource balances. The registry only reads balances,
/// debits totals it has already validated, and credits back debits of a
/// request that failed part way.
pub trait ResourceLedger {
    fn available(&self, resource: &str) -> Option<i64>;

    fn debit(&mut self, resource: &str, amount: i64) -> Result<(), LedgerError>;

    fn credit(&mut self, resource: &str, amount: i64);

    fn has_at_least(&self, resource: &str, amount: i64) -> bool {
        self.available(resource)
            .is_some_and(|available| available >= amount)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InMemoryLedger {
    balances: BTreeMap<String, i64>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(mut self, resource: impl Into<String>, amount: i64) -> Self {
        self.add(resource, amount);
        self
    }

    pub fn add(&mut self, resource: impl Into<String>, amount: i64) {
        let entry = self.balances.entry(resource.into()).or_insert(0);
        *entry = entry.saturating_add(amount);
    }

    pub fn get(&self, resource: &str) -> i64 {
        self.balances.get(resource).copied().unwrap_or(0)
    }

    /// Removes `amount` if the balance covers it; returns whether it did.
    pub fn spend(&mut self, resource: &str, amount: i64) -> bool {
        self.debit(resource, amount).is_ok()
    }

    pub fn snapshot(&self) -> ResourceAmounts {
        self.balances
            .iter()
            .map(|(name, amount)| (name.clone(), *amount))
            .collect()
    }
}

impl ResourceLedger for InMemoryLedger {
    fn available(&self, resource: &str) -> Option<i64> {
        self.balances.get(resource).copied()
    }

    fn debit(&mut self, resource: &str, amount: i64) -> Result<(), LedgerError> {
        let available = self.get(resource);
        if available < amount {
            return Err(LedgerError::Insufficient {
                resource: resource.to_string(),
                available,
                requested: amount,
            });
        }
        self.balances.insert(resource.to_string(), available - amount);
        Ok(())
    }

    fn credit(&mut self, resource: &str, amount: i64) {
        self.add(resource, amount);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spend_requires_cover() {
        let mut ledger = InMemoryLedger::new().with_balance("wood", 10);
        assert!(!ledger.spend("wood", 11));
        assert!(ledger.spend("wood", 4));
        assert_eq!(ledger.get("wood"), 6);
        assert!(ledger.has_at_least("wood", 6));
        assert!(!ledger.has_at_least("gold", 0));

        ledger.credit("wood", 4);
        assert_eq!(ledger.get("wood"), 10);
    }
}
