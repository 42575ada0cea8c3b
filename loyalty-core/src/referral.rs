//! Referral graph accessor
//!
//! Walks `referred_by` pointers upward from a buyer. The walk is iterative,
//! bounded to [`MAX_REFERRAL_DEPTH`] levels and stops on the first repeated
//! account, so malformed data (cycles, self-referrals) yields a shorter chain
//! instead of a loop.

use crate::{
    registry::AccountRegistry,
    types::{AccountId, ReferralEdge},
};
use std::collections::HashSet;
use std::sync::Arc;

/// Levels that earn referral commission
pub const MAX_REFERRAL_DEPTH: u8 = 3;

/// Referrers of one buyer, nearest first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferralChain {
    edges: Vec<ReferralEdge>,
}

impl ReferralChain {
    /// Chain from explicit edges (tests and callers with their own graph)
    pub fn from_edges(edges: Vec<ReferralEdge>) -> Self {
        Self { edges }
    }

    /// Referrer at `level` (1-based)
    pub fn at_level(&self, level: u8) -> Option<&AccountId> {
        self.edges
            .iter()
            .find(|e| e.level == level)
            .map(|e| &e.referrer)
    }

    /// Level-1 referrer
    pub fn l1(&self) -> Option<&AccountId> {
        self.at_level(1)
    }

    /// Edges, nearest first
    pub fn edges(&self) -> &[ReferralEdge] {
        &self.edges
    }

    /// Number of levels present
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// True when the buyer has no referrer
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

/// Read-only access to the referral tree
#[derive(Clone)]
pub struct ReferralGraph {
    registry: Arc<dyn AccountRegistry>,
}

impl std::fmt::Debug for ReferralGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferralGraph").finish_non_exhaustive()
    }
}

impl ReferralGraph {
    /// Graph over the account registry
    pub fn new(registry: Arc<dyn AccountRegistry>) -> Self {
        Self { registry }
    }

    /// Up to three referrers above `buyer`.
    ///
    /// Never fails: a lookup error ends the walk at the last level resolved.
    pub fn chain(&self, buyer: &AccountId) -> ReferralChain {
        let mut edges = Vec::with_capacity(MAX_REFERRAL_DEPTH as usize);
        let mut seen = HashSet::new();
        seen.insert(buyer.clone());

        let mut current = buyer.clone();
        for level in 1..=MAX_REFERRAL_DEPTH {
            let parent = match self.registry.referred_by(&current) {
                Ok(Some(parent)) => parent,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        account_id = %current,
                        level,
                        error = %e,
                        "Referral lookup failed, truncating chain"
                    );
                    break;
                }
            };

            if !seen.insert(parent.clone()) {
                tracing::warn!(account_id = %parent, buyer = %buyer, "Referral cycle detected");
                break;
            }

            edges.push(ReferralEdge {
                referrer: parent.clone(),
                referred: buyer.clone(),
                level,
            });
            current = parent;
        }

        ReferralChain { edges }
    }

    /// Referrer of `buyer` at `level`, if present
    pub fn referrer(&self, buyer: &AccountId, level: u8) -> Option<AccountId> {
        self.chain(buyer).at_level(level).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;
    use crate::types::Account;

    fn open(registry: &MemoryRegistry, id: &str, parent: Option<&str>) {
        registry
            .open_account(&Account::new(AccountId::new(id), parent.map(AccountId::new)))
            .unwrap();
    }

    #[test]
    fn test_chain_stops_at_three_levels() {
        let registry = Arc::new(MemoryRegistry::new());
        open(&registry, "root", None);
        open(&registry, "L3", Some("root"));
        open(&registry, "L2", Some("L3"));
        open(&registry, "L1", Some("L2"));
        open(&registry, "buyer", Some("L1"));

        let graph = ReferralGraph::new(registry);
        let chain = graph.chain(&AccountId::new("buyer"));

        assert_eq!(chain.len(), 3);
        assert_eq!(chain.l1(), Some(&AccountId::new("L1")));
        assert_eq!(chain.at_level(3), Some(&AccountId::new("L3")));
        assert!(chain.edges().iter().all(|e| e.referred == AccountId::new("buyer")));
    }

    #[test]
    fn test_no_referrer_gives_empty_chain() {
        let registry = Arc::new(MemoryRegistry::new());
        open(&registry, "buyer", None);
        let graph = ReferralGraph::new(registry);
        assert!(graph.chain(&AccountId::new("buyer")).is_empty());
        // Unknown buyers have no chain either
        assert!(graph.chain(&AccountId::new("ghost")).is_empty());
    }

    #[test]
    fn test_cycle_is_cut() {
        let registry = Arc::new(MemoryRegistry::new());
        open(&registry, "a", Some("b"));
        open(&registry, "b", Some("a"));

        let graph = ReferralGraph::new(registry);
        let chain = graph.chain(&AccountId::new("a"));
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.l1(), Some(&AccountId::new("b")));
    }

    #[test]
    fn test_self_referral_is_ignored() {
        let registry = Arc::new(MemoryRegistry::new());
        open(&registry, "me", Some("me"));
        let graph = ReferralGraph::new(registry);
        assert!(graph.chain(&AccountId::new("me")).is_empty());
        assert_eq!(graph.referrer(&AccountId::new("me"), 1), None);
    }
}
