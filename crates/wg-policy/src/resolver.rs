//! Policy override resolution.
//!
//! For one wallet, network and policy type at most one policy is effective.
//! Precedence, strongest first:
//!
//! 1. wallet-scoped beats global, whatever the priorities;
//! 2. network-specific beats network-agnostic within a scope;
//! 3. higher priority;
//! 4. most recently created.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;
use wg_core::db::{DbError, PolicyRepository};
use wg_core::{
    AllowedNetworksRules, AllowedTokensRules, ApproveAmountLimitRules, ApproveTierOverrideRules,
    ApprovedSpendersRules, ContractWhitelistRules, MethodWhitelistRules, Policy, PolicyRules,
    PolicyType, SpendingLimitRules, WhitelistRules, X402AllowedDomainsRules,
};

/// Picks the effective policy among candidates.
///
/// Candidates that are disabled, scoped to another wallet or scoped to
/// another network are ignored, so the repository's pre-filtering is not
/// trusted blindly.
pub fn select_effective(
    candidates: Vec<Policy>,
    wallet_id: Uuid,
    network: Option<&str>,
) -> Option<Policy> {
    candidates
        .into_iter()
        .filter(|p| p.enabled)
        .filter(|p| p.wallet_id.map_or(true, |id| id == wallet_id))
        .filter(|p| match (p.network.as_deref(), network) {
            (None, _) => true,
            (Some(scoped), Some(requested)) => scoped == requested,
            (Some(_), None) => false,
        })
        .max_by_key(|p| {
            (
                p.wallet_id.is_some(),
                p.network.is_some(),
                p.priority,
                p.created_at,
            )
        })
}

/// Resolves effective policies from a [`PolicyRepository`].
#[derive(Clone)]
pub struct PolicyResolver {
    repo: Arc<dyn PolicyRepository>,
}

impl PolicyResolver {
    pub fn new(repo: Arc<dyn PolicyRepository>) -> Self {
        Self { repo }
    }

    /// Resolves the effective policy of one type.
    #[instrument(skip(self), fields(policy_type = %policy_type))]
    pub async fn resolve(
        &self,
        wallet_id: Uuid,
        network: Option<&str>,
        policy_type: PolicyType,
    ) -> Result<Option<Policy>, DbError> {
        let candidates = self
            .repo
            .list_candidates(policy_type, wallet_id, network)
            .await?;
        let count = candidates.len();
        let effective = select_effective(candidates, wallet_id, network);

        debug!(
            candidates = count,
            effective = ?effective.as_ref().map(|p| p.id),
            "Resolved policy"
        );
        Ok(effective)
    }

    /// Resolves the effective policy of every type.
    pub async fn resolve_all(
        &self,
        wallet_id: Uuid,
        network: Option<&str>,
    ) -> Result<ResolvedPolicies, DbError> {
        let mut resolved = ResolvedPolicies::default();
        for policy_type in PolicyType::ALL {
            if let Some(policy) = self.resolve(wallet_id, network, policy_type).await? {
                resolved.insert(policy);
            }
        }
        Ok(resolved)
    }
}

/// The effective policy of each type for one wallet and network.
#[derive(Debug, Clone, Default)]
pub struct ResolvedPolicies {
    policies: HashMap<PolicyType, Policy>,
}

impl ResolvedPolicies {
    /// Builds a set from already-effective policies. Later entries of the
    /// same type replace earlier ones.
    pub fn from_policies(policies: impl IntoIterator<Item = Policy>) -> Self {
        let mut resolved = Self::default();
        for policy in policies {
            resolved.insert(policy);
        }
        resolved
    }

    fn insert(&mut self, policy: Policy) {
        self.policies.insert(policy.policy_type(), policy);
    }

    /// The effective policy of a type.
    pub fn get(&self, policy_type: PolicyType) -> Option<&Policy> {
        self.policies.get(&policy_type)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    fn rules(&self, policy_type: PolicyType) -> Option<&PolicyRules> {
        self.policies.get(&policy_type).map(|p| &p.rules)
    }

    pub fn spending_limit(&self) -> Option<&SpendingLimitRules> {
        match self.rules(PolicyType::SpendingLimit)? {
            PolicyRules::SpendingLimit(rules) => Some(rules),
            _ => None,
        }
    }

    pub fn whitelist(&self) -> Option<&WhitelistRules> {
        match self.rules(PolicyType::Whitelist)? {
            PolicyRules::Whitelist(rules) => Some(rules),
            _ => None,
        }
    }

    pub fn contract_whitelist(&self) -> Option<&ContractWhitelistRules> {
        match self.rules(PolicyType::ContractWhitelist)? {
            PolicyRules::ContractWhitelist(rules) => Some(rules),
            _ => None,
        }
    }

    pub fn method_whitelist(&self) -> Option<&MethodWhitelistRules> {
        match self.rules(PolicyType::MethodWhitelist)? {
            PolicyRules::MethodWhitelist(rules) => Some(rules),
            _ => None,
        }
    }

    pub fn allowed_tokens(&self) -> Option<&AllowedTokensRules> {
        match self.rules(PolicyType::AllowedTokens)? {
            PolicyRules::AllowedTokens(rules) => Some(rules),
            _ => None,
        }
    }

    pub fn approved_spenders(&self) -> Option<&ApprovedSpendersRules> {
        match self.rules(PolicyType::ApprovedSpenders)? {
            PolicyRules::ApprovedSpenders(rules) => Some(rules),
            _ => None,
        }
    }

    pub fn approve_amount_limit(&self) -> Option<&ApproveAmountLimitRules> {
        match self.rules(PolicyType::ApproveAmountLimit)? {
            PolicyRules::ApproveAmountLimit(rules) => Some(rules),
            _ => None,
        }
    }

    pub fn approve_tier_override(&self) -> Option<&ApproveTierOverrideRules> {
        match self.rules(PolicyType::ApproveTierOverride)? {
            PolicyRules::ApproveTierOverride(rules) => Some(rules),
            _ => None,
        }
    }

    pub fn x402_allowed_domains(&self) -> Option<&X402AllowedDomainsRules> {
        match self.rules(PolicyType::X402AllowedDomains)? {
            PolicyRules::X402AllowedDomains(rules) => Some(rules),
            _ => None,
        }
    }

    pub fn allowed_networks(&self) -> Option<&AllowedNetworksRules> {
        match self.rules(PolicyType::AllowedNetworks)? {
            PolicyRules::AllowedNetworks(rules) => Some(rules),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use wg_core::db::memory::InMemoryPolicyRepository;
    use wg_core::TokenEntry;

    fn tokens(addresses: &[&str]) -> PolicyRules {
        PolicyRules::AllowedTokens(AllowedTokensRules {
            tokens: addresses
                .iter()
                .map(|a| TokenEntry {
                    address: a.to_string(),
                    symbol: None,
                })
                .collect(),
        })
    }

    fn token_list(policy: &Policy) -> Vec<String> {
        match &policy.rules {
            PolicyRules::AllowedTokens(rules) => {
                rules.tokens.iter().map(|t| t.address.clone()).collect()
            }
            other => panic!("unexpected rules: {:?}", other),
        }
    }

    #[test]
    fn test_wallet_scope_beats_global_priority() {
        let wallet_id = Uuid::new_v4();
        let global = Policy::new(tokens(&["0xa"])).with_priority(100);
        let scoped = Policy::new(tokens(&["0xb"])).for_wallet(wallet_id);

        let effective = select_effective(vec![global, scoped], wallet_id, None).unwrap();
        assert_eq!(token_list(&effective), vec!["0xb"]);
    }

    #[test]
    fn test_network_specific_beats_agnostic() {
        let wallet_id = Uuid::new_v4();
        let agnostic = Policy::new(tokens(&["0xa"])).with_priority(10);
        let specific = Policy::new(tokens(&["0xb"])).on_network("polygon-mainnet");

        let effective = select_effective(
            vec![agnostic.clone(), specific.clone()],
            wallet_id,
            Some("polygon-mainnet"),
        )
        .unwrap();
        assert_eq!(token_list(&effective), vec!["0xb"]);

        // Without a requested network the scoped policy is not a candidate.
        let effective = select_effective(vec![agnostic, specific], wallet_id, None).unwrap();
        assert_eq!(token_list(&effective), vec!["0xa"]);
    }

    #[test]
    fn test_priority_then_recency() {
        let wallet_id = Uuid::new_v4();
        let now = Utc::now();
        let low = Policy::new(tokens(&["0xlow"])).with_priority(1);
        let older = Policy::new(tokens(&["0xolder"]))
            .with_priority(5)
            .created_at(now - Duration::hours(1));
        let newer = Policy::new(tokens(&["0xnewer"]))
            .with_priority(5)
            .created_at(now);

        let effective = select_effective(vec![low, newer, older], wallet_id, None).unwrap();
        assert_eq!(token_list(&effective), vec!["0xnewer"]);
    }

    #[test]
    fn test_disabled_and_foreign_policies_ignored() {
        let wallet_id = Uuid::new_v4();
        let disabled = Policy::new(tokens(&["0xa"])).for_wallet(wallet_id).disabled();
        let foreign = Policy::new(tokens(&["0xb"])).for_wallet(Uuid::new_v4());

        assert!(select_effective(vec![disabled, foreign], wallet_id, None).is_none());
    }

    #[tokio::test]
    async fn test_resolve_all_from_repository() {
        let wallet_id = Uuid::new_v4();
        let repo = InMemoryPolicyRepository::with_policies(vec![
            Policy::new(tokens(&["0xa"])),
            Policy::new(PolicyRules::Whitelist(WhitelistRules {
                addresses: vec!["0xdest".to_string()],
            }))
            .for_wallet(wallet_id),
        ]);
        let resolver = PolicyResolver::new(Arc::new(repo));

        let resolved = resolver.resolve_all(wallet_id, None).await.unwrap();
        assert_eq!(resolved.len(), 2);
        assert!(resolved.allowed_tokens().is_some());
        assert_eq!(resolved.whitelist().unwrap().addresses, vec!["0xdest"]);
        assert!(resolved.spending_limit().is_none());

        let other = resolver.resolve_all(Uuid::new_v4(), None).await.unwrap();
        assert!(other.whitelist().is_none());
    }
}
