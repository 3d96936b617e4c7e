//! Per-type policy evaluators.
//!
//! Every function here is pure: it takes the resolved rule payload for one
//! policy type (or `None` when no policy is effective) and a normalized
//! request, and returns either `Ok(())` or the [`Denial`] that stops the
//! request. Tier contributions are computed separately by [`spending_tier`]
//! and [`approve_tier`].
//!
//! Addresses, selectors and domains are compared after lower-casing only.
//! Nothing is trimmed.

use serde::{Deserialize, Serialize};
use wg_core::{
    AllowedNetworksRules, AllowedTokensRules, Amount, ApproveAmountLimitRules,
    ApproveTierOverrideRules, ApprovedSpendersRules, ContractWhitelistRules, MethodWhitelistRules,
    PolicyType, SpendingLimitRules, Tier, TransactionRequest, TransactionType, WhitelistRules,
    X402AllowedDomainsRules,
};

/// Why a request was denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denial {
    /// The policy type that denied.
    pub policy_type: PolicyType,
    /// Human-readable explanation.
    pub reason: String,
}

impl Denial {
    pub fn new(policy_type: PolicyType, reason: impl Into<String>) -> Self {
        Self {
            policy_type,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Result of a gating evaluator.
pub type Verdict = Result<(), Denial>;

fn eq_ignore_case(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

/// Network allow-list, applied to every request type.
///
/// Absence permits, and so does a request that names no network.
pub fn check_allowed_networks(
    rules: Option<&AllowedNetworksRules>,
    network: Option<&str>,
) -> Verdict {
    let (Some(rules), Some(network)) = (rules, network) else {
        return Ok(());
    };

    if rules
        .networks
        .iter()
        .any(|entry| eq_ignore_case(&entry.network, network))
    {
        return Ok(());
    }

    let allowed: Vec<&str> = rules.networks.iter().map(|e| e.network.as_str()).collect();
    Err(Denial::new(
        PolicyType::AllowedNetworks,
        format!(
            "Network '{}' not in allowed networks list. Allowed: {}",
            network,
            allowed.join(", ")
        ),
    ))
}

/// Destination allow-list for TRANSFER and TOKEN_TRANSFER.
///
/// Absence denies. An empty address list matches nothing.
pub fn check_whitelist(rules: Option<&WhitelistRules>, request: &TransactionRequest) -> Verdict {
    if !matches!(
        request.tx_type,
        TransactionType::Transfer | TransactionType::TokenTransfer
    ) {
        return Ok(());
    }

    let rules = rules.ok_or_else(|| {
        Denial::new(
            PolicyType::Whitelist,
            "Transfers disabled: no WHITELIST policy configured",
        )
    })?;

    if rules
        .addresses
        .iter()
        .any(|addr| eq_ignore_case(addr, &request.to_address))
    {
        Ok(())
    } else {
        Err(Denial::new(
            PolicyType::Whitelist,
            format!("Address {} not in whitelist", request.to_address),
        ))
    }
}

/// Token allow-list for TOKEN_TRANSFER.
pub fn check_allowed_tokens(
    rules: Option<&AllowedTokensRules>,
    request: &TransactionRequest,
) -> Verdict {
    if request.tx_type != TransactionType::TokenTransfer {
        return Ok(());
    }

    // A request without a token is malformed whatever the policy says.
    let token = request.token_address.as_deref().ok_or_else(|| {
        Denial::new(
            PolicyType::AllowedTokens,
            "Token transfer missing token address",
        )
    })?;

    let rules = rules.ok_or_else(|| {
        Denial::new(
            PolicyType::AllowedTokens,
            "Token transfer not allowed: no ALLOWED_TOKENS policy configured",
        )
    })?;

    if rules.tokens.iter().any(|t| eq_ignore_case(&t.address, token)) {
        Ok(())
    } else {
        Err(Denial::new(
            PolicyType::AllowedTokens,
            format!("Token not in allowed list: {}", token),
        ))
    }
}

fn contract_target(request: &TransactionRequest) -> &str {
    request
        .contract_address
        .as_deref()
        .unwrap_or(&request.to_address)
}

/// Contract allow-list for CONTRACT_CALL. Falls back to `to_address` when the
/// request carries no explicit contract address.
pub fn check_contract_whitelist(
    rules: Option<&ContractWhitelistRules>,
    request: &TransactionRequest,
) -> Verdict {
    if request.tx_type != TransactionType::ContractCall {
        return Ok(());
    }

    let rules = rules.ok_or_else(|| {
        Denial::new(
            PolicyType::ContractWhitelist,
            "Contract calls disabled: no CONTRACT_WHITELIST policy configured",
        )
    })?;

    let contract = contract_target(request);
    if rules
        .contracts
        .iter()
        .any(|c| eq_ignore_case(&c.address, contract))
    {
        Ok(())
    } else {
        Err(Denial::new(
            PolicyType::ContractWhitelist,
            format!("Contract not whitelisted: {}", contract),
        ))
    }
}

/// Selector restriction for CONTRACT_CALL.
///
/// Only contracts with an entry are restricted; no policy means no restriction.
pub fn check_method_whitelist(
    rules: Option<&MethodWhitelistRules>,
    request: &TransactionRequest,
) -> Verdict {
    if request.tx_type != TransactionType::ContractCall {
        return Ok(());
    }
    let Some(rules) = rules else {
        return Ok(());
    };

    let contract = contract_target(request);
    let Some(entry) = rules
        .methods
        .iter()
        .find(|m| eq_ignore_case(&m.contract_address, contract))
    else {
        return Ok(());
    };

    let selector = request.selector.as_deref().ok_or_else(|| {
        Denial::new(
            PolicyType::MethodWhitelist,
            format!(
                "Method not whitelisted: missing selector on contract {}",
                contract
            ),
        )
    })?;

    if entry.selectors.iter().any(|s| eq_ignore_case(s, selector)) {
        Ok(())
    } else {
        Err(Denial::new(
            PolicyType::MethodWhitelist,
            format!("Method not whitelisted: {} on contract {}", selector, contract),
        ))
    }
}

/// Spender allow-list for APPROVE, including per-spender caps.
pub fn check_approved_spenders(
    rules: Option<&ApprovedSpendersRules>,
    request: &TransactionRequest,
) -> Verdict {
    if request.tx_type != TransactionType::Approve {
        return Ok(());
    }

    let rules = rules.ok_or_else(|| {
        Denial::new(
            PolicyType::ApprovedSpenders,
            "Token approvals disabled: no APPROVED_SPENDERS policy configured",
        )
    })?;

    let spender = request.spender_address.as_deref().ok_or_else(|| {
        Denial::new(
            PolicyType::ApprovedSpenders,
            "Approve missing spender address",
        )
    })?;

    let entry = rules
        .spenders
        .iter()
        .find(|s| eq_ignore_case(&s.address, spender))
        .ok_or_else(|| {
            Denial::new(
                PolicyType::ApprovedSpenders,
                format!("Spender not in approved list: {}", spender),
            )
        })?;

    if let (Some(cap), Some(amount)) = (&entry.max_amount, &request.approve_amount) {
        if amount > cap {
            return Err(Denial::new(
                PolicyType::ApprovedSpenders,
                format!("Approve amount exceeds spender limit for {}", spender),
            ));
        }
    }

    Ok(())
}

/// Amount limits for APPROVE. Absence behaves as `blockUnlimited = true`.
pub fn check_approve_amount_limit(
    rules: Option<&ApproveAmountLimitRules>,
    request: &TransactionRequest,
) -> Verdict {
    if request.tx_type != TransactionType::Approve {
        return Ok(());
    }
    let Some(amount) = request.approve_amount.as_ref() else {
        return Ok(());
    };

    let default_rules = ApproveAmountLimitRules::default();
    let rules = rules.unwrap_or(&default_rules);

    if rules.block_unlimited && *amount >= Amount::unlimited_approval_threshold() {
        return Err(Denial::new(
            PolicyType::ApproveAmountLimit,
            "Unlimited token approval is blocked",
        ));
    }

    if let Some(max) = &rules.max_amount {
        if amount > max {
            return Err(Denial::new(
                PolicyType::ApproveAmountLimit,
                "Approve amount exceeds limit",
            ));
        }
    }

    Ok(())
}

/// Matches an x402 domain pattern against a target domain.
///
/// `*.example.com` matches `api.example.com` and `a.b.example.com` but not
/// `example.com` itself.
pub fn match_domain(pattern: &str, target: &str) -> bool {
    let pattern = pattern.to_lowercase();
    let target = target.to_lowercase();

    if pattern == target {
        return true;
    }

    match pattern.strip_prefix('*') {
        Some(suffix) if suffix.starts_with('.') => {
            target.ends_with(suffix) && target.len() > suffix.len()
        }
        _ => false,
    }
}

/// Domain allow-list for x402 payments.
pub fn check_x402_domain(rules: Option<&X402AllowedDomainsRules>, domain: &str) -> Verdict {
    let rules = rules.ok_or_else(|| {
        Denial::new(
            PolicyType::X402AllowedDomains,
            "x402 payments disabled: no X402_ALLOWED_DOMAINS policy configured",
        )
    })?;

    if rules.domains.iter().any(|p| match_domain(p, domain)) {
        Ok(())
    } else {
        Err(Denial::new(
            PolicyType::X402AllowedDomains,
            format!("Domain '{}' not in allowed x402 domains list", domain),
        ))
    }
}

/// Maps a native amount onto a tier. Boundaries are inclusive; no policy
/// means INSTANT.
pub fn spending_tier(rules: Option<&SpendingLimitRules>, amount: &Amount) -> Tier {
    let Some(limits) = rules else {
        return Tier::Instant;
    };

    if *amount <= limits.instant_max {
        Tier::Instant
    } else if *amount <= limits.notify_max {
        Tier::Notify
    } else if *amount <= limits.delay_max {
        Tier::Delay
    } else {
        Tier::Approval
    }
}

/// Tier contribution of an APPROVE request. Other types contribute nothing.
pub fn approve_tier(
    rules: Option<&ApproveTierOverrideRules>,
    request: &TransactionRequest,
) -> Option<Tier> {
    if request.tx_type != TransactionType::Approve {
        return None;
    }
    Some(rules.map_or(Tier::Approval, |r| r.tier))
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;
    use wg_core::{ContractEntry, MethodEntry, NetworkEntry, SpenderEntry, TokenEntry};

    fn whitelist(addresses: &[&str]) -> WhitelistRules {
        WhitelistRules {
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn limits(instant: u64, notify: u64, delay: u64) -> SpendingLimitRules {
        SpendingLimitRules {
            instant_max: Amount::from(instant),
            notify_max: Amount::from(notify),
            delay_max: Amount::from(delay),
            delay_seconds: 300,
            approval_timeout: None,
        }
    }

    #[test]
    fn test_whitelist_default_deny() {
        let request = TransactionRequest::transfer("0xabc", 1u64);
        let denial = check_whitelist(None, &request).unwrap_err();
        assert_eq!(denial.policy_type, PolicyType::Whitelist);
        assert!(denial.reason.contains("no WHITELIST policy configured"));
    }

    #[test]
    fn test_whitelist_case_insensitive_without_trim() {
        let rules = whitelist(&["0xAbC"]);
        let mixed_case = TransactionRequest::transfer("0xaBc", 1u64);
        assert!(check_whitelist(Some(&rules), &mixed_case).is_ok());

        let padded = TransactionRequest::transfer(" 0xabc", 1u64);
        assert_eq!(
            check_whitelist(Some(&rules), &padded).unwrap_err().reason,
            "Address  0xabc not in whitelist"
        );
    }

    #[test]
    fn test_whitelist_empty_list_matches_nothing() {
        let rules = whitelist(&[]);
        let request = TransactionRequest::token_transfer("0xabc", "0xtoken", 5u64);
        assert!(check_whitelist(Some(&rules), &request).is_err());
    }

    #[test]
    fn test_whitelist_ignores_other_types() {
        let request = TransactionRequest::contract_call("0xcontract", "0xa9059cbb");
        assert!(check_whitelist(None, &request).is_ok());
    }

    #[test]
    fn test_allowed_networks() {
        let rules = AllowedNetworksRules {
            networks: vec![
                NetworkEntry {
                    network: "ethereum-mainnet".to_string(),
                    name: Some("Ethereum".to_string()),
                },
                NetworkEntry {
                    network: "base-mainnet".to_string(),
                    name: None,
                },
            ],
        };

        assert!(check_allowed_networks(Some(&rules), Some("Ethereum-Mainnet")).is_ok());
        assert!(check_allowed_networks(Some(&rules), None).is_ok());
        assert!(check_allowed_networks(None, Some("polygon-mainnet")).is_ok());

        let denial = check_allowed_networks(Some(&rules), Some("polygon-mainnet")).unwrap_err();
        assert_eq!(denial.policy_type, PolicyType::AllowedNetworks);
        assert_eq!(
            denial.reason,
            "Network 'polygon-mainnet' not in allowed networks list. \
             Allowed: ethereum-mainnet, base-mainnet"
        );

        let empty = AllowedNetworksRules { networks: vec![] };
        assert!(check_allowed_networks(Some(&empty), Some("ethereum-mainnet")).is_err());
    }

    #[test]
    fn test_allowed_tokens() {
        let rules = AllowedTokensRules {
            tokens: vec![TokenEntry {
                address: "0xUSDC".to_string(),
                symbol: Some("USDC".to_string()),
            }],
        };
        let usdc = TransactionRequest::token_transfer("0xabc", "0xusdc", 5u64);
        assert!(check_allowed_tokens(Some(&rules), &usdc).is_ok());

        let other = TransactionRequest::token_transfer("0xabc", "0xdai", 5u64);
        assert_eq!(
            check_allowed_tokens(Some(&rules), &other).unwrap_err().reason,
            "Token not in allowed list: 0xdai"
        );

        let mut missing = usdc.clone();
        missing.token_address = None;
        assert_eq!(
            check_allowed_tokens(Some(&rules), &missing).unwrap_err().reason,
            "Token transfer missing token address"
        );

        assert!(check_allowed_tokens(None, &usdc)
            .unwrap_err()
            .reason
            .contains("no ALLOWED_TOKENS policy configured"));
    }

    #[test]
    fn test_contract_whitelist_falls_back_to_to_address() {
        let rules = ContractWhitelistRules {
            contracts: vec![ContractEntry {
                address: "0xRouter".to_string(),
                name: None,
            }],
        };
        let mut call = TransactionRequest::contract_call("0xrouter", "0x12345678");
        call.contract_address = None;
        assert!(check_contract_whitelist(Some(&rules), &call).is_ok());

        let other = TransactionRequest::contract_call("0xother", "0x12345678");
        assert_eq!(
            check_contract_whitelist(Some(&rules), &other).unwrap_err().reason,
            "Contract not whitelisted: 0xother"
        );
        assert!(check_contract_whitelist(None, &call).is_err());
    }

    #[test]
    fn test_method_whitelist() {
        let rules = MethodWhitelistRules {
            methods: vec![MethodEntry {
                contract_address: "0xRouter".to_string(),
                selectors: vec!["0xA9059CBB".to_string()],
            }],
        };

        let allowed = TransactionRequest::contract_call("0xrouter", "0xa9059cbb");
        assert!(check_method_whitelist(Some(&rules), &allowed).is_ok());

        let denied = TransactionRequest::contract_call("0xrouter", "0x095ea7b3");
        assert_eq!(
            check_method_whitelist(Some(&rules), &denied).unwrap_err().reason,
            "Method not whitelisted: 0x095ea7b3 on contract 0xrouter"
        );

        let missing = allowed.clone().without_selector();
        assert_eq!(
            check_method_whitelist(Some(&rules), &missing).unwrap_err().reason,
            "Method not whitelisted: missing selector on contract 0xrouter"
        );

        // Contracts without an entry and missing policies are unrestricted.
        let unlisted = TransactionRequest::contract_call("0xother", "0xdeadbeef");
        assert!(check_method_whitelist(Some(&rules), &unlisted).is_ok());
        assert!(check_method_whitelist(None, &denied).is_ok());
    }

    #[test]
    fn test_approved_spenders_with_cap() {
        let rules = ApprovedSpendersRules {
            spenders: vec![SpenderEntry {
                address: "0xSpender".to_string(),
                name: None,
                max_amount: Some(Amount::from(1000u64)),
            }],
        };

        let at_cap = TransactionRequest::approve("0xtoken", "0xspender", 1000u64);
        assert!(check_approved_spenders(Some(&rules), &at_cap).is_ok());

        let over_cap = TransactionRequest::approve("0xtoken", "0xspender", 1001u64);
        assert!(check_approved_spenders(Some(&rules), &over_cap)
            .unwrap_err()
            .reason
            .contains("exceeds spender limit"));

        let stranger = TransactionRequest::approve("0xtoken", "0xstranger", 1u64);
        assert_eq!(
            check_approved_spenders(Some(&rules), &stranger).unwrap_err().reason,
            "Spender not in approved list: 0xstranger"
        );

        let mut missing = at_cap.clone();
        missing.spender_address = None;
        assert_eq!(
            check_approved_spenders(Some(&rules), &missing).unwrap_err().reason,
            "Approve missing spender address"
        );

        assert!(check_approved_spenders(None, &at_cap).is_err());
    }

    #[test]
    fn test_unlimited_threshold_boundary() {
        let threshold = Amount::unlimited_approval_threshold();
        let below = Amount::from(threshold.as_biguint() - BigUint::from(1u32));
        let above = Amount::from(threshold.as_biguint() + BigUint::from(1u32));

        let approve = |amount: Amount| TransactionRequest::approve("0xtoken", "0xspender", amount);

        assert!(check_approve_amount_limit(None, &approve(below)).is_ok());
        assert_eq!(
            check_approve_amount_limit(None, &approve(threshold)).unwrap_err().reason,
            "Unlimited token approval is blocked"
        );
        assert!(check_approve_amount_limit(None, &approve(above)).is_err());
        assert!(check_approve_amount_limit(None, &approve(Amount::zero())).is_ok());
    }

    #[test]
    fn test_approve_amount_max() {
        let rules = ApproveAmountLimitRules {
            max_amount: Some(Amount::from(500u64)),
            block_unlimited: false,
        };
        let ok = TransactionRequest::approve("0xtoken", "0xspender", 500u64);
        let over = TransactionRequest::approve("0xtoken", "0xspender", 501u64);
        assert!(check_approve_amount_limit(Some(&rules), &ok).is_ok());
        assert_eq!(
            check_approve_amount_limit(Some(&rules), &over).unwrap_err().reason,
            "Approve amount exceeds limit"
        );

        let permissive = ApproveAmountLimitRules {
            max_amount: None,
            block_unlimited: false,
        };
        let huge = TransactionRequest::approve(
            "0xtoken",
            "0xspender",
            Amount::unlimited_approval_threshold(),
        );
        assert!(check_approve_amount_limit(Some(&permissive), &huge).is_ok());
    }

    #[test]
    fn test_match_domain() {
        assert!(match_domain("api.example.com", "API.EXAMPLE.COM"));
        assert!(match_domain("*.example.com", "api.example.com"));
        assert!(match_domain("*.Example.com", "a.b.example.com"));
        assert!(!match_domain("*.example.com", "example.com"));
        assert!(!match_domain("*.example.com", "badexample.com"));
        assert!(!match_domain("other.com", "api.example.com"));
    }

    #[test]
    fn test_x402_domain() {
        let rules = X402AllowedDomainsRules {
            domains: vec!["*.example.com".to_string()],
        };
        assert!(check_x402_domain(Some(&rules), "pay.example.com").is_ok());
        assert_eq!(
            check_x402_domain(Some(&rules), "evil.com").unwrap_err().reason,
            "Domain 'evil.com' not in allowed x402 domains list"
        );
        assert!(check_x402_domain(None, "pay.example.com").is_err());
    }

    #[test]
    fn test_spending_tier_boundaries() {
        let rules = limits(500_000_000, 1_000_000_000, 5_000_000_000);
        let tier = |n: u64| spending_tier(Some(&rules), &Amount::from(n));

        assert_eq!(tier(500_000_000), Tier::Instant);
        assert_eq!(tier(500_000_001), Tier::Notify);
        assert_eq!(tier(1_000_000_000), Tier::Notify);
        assert_eq!(tier(5_000_000_000), Tier::Delay);
        assert_eq!(tier(5_000_000_001), Tier::Approval);
        assert_eq!(spending_tier(None, &Amount::from(u64::MAX)), Tier::Instant);
    }

    #[test]
    fn test_approve_tier() {
        let approve = TransactionRequest::approve("0xtoken", "0xspender", 1u64);
        assert_eq!(approve_tier(None, &approve), Some(Tier::Approval));
        assert_eq!(
            approve_tier(
                Some(&ApproveTierOverrideRules { tier: Tier::Notify }),
                &approve
            ),
            Some(Tier::Notify)
        );
        assert_eq!(
            approve_tier(None, &TransactionRequest::transfer("0xabc", 1u64)),
            None
        );
    }
}
