//! Policy data models for Wallet Guard.
//!
//! A policy is a typed rule payload plus the scope it applies to. The payload
//! is a closed enum with one variant per policy type so that evaluators can
//! match on it exhaustively.

use crate::amount::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Execution tier assigned to an allowed transaction, ordered by severity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    /// Execute immediately.
    Instant,
    /// Execute immediately and notify the owner.
    Notify,
    /// Hold for a cooldown before executing.
    Delay,
    /// Hold until a human approves.
    Approval,
}

impl Tier {
    /// Returns the database-compatible string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Tier::Instant => "INSTANT",
            Tier::Notify => "NOTIFY",
            Tier::Delay => "DELAY",
            Tier::Approval => "APPROVAL",
        }
    }

    /// Parses a Tier from a database string.
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "INSTANT" => Some(Tier::Instant),
            "NOTIFY" => Some(Tier::Notify),
            "DELAY" => Some(Tier::Delay),
            "APPROVAL" => Some(Tier::Approval),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// Closed set of policy types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyType {
    SpendingLimit,
    Whitelist,
    ContractWhitelist,
    MethodWhitelist,
    AllowedTokens,
    ApprovedSpenders,
    ApproveAmountLimit,
    ApproveTierOverride,
    X402AllowedDomains,
    AllowedNetworks,
}

impl PolicyType {
    /// All policy types, in evaluation order.
    pub const ALL: [PolicyType; 10] = [
        PolicyType::AllowedNetworks,
        PolicyType::Whitelist,
        PolicyType::AllowedTokens,
        PolicyType::ContractWhitelist,
        PolicyType::MethodWhitelist,
        PolicyType::ApprovedSpenders,
        PolicyType::ApproveAmountLimit,
        PolicyType::ApproveTierOverride,
        PolicyType::SpendingLimit,
        PolicyType::X402AllowedDomains,
    ];

    /// Returns the database-compatible string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            PolicyType::SpendingLimit => "SPENDING_LIMIT",
            PolicyType::Whitelist => "WHITELIST",
            PolicyType::ContractWhitelist => "CONTRACT_WHITELIST",
            PolicyType::MethodWhitelist => "METHOD_WHITELIST",
            PolicyType::AllowedTokens => "ALLOWED_TOKENS",
            PolicyType::ApprovedSpenders => "APPROVED_SPENDERS",
            PolicyType::ApproveAmountLimit => "APPROVE_AMOUNT_LIMIT",
            PolicyType::ApproveTierOverride => "APPROVE_TIER_OVERRIDE",
            PolicyType::X402AllowedDomains => "X402_ALLOWED_DOMAINS",
            PolicyType::AllowedNetworks => "ALLOWED_NETWORKS",
        }
    }

    /// Parses a PolicyType from a database string.
    pub fn from_db_str(s: &str) -> Option<Self> {
        PolicyType::ALL.into_iter().find(|t| t.as_db_str() == s)
    }
}

impl std::fmt::Display for PolicyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// Native-amount tier thresholds. All boundaries are inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendingLimitRules {
    pub instant_max: Amount,
    pub notify_max: Amount,
    pub delay_max: Amount,
    /// Cooldown applied to DELAY-tier transactions.
    pub delay_seconds: u64,
    /// Approval window for APPROVAL-tier transactions, overriding the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_timeout: Option<u64>,
}

impl SpendingLimitRules {
    /// Checks that thresholds are non-decreasing.
    pub fn is_consistent(&self) -> bool {
        self.instant_max <= self.notify_max && self.notify_max <= self.delay_max
    }
}

/// Destination address allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistRules {
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractEntry {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractWhitelistRules {
    #[serde(default)]
    pub contracts: Vec<ContractEntry>,
}

/// Selectors permitted on one contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodEntry {
    pub contract_address: String,
    #[serde(default)]
    pub selectors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodWhitelistRules {
    #[serde(default)]
    pub methods: Vec<MethodEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedTokensRules {
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpenderEntry {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Per-spender approval cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amount: Option<Amount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovedSpendersRules {
    #[serde(default)]
    pub spenders: Vec<SpenderEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveAmountLimitRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amount: Option<Amount>,
    #[serde(default = "default_block_unlimited")]
    pub block_unlimited: bool,
}

fn default_block_unlimited() -> bool {
    true
}

impl Default for ApproveAmountLimitRules {
    fn default() -> Self {
        Self {
            max_amount: None,
            block_unlimited: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproveTierOverrideRules {
    pub tier: Tier,
}

/// Domains an x402 payment may be made to. Supports `*.suffix` wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct X402AllowedDomainsRules {
    #[serde(default)]
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEntry {
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Networks a wallet may transact on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedNetworksRules {
    #[serde(default)]
    pub networks: Vec<NetworkEntry>,
}

/// Type-tagged rule payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "rules", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyRules {
    SpendingLimit(SpendingLimitRules),
    Whitelist(WhitelistRules),
    ContractWhitelist(ContractWhitelistRules),
    MethodWhitelist(MethodWhitelistRules),
    AllowedTokens(AllowedTokensRules),
    ApprovedSpenders(ApprovedSpendersRules),
    ApproveAmountLimit(ApproveAmountLimitRules),
    ApproveTierOverride(ApproveTierOverrideRules),
    #[serde(rename = "X402_ALLOWED_DOMAINS")]
    X402AllowedDomains(X402AllowedDomainsRules),
    AllowedNetworks(AllowedNetworksRules),
}

impl PolicyRules {
    /// Returns the type tag of this payload.
    pub fn policy_type(&self) -> PolicyType {
        match self {
            PolicyRules::SpendingLimit(_) => PolicyType::SpendingLimit,
            PolicyRules::Whitelist(_) => PolicyType::Whitelist,
            PolicyRules::ContractWhitelist(_) => PolicyType::ContractWhitelist,
            PolicyRules::MethodWhitelist(_) => PolicyType::MethodWhitelist,
            PolicyRules::AllowedTokens(_) => PolicyType::AllowedTokens,
            PolicyRules::ApprovedSpenders(_) => PolicyType::ApprovedSpenders,
            PolicyRules::ApproveAmountLimit(_) => PolicyType::ApproveAmountLimit,
            PolicyRules::ApproveTierOverride(_) => PolicyType::ApproveTierOverride,
            PolicyRules::X402AllowedDomains(_) => PolicyType::X402AllowedDomains,
            PolicyRules::AllowedNetworks(_) => PolicyType::AllowedNetworks,
        }
    }
}

/// A stored policy record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning wallet; `None` for a global policy.
    pub wallet_id: Option<Uuid>,
    /// Network scope; `None` applies to every network.
    pub network: Option<String>,
    /// Typed rule payload.
    #[serde(flatten)]
    pub rules: PolicyRules,
    /// Higher wins within a scope level.
    pub priority: i32,
    /// Disabled policies are never candidates.
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    /// Creates an enabled global policy with priority 0.
    pub fn new(rules: PolicyRules) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            wallet_id: None,
            network: None,
            rules,
            priority: 0,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Scopes the policy to a wallet.
    pub fn for_wallet(mut self, wallet_id: Uuid) -> Self {
        self.wallet_id = Some(wallet_id);
        self
    }

    /// Scopes the policy to a network.
    pub fn on_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the creation timestamp.
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }

    /// Marks the policy as disabled.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Returns the type tag of this policy.
    pub fn policy_type(&self) -> PolicyType {
        self.rules.policy_type()
    }
}
