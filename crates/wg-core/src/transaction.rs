//! Transaction models.
//!
//! [`TransactionRequest`] is the normalized evaluation input handed to the
//! policy engine. [`Transaction`] is the persisted row that the delay queue,
//! approval workflow and execution pipeline move between statuses.

use crate::amount::Amount;
use crate::policy::Tier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of outgoing action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    /// Native currency transfer.
    Transfer,
    /// Fungible token transfer.
    TokenTransfer,
    /// Arbitrary contract call.
    ContractCall,
    /// Token spending approval.
    Approve,
}

impl TransactionType {
    /// Returns the database-compatible string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            TransactionType::Transfer => "TRANSFER",
            TransactionType::TokenTransfer => "TOKEN_TRANSFER",
            TransactionType::ContractCall => "CONTRACT_CALL",
            TransactionType::Approve => "APPROVE",
        }
    }

    /// Parses a TransactionType from a database string.
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "TRANSFER" => Some(TransactionType::Transfer),
            "TOKEN_TRANSFER" => Some(TransactionType::TokenTransfer),
            "CONTRACT_CALL" => Some(TransactionType::ContractCall),
            "APPROVE" => Some(TransactionType::Approve),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// A normalized request submitted for policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    /// Native value moved. Token and approval amounts live in their own fields.
    pub amount: Amount,
    pub to_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_amount: Option<Amount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spender_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approve_amount: Option<Amount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

impl TransactionRequest {
    fn base(tx_type: TransactionType, to_address: impl Into<String>, amount: Amount) -> Self {
        Self {
            tx_type,
            amount,
            to_address: to_address.into(),
            token_address: None,
            token_amount: None,
            contract_address: None,
            selector: None,
            spender_address: None,
            approve_amount: None,
            chain: None,
            network: None,
        }
    }

    /// A native transfer of `amount` to `to_address`.
    pub fn transfer(to_address: impl Into<String>, amount: impl Into<Amount>) -> Self {
        Self::base(TransactionType::Transfer, to_address, amount.into())
    }

    /// A token transfer. Carries no native value.
    pub fn token_transfer(
        to_address: impl Into<String>,
        token_address: impl Into<String>,
        token_amount: impl Into<Amount>,
    ) -> Self {
        let mut request = Self::base(TransactionType::TokenTransfer, to_address, Amount::zero());
        request.token_address = Some(token_address.into());
        request.token_amount = Some(token_amount.into());
        request
    }

    /// A contract call. `to_address` doubles as the contract address.
    pub fn contract_call(contract_address: impl Into<String>, selector: impl Into<String>) -> Self {
        let contract_address = contract_address.into();
        let mut request =
            Self::base(TransactionType::ContractCall, contract_address.clone(), Amount::zero());
        request.contract_address = Some(contract_address);
        request.selector = Some(selector.into());
        request
    }

    /// A token approval granting `spender_address` an allowance.
    pub fn approve(
        token_address: impl Into<String>,
        spender_address: impl Into<String>,
        approve_amount: impl Into<Amount>,
    ) -> Self {
        let token_address = token_address.into();
        let mut request =
            Self::base(TransactionType::Approve, token_address.clone(), Amount::zero());
        request.token_address = Some(token_address);
        request.spender_address = Some(spender_address.into());
        request.approve_amount = Some(approve_amount.into());
        request
    }

    /// Sets the native value.
    pub fn with_amount(mut self, amount: impl Into<Amount>) -> Self {
        self.amount = amount.into();
        self
    }

    /// Sets the chain and network.
    pub fn on_network(mut self, chain: impl Into<String>, network: impl Into<String>) -> Self {
        self.chain = Some(chain.into());
        self.network = Some(network.into());
        self
    }

    /// Clears the selector (useful for describing malformed calls).
    pub fn without_selector(mut self) -> Self {
        self.selector = None;
        self
    }

    /// Native value a single request is tiered on. Transfers and contract
    /// calls carry native value; token transfers and approvals do not.
    pub fn native_amount(&self) -> Amount {
        match self.tx_type {
            TransactionType::Transfer | TransactionType::ContractCall => self.amount.clone(),
            TransactionType::TokenTransfer | TransactionType::Approve => Amount::zero(),
        }
    }

    /// Contribution of this instruction to a batch aggregate. Only TRANSFER
    /// instructions count.
    pub fn batch_native_amount(&self) -> Amount {
        match self.tx_type {
            TransactionType::Transfer => self.amount.clone(),
            _ => Amount::zero(),
        }
    }
}

/// Status of a persisted transaction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Queued,
    PendingApproval,
    Executing,
    Confirmed,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    /// Every status.
    pub const ALL: [TransactionStatus; 7] = [
        TransactionStatus::Pending,
        TransactionStatus::Queued,
        TransactionStatus::PendingApproval,
        TransactionStatus::Executing,
        TransactionStatus::Confirmed,
        TransactionStatus::Failed,
        TransactionStatus::Cancelled,
    ];

    /// Returns the database-compatible string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Queued => "QUEUED",
            TransactionStatus::PendingApproval => "PENDING_APPROVAL",
            TransactionStatus::Executing => "EXECUTING",
            TransactionStatus::Confirmed => "CONFIRMED",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::Cancelled => "CANCELLED",
        }
    }

    /// Parses a TransactionStatus from a database string.
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TransactionStatus::Pending),
            "QUEUED" => Some(TransactionStatus::Queued),
            "PENDING_APPROVAL" => Some(TransactionStatus::PendingApproval),
            "EXECUTING" => Some(TransactionStatus::Executing),
            "CONFIRMED" => Some(TransactionStatus::Confirmed),
            "FAILED" => Some(TransactionStatus::Failed),
            "CANCELLED" => Some(TransactionStatus::Cancelled),
            _ => None,
        }
    }

    /// Returns true for CONFIRMED, FAILED and CANCELLED.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Confirmed | TransactionStatus::Failed | TransactionStatus::Cancelled
        )
    }

    /// Statuses whose reservations still count against the wallet.
    pub fn holds_reservation(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Pending
                | TransactionStatus::Queued
                | TransactionStatus::PendingApproval
        )
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// A persisted transaction row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub tx_type: TransactionType,
    pub status: TransactionStatus,
    pub tier: Option<Tier>,
    pub amount: Amount,
    pub to_address: String,
    pub network: Option<String>,
    /// Provisional hold while awaiting DELAY or APPROVAL resolution.
    pub reserved_amount: Option<Amount>,
    pub queued_at: Option<DateTime<Utc>>,
    pub delay_until: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Creates a PENDING transaction from an evaluated request.
    pub fn pending(wallet_id: Uuid, request: &TransactionRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            wallet_id,
            tx_type: request.tx_type,
            status: TransactionStatus::Pending,
            tier: None,
            amount: request.amount.clone(),
            to_address: request.to_address.clone(),
            network: request.network.clone(),
            reserved_amount: None,
            queued_at: None,
            delay_until: None,
            error: None,
            created_at: Utc::now(),
        }
    }
}

/// Patch applied together with a status transition.
///
/// Outer `None` leaves a field untouched; `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionUpdate {
    pub status: Option<TransactionStatus>,
    pub tier: Option<Tier>,
    pub reserved_amount: Option<Option<Amount>>,
    pub queued_at: Option<Option<DateTime<Utc>>>,
    pub delay_until: Option<Option<DateTime<Utc>>>,
    pub error: Option<Option<String>>,
}

impl TransactionUpdate {
    /// Starts an update that moves the row to `status`.
    pub fn to_status(status: TransactionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Clears the reservation.
    pub fn release_reservation(mut self) -> Self {
        self.reserved_amount = Some(None);
        self
    }

    /// Sets the reservation.
    pub fn reserve(mut self, amount: Amount) -> Self {
        self.reserved_amount = Some(Some(amount));
        self
    }

    /// Sets the error string.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    /// Applies this patch to a transaction in place.
    pub fn apply(&self, tx: &mut Transaction) {
        if let Some(status) = self.status {
            tx.status = status;
        }
        if let Some(tier) = self.tier {
            tx.tier = Some(tier);
        }
        if let Some(reserved) = &self.reserved_amount {
            tx.reserved_amount = reserved.clone();
        }
        if let Some(queued_at) = self.queued_at {
            tx.queued_at = queued_at;
        }
        if let Some(delay_until) = self.delay_until {
            tx.delay_until = delay_until;
        }
        if let Some(error) = &self.error {
            tx.error = error.clone();
        }
    }
}

/// Pending human approval for an APPROVAL-tier transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub id: Uuid,
    pub tx_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    /// Channel that resolved the approval (e.g. "admin_api", "telegram").
    pub approval_channel: Option<String>,
}

impl PendingApproval {
    /// Creates an unresolved approval.
    pub fn new(tx_id: Uuid, created_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx_id,
            created_at,
            expires_at,
            approved_at: None,
            rejected_at: None,
            expired_at: None,
            approval_channel: None,
        }
    }

    /// Returns true while no decision or expiry has been recorded.
    pub fn is_unresolved(&self) -> bool {
        self.approved_at.is_none() && self.rejected_at.is_none() && self.expired_at.is_none()
    }
}

/// Resolution written to a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalResolution {
    Approved,
    Rejected,
    Expired,
}
