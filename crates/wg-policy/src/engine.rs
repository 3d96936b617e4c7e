//! Policy evaluation engine for Wallet Guard.
//!
//! The engine resolves the effective policy of every type for a request,
//! runs the gating evaluators deny-first and then combines the tier
//! contributions. Batches are all-or-nothing: one denied instruction denies
//! the whole batch.
//!
//! Evaluation never mutates wallet state. The one exception is
//! [`PolicyEngine::evaluate_and_reserve`], which records the reservation of
//! an allowed request on its transaction row.

use crate::evaluators::{self, Denial};
use crate::resolver::{PolicyResolver, ResolvedPolicies};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;
use wg_core::db::{DbError, PolicyRepository, TransactionRepository};
use wg_core::{
    Amount, PolicyType, Tier, TransactionRequest, TransactionStatus, TransactionType,
    TransactionUpdate,
};
use wg_observability::{
    AuditEntry, AuditError, AuditEventType, AuditSink, ControlPlaneMetrics,
};

/// Cooldown applied to a DELAY-tier request when no spending policy names one.
pub const DEFAULT_DELAY_SECONDS: u64 = 900;

/// Errors that can occur in policy evaluation.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),
}

/// One denied instruction of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchViolation {
    /// Position of the instruction in the batch.
    pub index: usize,
    pub tx_type: TransactionType,
    pub policy_type: PolicyType,
    pub reason: String,
}

/// Outcome of evaluating a request or batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEvaluation {
    pub allowed: bool,
    pub tier: Tier,
    /// Present on denial.
    pub reason: Option<String>,
    /// Cooldown, present iff the tier is DELAY.
    pub delay_seconds: Option<u64>,
    /// Policy-specific approval window for the APPROVAL tier.
    pub approval_timeout: Option<u64>,
    /// Per-instruction denials of a batch.
    pub violations: Vec<BatchViolation>,
}

impl PolicyEvaluation {
    /// An allowed, INSTANT evaluation.
    pub fn instant() -> Self {
        Self {
            allowed: true,
            tier: Tier::Instant,
            reason: None,
            delay_seconds: None,
            approval_timeout: None,
            violations: Vec::new(),
        }
    }

    /// A denial. Denials always carry tier INSTANT.
    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            ..Self::instant()
        }
    }

    /// An allowed evaluation at `tier`, with the tier's timing taken from the
    /// spending policy when there is one.
    fn allowed_at(tier: Tier, resolved: &ResolvedPolicies) -> Self {
        let limits = resolved.spending_limit();
        let delay_seconds = (tier == Tier::Delay)
            .then(|| limits.map_or(DEFAULT_DELAY_SECONDS, |l| l.delay_seconds));
        let approval_timeout = if tier == Tier::Approval {
            limits.and_then(|l| l.approval_timeout)
        } else {
            None
        };

        Self {
            tier,
            delay_seconds,
            approval_timeout,
            ..Self::instant()
        }
    }
}

/// Runs the gating evaluators in order and stops at the first denial.
pub fn check_request(
    resolved: &ResolvedPolicies,
    request: &TransactionRequest,
) -> Result<(), Denial> {
    evaluators::check_allowed_networks(resolved.allowed_networks(), request.network.as_deref())?;
    evaluators::check_whitelist(resolved.whitelist(), request)?;
    evaluators::check_allowed_tokens(resolved.allowed_tokens(), request)?;
    evaluators::check_contract_whitelist(resolved.contract_whitelist(), request)?;
    evaluators::check_method_whitelist(resolved.method_whitelist(), request)?;
    evaluators::check_approved_spenders(resolved.approved_spenders(), request)?;
    evaluators::check_approve_amount_limit(resolved.approve_amount_limit(), request)?;
    Ok(())
}

/// Evaluates one request against already-resolved policies.
///
/// `native_amount` is what gets tiered; callers that account for existing
/// reservations pass the combined figure.
pub fn evaluate_resolved(
    resolved: &ResolvedPolicies,
    request: &TransactionRequest,
    native_amount: &Amount,
) -> Result<PolicyEvaluation, Denial> {
    check_request(resolved, request)?;

    let spending = evaluators::spending_tier(resolved.spending_limit(), native_amount);
    let tier = evaluators::approve_tier(resolved.approve_tier_override(), request)
        .map_or(spending, |approve| spending.max(approve));

    Ok(PolicyEvaluation::allowed_at(tier, resolved))
}

/// Formats the reason of a denied batch.
fn batch_reason(violations: &[BatchViolation]) -> String {
    let details = violations
        .iter()
        .map(|v| format!("[{}] {}: {}", v.index, v.tx_type, v.reason))
        .collect::<Vec<_>>()
        .join("; ");
    format!(
        "Batch policy violation: {} instruction(s) denied. {}",
        violations.len(),
        details
    )
}

/// The policy engine evaluates requests against the stored policies.
pub struct PolicyEngine {
    resolver: PolicyResolver,
    transactions: Arc<dyn TransactionRepository>,
    audit: Arc<dyn AuditSink>,
    metrics: ControlPlaneMetrics,
    /// Serializes the read-and-reserve step of `evaluate_and_reserve`.
    reserve_lock: Mutex<()>,
}

impl PolicyEngine {
    /// Creates a new policy engine.
    pub fn new(
        policies: Arc<dyn PolicyRepository>,
        transactions: Arc<dyn TransactionRepository>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            resolver: PolicyResolver::new(policies),
            transactions,
            audit,
            metrics: ControlPlaneMetrics::new(),
            reserve_lock: Mutex::new(()),
        }
    }

    /// Returns the resolver used by this engine.
    pub fn resolver(&self) -> &PolicyResolver {
        &self.resolver
    }

    /// Evaluates a single request.
    #[instrument(skip(self, request), fields(wallet_id = %wallet_id, tx_type = %request.tx_type))]
    pub async fn evaluate(
        &self,
        wallet_id: Uuid,
        request: &TransactionRequest,
    ) -> Result<PolicyEvaluation, EngineError> {
        let started = Instant::now();
        let resolved = self
            .resolver
            .resolve_all(wallet_id, request.network.as_deref())
            .await?;

        let evaluation = match evaluate_resolved(&resolved, request, &request.native_amount()) {
            Ok(evaluation) => evaluation,
            Err(denial) => {
                self.record_denial(wallet_id, None, request.tx_type, &denial).await?;
                PolicyEvaluation::denied(denial.reason)
            }
        };

        self.finish(&evaluation, started);
        Ok(evaluation)
    }

    /// Evaluates a batch with all-or-nothing semantics.
    ///
    /// The first instruction's network is checked against ALLOWED_NETWORKS
    /// before any instruction is evaluated; a disallowed network denies the
    /// whole batch with that single reason. Only TRANSFER amounts are
    /// aggregated. The aggregate is tiered against the first instruction's
    /// network.
    #[instrument(
        skip(self, requests),
        fields(wallet_id = %wallet_id, instructions = requests.len())
    )]
    pub async fn evaluate_batch(
        &self,
        wallet_id: Uuid,
        requests: &[TransactionRequest],
    ) -> Result<PolicyEvaluation, EngineError> {
        let Some(first) = requests.first() else {
            return Ok(PolicyEvaluation::instant());
        };
        if requests.len() == 1 {
            return self.evaluate(wallet_id, first).await;
        }

        let started = Instant::now();
        let mut by_network: HashMap<Option<String>, ResolvedPolicies> = HashMap::new();
        let resolved = self
            .resolver
            .resolve_all(wallet_id, first.network.as_deref())
            .await?;
        let allowed = resolved.allowed_networks();
        if let Err(denial) = evaluators::check_allowed_networks(allowed, first.network.as_deref()) {
            self.record_denial(wallet_id, None, first.tx_type, &denial).await?;
            let evaluation = PolicyEvaluation::denied(denial.reason);
            self.finish(&evaluation, started);
            return Ok(evaluation);
        }
        by_network.insert(first.network.clone(), resolved);

        let mut violations = Vec::new();

        for (index, request) in requests.iter().enumerate() {
            if !by_network.contains_key(&request.network) {
                let resolved = self
                    .resolver
                    .resolve_all(wallet_id, request.network.as_deref())
                    .await?;
                by_network.insert(request.network.clone(), resolved);
            }
            let resolved = &by_network[&request.network];

            if let Err(denial) = check_request(resolved, request) {
                violations.push(BatchViolation {
                    index,
                    tx_type: request.tx_type,
                    policy_type: denial.policy_type,
                    reason: denial.reason,
                });
            }
        }

        if !violations.is_empty() {
            let mut evaluation = PolicyEvaluation::denied(batch_reason(&violations));
            evaluation.violations = violations;

            info!(
                violations = evaluation.violations.len(),
                "Batch denied by policy"
            );
            for violation in &evaluation.violations {
                self.metrics.record_denial(violation.policy_type.as_db_str());
            }
            self.audit
                .append(
                    AuditEntry::new(AuditEventType::PolicyDenied, "policy_engine")
                        .wallet(wallet_id)
                        .details(serde_json::json!({
                            "reason": evaluation.reason,
                            "violations": evaluation.violations,
                        })),
                )
                .await?;

            self.finish(&evaluation, started);
            return Ok(evaluation);
        }

        let aggregate_policies = &by_network[&first.network];
        let total: Amount = requests
            .iter()
            .map(TransactionRequest::batch_native_amount)
            .sum();
        let mut tier = evaluators::spending_tier(aggregate_policies.spending_limit(), &total);

        for request in requests {
            let resolved = &by_network[&request.network];
            let approve = evaluators::approve_tier(resolved.approve_tier_override(), request);
            if let Some(approve) = approve {
                tier = tier.max(approve);
            }
        }

        debug!(total = %total, tier = %tier, "Batch aggregated");
        let evaluation = PolicyEvaluation::allowed_at(tier, aggregate_policies);
        self.finish(&evaluation, started);
        Ok(evaluation)
    }

    /// Evaluates a request counting the wallet's outstanding reservations
    /// toward its spending tier, and records the reservation on `tx_id` when
    /// the request is allowed.
    #[instrument(skip(self, request), fields(wallet_id = %wallet_id, tx_id = %tx_id))]
    pub async fn evaluate_and_reserve(
        &self,
        wallet_id: Uuid,
        tx_id: Uuid,
        request: &TransactionRequest,
    ) -> Result<PolicyEvaluation, EngineError> {
        let started = Instant::now();
        let _guard = self.reserve_lock.lock().await;

        let resolved = self
            .resolver
            .resolve_all(wallet_id, request.network.as_deref())
            .await?;
        let reserved = self.transactions.reserved_total(wallet_id).await?;
        let amount = request.native_amount();
        let effective = amount.clone() + &reserved;

        let evaluation = match evaluate_resolved(&resolved, request, &effective) {
            Ok(evaluation) => {
                let stored = self
                    .transactions
                    .update_if_status(
                        tx_id,
                        &[TransactionStatus::Pending],
                        &TransactionUpdate::default().reserve(amount),
                    )
                    .await?;
                if !stored {
                    debug!("Transaction no longer pending, reservation not recorded");
                }
                evaluation
            }
            Err(denial) => {
                self.record_denial(wallet_id, Some(tx_id), request.tx_type, &denial)
                    .await?;
                PolicyEvaluation::denied(denial.reason)
            }
        };

        self.finish(&evaluation, started);
        Ok(evaluation)
    }

    /// Clears the reservation of a transaction, whatever its status.
    pub async fn release_reservation(&self, tx_id: Uuid) -> Result<bool, EngineError> {
        let released = self
            .transactions
            .update_if_status(
                tx_id,
                &TransactionStatus::ALL,
                &TransactionUpdate::default().release_reservation(),
            )
            .await?;
        Ok(released)
    }

    /// Evaluates an x402 payment domain.
    #[instrument(skip(self), fields(wallet_id = %wallet_id))]
    pub async fn evaluate_x402_domain(
        &self,
        wallet_id: Uuid,
        network: Option<&str>,
        domain: &str,
    ) -> Result<PolicyEvaluation, EngineError> {
        let policy = self
            .resolver
            .resolve(wallet_id, network, PolicyType::X402AllowedDomains)
            .await?;
        let resolved = ResolvedPolicies::from_policies(policy);

        match evaluators::check_x402_domain(resolved.x402_allowed_domains(), domain) {
            Ok(()) => Ok(PolicyEvaluation::instant()),
            Err(denial) => {
                info!(domain = %domain, reason = %denial.reason, "x402 payment denied by policy");
                self.metrics.record_denial(denial.policy_type.as_db_str());
                self.audit
                    .append(
                        AuditEntry::new(AuditEventType::PolicyDenied, "policy_engine")
                            .wallet(wallet_id)
                            .details(serde_json::json!({
                                "policy_type": denial.policy_type,
                                "reason": denial.reason,
                                "domain": domain,
                            })),
                    )
                    .await?;
                Ok(PolicyEvaluation::denied(denial.reason))
            }
        }
    }

    async fn record_denial(
        &self,
        wallet_id: Uuid,
        tx_id: Option<Uuid>,
        tx_type: TransactionType,
        denial: &Denial,
    ) -> Result<(), EngineError> {
        info!(
            policy_type = %denial.policy_type,
            reason = %denial.reason,
            "Request denied by policy"
        );
        self.metrics.record_denial(denial.policy_type.as_db_str());

        let mut entry = AuditEntry::new(AuditEventType::PolicyDenied, "policy_engine")
            .wallet(wallet_id)
            .details(serde_json::json!({
                "policy_type": denial.policy_type,
                "tx_type": tx_type,
                "reason": denial.reason,
            }));
        if let Some(tx_id) = tx_id {
            entry = entry.tx(tx_id);
        }
        self.audit.append(entry).await?;
        Ok(())
    }

    fn finish(&self, evaluation: &PolicyEvaluation, started: Instant) {
        self.metrics.record_evaluation(
            evaluation.tier.as_db_str(),
            evaluation.allowed,
            started.elapsed().as_secs_f64(),
        );
    }
}
