//! Metrics for the Wallet Guard control plane.
//!
//! Emitted through the `metrics` facade; the host process installs whichever
//! recorder/exporter it uses. Without a recorder every call is a no-op.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::sync::Once;

static REGISTER: Once = Once::new();

/// Thin handle over the control-plane metric names.
#[derive(Debug, Clone, Default)]
pub struct ControlPlaneMetrics;

impl ControlPlaneMetrics {
    /// Creates a handle, registering metric descriptions on first use.
    pub fn new() -> Self {
        REGISTER.call_once(Self::register_metrics);
        Self
    }

    fn register_metrics() {
        describe_counter!(
            "wg_policy_evaluations_total",
            "Total number of policy evaluations, by outcome tier"
        );
        describe_counter!(
            "wg_policy_denials_total",
            "Total number of requests denied by policy"
        );
        describe_histogram!(
            "wg_policy_evaluation_duration_seconds",
            "Time spent evaluating a request or batch"
        );

        describe_counter!(
            "wg_delay_released_total",
            "Total number of delayed transactions released for execution"
        );
        describe_counter!(
            "wg_approvals_resolved_total",
            "Total number of approvals resolved, by outcome"
        );
        describe_gauge!(
            "wg_pending_approvals",
            "Number of approvals awaiting a decision"
        );

        describe_counter!(
            "wg_autostop_triggers_total",
            "Total number of autostop rule triggers"
        );
        describe_counter!(
            "wg_sessions_revoked_total",
            "Total number of sessions revoked for inactivity"
        );

        describe_counter!(
            "wg_kill_switch_transitions_total",
            "Total number of kill switch state transitions"
        );

        describe_counter!(
            "wg_notifications_dispatched_total",
            "Total number of notifications handed to channels"
        );
        describe_counter!(
            "wg_notifications_suppressed_total",
            "Total number of notifications suppressed, by reason"
        );
    }

    /// Records an evaluation outcome.
    pub fn record_evaluation(&self, tier: &str, allowed: bool, duration_secs: f64) {
        counter!(
            "wg_policy_evaluations_total",
            "tier" => tier.to_string(),
            "allowed" => allowed.to_string()
        )
            .increment(1);
        histogram!("wg_policy_evaluation_duration_seconds").record(duration_secs);
    }

    /// Records a denial, labelled by the policy type that denied.
    pub fn record_denial(&self, policy_type: &str) {
        counter!("wg_policy_denials_total", "policy_type" => policy_type.to_string()).increment(1);
    }

    /// Records delayed transactions released by a sweep.
    pub fn record_delay_released(&self, count: usize) {
        counter!("wg_delay_released_total").increment(count as u64);
    }

    /// Records an approval resolution ("approved", "rejected", "expired").
    pub fn record_approval_resolved(&self, outcome: &str) {
        counter!("wg_approvals_resolved_total", "outcome" => outcome.to_string()).increment(1);
    }

    /// Records the number of approvals awaiting a decision.
    pub fn record_pending_approvals(&self, count: usize) {
        gauge!("wg_pending_approvals").set(count as f64);
    }

    /// Records an autostop trigger.
    pub fn record_autostop_trigger(&self, rule: &str) {
        counter!("wg_autostop_triggers_total", "rule" => rule.to_string()).increment(1);
    }

    /// Records a session revocation.
    pub fn record_session_revoked(&self) {
        counter!("wg_sessions_revoked_total").increment(1);
    }

    /// Records a kill switch transition.
    pub fn record_kill_switch_transition(&self, from: &str, to: &str) {
        counter!(
            "wg_kill_switch_transitions_total",
            "from" => from.to_string(),
            "to" => to.to_string()
        )
            .increment(1);
    }

    /// Records a notification handed to the channels.
    pub fn record_notification_dispatched(&self, event_type: &str) {
        counter!("wg_notifications_dispatched_total", "event_type" => event_type.to_string())
            .increment(1);
    }

    /// Records a suppressed notification ("kill_switch", "cooldown").
    pub fn record_notification_suppressed(&self, reason: &'static str) {
        counter!("wg_notifications_suppressed_total", "reason" => reason).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let metrics = ControlPlaneMetrics::new();
        metrics.record_evaluation("INSTANT", true, 0.001);
        metrics.record_denial("WHITELIST");
        metrics.record_delay_released(3);
        metrics.record_notification_suppressed("kill_switch");

        // Registration is idempotent.
        let _again = ControlPlaneMetrics::new();
    }
}
