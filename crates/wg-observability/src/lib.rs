//! # wg-observability
//!
//! Logging, metrics and audit infrastructure for Wallet Guard.
//!
//! This crate provides structured logging with tracing, control-plane metrics
//! through the `metrics` facade, and the audit sink every state-changing
//! decision is written to.

pub mod audit;
pub mod logging;
pub mod metrics;

pub use audit::{AuditEntry, AuditError, AuditEventType, AuditLog, AuditSeverity, AuditSink};
pub use logging::{init_logging, init_logging_with_config, LogFormat, LoggingConfig, LoggingError};
pub use metrics::ControlPlaneMetrics;
