//! Best-effort audit logging.
//!
//! Audit calls never fail and never block the caller; implementations
//! swallow their own errors.

use tracing::{error, info, warn};

pub trait AuditLogger: Send + Sync + 'static {
    fn log_info(&self, action: &str, details: &serde_json::Value);
    fn log_warning(&self, action: &str, details: &serde_json::Value);
    fn log_error(&self, action: &str, details: &serde_json::Value);
}

/// Forwards audit records to `tracing` under the `weft::audit` target.
#[derive(Debug, Clone, Default)]
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn log_info(&self, action: &str, details: &serde_json::Value) {
        info!(target: "weft::audit", action, details = %details, "audit");
    }

    fn log_warning(&self, action: &str, details: &serde_json::Value) {
        warn!(target: "weft::audit", action, details = %details, "audit");
    }

    fn log_error(&self, action: &str, details: &serde_json::Value) {
        error!(target: "weft::audit", action, details = %details, "audit");
    }
}

/// Discards every audit record.
#[derive(Debug, Clone, Default)]
pub struct NoopAuditLogger;

impl AuditLogger for NoopAuditLogger {
    fn log_info(&self, _action: &str, _details: &serde_json::Value) {}
    fn log_warning(&self, _action: &str, _details: &serde_json::Value) {}
    fn log_error(&self, _action: &str, _details: &serde_json::Value) {}
}
