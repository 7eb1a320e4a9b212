//! Structured JSONL audit logging for CONNECT decisions.

use serde::Serialize;
use std::net::SocketAddr;
use std::path::Path;

use crate::policy::PolicyDecision;

/// Event type for an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    ConnectAllowed,
    ConnectBlocked,
    AuthFailed,
    ConnectFailed,
    ConnectDelegated,
}

/// Decision outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditDecision {
    Allowed,
    Blocked,
    Delegated,
}

/// Reason for the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditReason {
    PolicyAllowed,
    NotAllowListed,
    DenyListed,
    AuthFailed,
    UpstreamUnreachable,
    /// The signing identity does not cover the host
    HostNotIntercepted,
}

impl From<PolicyDecision> for AuditReason {
    fn from(decision: PolicyDecision) -> Self {
        match decision {
            PolicyDecision::Allowed => AuditReason::PolicyAllowed,
            PolicyDecision::NotAllowListed => AuditReason::NotAllowListed,
            PolicyDecision::DenyListed => AuditReason::DenyListed,
        }
    }
}

/// A single audit log entry.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub event: AuditEvent,
    pub authority: String,
    pub client: String,
    /// Name of the chain handler that made the decision
    pub handler: &'static str,
    pub decision: AuditDecision,
    pub reason: AuditReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEntry {
    pub fn new(
        event: AuditEvent,
        authority: &str,
        client: SocketAddr,
        handler: &'static str,
        decision: AuditDecision,
        reason: AuditReason,
    ) -> Self {
        Self {
            timestamp: now_iso8601(),
            event,
            authority: authority.to_string(),
            client: client.to_string(),
            handler,
            decision,
            reason,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Returns the current UTC time as an ISO 8601 / RFC 3339 string.
pub fn now_iso8601() -> String {
    let now = time::OffsetDateTime::now_utc();
    now.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Audit logger that writes JSONL entries to a file.
///
/// Writes are small, so a `std::sync::Mutex` around a buffered file is enough.
pub struct AuditLogger {
    writer: std::sync::Mutex<std::io::BufWriter<std::fs::File>>,
}

impl AuditLogger {
    /// Open (or create) the audit log file in append mode.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            writer: std::sync::Mutex::new(std::io::BufWriter::new(file)),
        })
    }

    /// Write an audit entry as a JSON line. Errors are logged but never propagated.
    pub fn log(&self, entry: &AuditEntry) {
        use std::io::Write;
        let json = match serde_json::to_string(entry) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize audit entry");
                return;
            }
        };

        let mut writer = match self.writer.lock() {
            Ok(w) => w,
            Err(e) => {
                tracing::error!(error = %e, "Failed to lock audit log writer");
                return;
            }
        };
        if let Err(e) = writeln!(writer, "{}", json) {
            tracing::error!(error = %e, "Failed to write audit entry");
            return;
        }
        if let Err(e) = writer.flush() {
            tracing::error!(error = %e, "Failed to flush audit log");
        }
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger").finish_non_exhaustive()
    }
}
