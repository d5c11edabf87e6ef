//! Best-effort audit trail of admission decisions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::Result;

/// One audit record.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub labels: BTreeMap<String, String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// Create an entry stamped with the current time.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            labels: BTreeMap::new(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Attach a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Receives audit entries. Failures never affect admission.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn push(&self, entry: AuditEntry) -> Result<()>;
}

/// Writes audit entries as `tracing` events under the `tollgate::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn push(&self, entry: AuditEntry) -> Result<()> {
        info!(
            target: "tollgate::audit",
            labels = ?entry.labels,
            timestamp = %entry.timestamp.to_rfc3339(),
            "{}",
            entry.message
        );
        Ok(())
    }
}

/// Push `entry` on a detached task, logging and discarding any failure.
///
/// Callers normally drop the returned handle.
pub fn dispatch(sink: Arc<dyn AuditSink>, entry: AuditEntry) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = sink.push(entry).await {
            warn!(error = %e, "Failed to push audit entry");
        }
    })
}
