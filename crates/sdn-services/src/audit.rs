//! Audit trail — admission outcomes and per-session faults.
//!
//! Sinks are fire-and-forget: `record` cannot fail, and a sink that runs
//! into trouble logs it and carries on. Nothing an audit sink does may
//! influence an admission decision or a session's teardown.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use sdn_core::Identity;
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::registry::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Admitted,
    Denied,
    HandshakeTimeout,
    TransportFault,
    RuleInstallFault,
}

/// One audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub session: SessionId,
    pub peer: SocketAddr,
    pub identity: Option<Identity>,
    pub outcome: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn now(
        session: SessionId,
        peer: SocketAddr,
        identity: Option<Identity>,
        outcome: AuditOutcome,
    ) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            timestamp_ms,
            session,
            peer,
            identity,
            outcome,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Receiver of audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

pub type SharedAudit = Arc<dyn AuditSink>;

/// Emits every event as a structured `tracing` record on the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, event: &AuditEvent) {
        let identity = event.identity.map(|i| i.to_string()).unwrap_or_default();
        let detail = event.detail.as_deref().unwrap_or("");
        match event.outcome {
            AuditOutcome::Admitted => tracing::info!(
                target: "audit",
                session = event.session,
                peer = %event.peer,
                identity = %identity,
                "datapath admitted"
            ),
            AuditOutcome::Denied => tracing::warn!(
                target: "audit",
                session = event.session,
                peer = %event.peer,
                identity = %identity,
                "datapath denied"
            ),
            outcome => tracing::warn!(
                target: "audit",
                session = event.session,
                peer = %event.peer,
                identity = %identity,
                ?outcome,
                detail,
                "session fault"
            ),
        }
    }
}

/// Appends one JSON object per line to a file.
///
/// `record` only serializes and queues the line; a background task owns the
/// file and does the writing, so a slow disk never stalls the caller.
pub struct JsonlAudit {
    lines: mpsc::UnboundedSender<String>,
}

impl JsonlAudit {
    /// Open `path` for appending and spawn its writer task. The task ends,
    /// after writing everything queued, once the sink is dropped.
    pub async fn open(path: &Path) -> io::Result<(Self, JoinHandle<()>)> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        let (lines, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_lines(file, rx));
        Ok((Self { lines }, writer))
    }
}

async fn write_lines(mut file: File, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        let written = async {
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        };
        if let Err(e) = written.await {
            tracing::warn!(error = %e, "failed to append audit event");
        }
    }
}

impl AuditSink for JsonlAudit {
    fn record(&self, event: &AuditEvent) {
        let mut line = match serde_json::to_string(event) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit event");
                return;
            }
        };
        line.push('\n');
        if self.lines.send(line).is_err() {
            tracing::warn!("audit log writer has stopped, event dropped");
        }
    }
}

/// Forwards events to several sinks in order.
#[derive(Default, Clone)]
pub struct Fanout {
    sinks: Vec<SharedAudit>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: SharedAudit) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl AuditSink for Fanout {
    fn record(&self, event: &AuditEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}

/// Channel sink; a closed receiver is ignored.
impl AuditSink for mpsc::UnboundedSender<AuditEvent> {
    fn record(&self, event: &AuditEvent) {
        let _ = self.send(event.clone());
    }
}
