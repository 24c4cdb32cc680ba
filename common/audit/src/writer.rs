use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::warn;

use crate::model::{AuditEvent, AuditResult};

/// Destination for audit events. Implementations must not block the caller:
/// `record` enqueues and returns, and a failed append never fails the
/// authenticated request that produced it.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> AuditResult<()>;
}

/// Sink that discards everything. Used where auditing is not configured.
#[derive(Debug, Clone, Default)]
pub struct NullAuditSink;

#[async_trait]
impl AuditSink for NullAuditSink {
    async fn record(&self, _event: AuditEvent) -> AuditResult<()> {
        Ok(())
    }
}

/// In-memory sink for tests: events are captured in arrival order.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("mutex poisoned").clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> AuditResult<()> {
        self.events.lock().expect("mutex poisoned").push(event);
        Ok(())
    }
}

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Appends audit events to `auth_audit_logs` from a bounded queue drained by
/// a dedicated worker, so audit latency cannot stall authentication. When the
/// queue is full the event is dropped with a warning rather than applying
/// backpressure.
#[derive(Clone)]
pub struct PgAuditWriter {
    sender: mpsc::Sender<AuditEvent>,
}

impl PgAuditWriter {
    pub fn spawn(pool: PgPool, queue_capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<AuditEvent>(queue_capacity.max(1));

        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let write = insert_event(&pool, &event);
                match tokio::time::timeout(WRITE_TIMEOUT, write).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        warn!(
                            error = %err,
                            event_type = event.event_type.as_str(),
                            tenant_id = %event.tenant_id,
                            "Failed to append audit event"
                        );
                    }
                    Err(_) => {
                        warn!(
                            event_type = event.event_type.as_str(),
                            tenant_id = %event.tenant_id,
                            "Audit append timed out"
                        );
                    }
                }
            }
        });

        Self { sender }
    }
}

#[async_trait]
impl AuditSink for PgAuditWriter {
    async fn record(&self, event: AuditEvent) -> AuditResult<()> {
        if let Err(err) = self.sender.try_send(event) {
            match err {
                mpsc::error::TrySendError::Full(dropped) => {
                    warn!(
                        event_type = dropped.event_type.as_str(),
                        "Audit queue full; dropping event"
                    );
                    return Err(crate::model::AuditError::QueueFull);
                }
                mpsc::error::TrySendError::Closed(_) => {
                    return Err(crate::model::AuditError::NotRunning);
                }
            }
        }
        Ok(())
    }
}

async fn insert_event(pool: &PgPool, event: &AuditEvent) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO auth_audit_logs
           (event_id, occurred_at, event_type, subject_id, tenant_id,
            credential_prefix, result, ip_address, user_agent, details, error_message)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    )
    .bind(event.event_id)
    .bind(event.occurred_at)
    .bind(event.event_type.as_str())
    .bind(&event.subject_id)
    .bind(&event.tenant_id)
    .bind(&event.credential_prefix)
    .bind(event.result.as_str())
    .bind(&event.ip_address)
    .bind(&event.user_agent)
    .bind(&event.details)
    .bind(&event.error_message)
    .execute(pool)
    .await
    .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AuditEventType, AuditResultKind};

    #[tokio::test]
    async fn memory_sink_captures_in_order() {
        let sink = MemoryAuditSink::new();
        for n in 0..3 {
            let event = AuditEvent::new(
                AuditEventType::CredentialValidated,
                format!("agent-{n}"),
                "tenant-1",
                AuditResultKind::Success,
            );
            sink.record(event).await.expect("record");
        }
        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].subject_id, "agent-0");
        assert_eq!(events[2].subject_id, "agent-2");
    }

    #[tokio::test]
    async fn null_sink_accepts_everything() {
        let sink = NullAuditSink;
        let event = AuditEvent::new(
            AuditEventType::TokenIssued,
            "client-1",
            "tenant-1",
            AuditResultKind::Success,
        );
        assert!(sink.record(event).await.is_ok());
    }
}
