pub mod model;
pub mod writer;

pub use model::{AuditError, AuditEvent, AuditEventType, AuditResult, AuditResultKind};
pub use writer::{AuditSink, MemoryAuditSink, NullAuditSink, PgAuditWriter};
