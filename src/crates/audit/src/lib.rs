//! Redacted append-only audit sink for chainflow.
//!
//! Every state transition in the system is recorded here. Metadata is
//! walked recursively and sensitive fields are replaced with a sentinel
//! before anything is stored or logged; security-severity events are also
//! republished on the watchtower window. Recording is best-effort: a failed
//! write never fails the operation that produced the event.

pub mod redact;
pub mod sink;

pub use redact::{is_sensitive_key, redact, REDACTION_SENTINEL};
pub use sink::{AuditEvent, AuditQuery, AuditRecord, AuditSink, Severity};
