//! Append-only JSON-lines alert stream for host security policy decisions.
//!
//! Every blocking decision (and every audited or, in audit-all mode, allowed
//! decision) produced by the enforcement engine becomes one [`AuditRecord`].
//! Records are handed to an [`AuditSink`] without waiting on I/O; a
//! background task appends them to a [JSON Lines](https://jsonlines.org/)
//! file and republishes them to live [`Subscription`]s.
//!
//! The serialized field names (`policyName`, `ruleId`, `action`,
//! `resourceKind`, ...) and their values (`"Block"`, `"File"`, ...) are a
//! compatibility surface for downstream log tooling and must stay stable.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use audit_log::{AlertAction, AuditRecord, AuditSink, LogFilter, ResourceKind};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (sink, _handle) = AuditSink::start("/var/log/hsp/alerts.jsonl", 1024).await?;
//! let mut blocks = sink.subscribe(LogFilter::default().with_action(AlertAction::Block));
//!
//! sink.try_log(AuditRecord::new(
//!     "test-hsp-policy-file-access",
//!     AlertAction::Block,
//!     ResourceKind::File,
//!     serde_json::json!({"path": "/etc/shadow", "operation": "Read"}),
//! ))?;
//!
//! let alert = blocks.next().await;
//! # Ok(())
//! # }
//! ```

pub mod filter;
pub mod record;
pub mod sink;
pub mod writer;

pub use filter::LogFilter;
pub use record::{AlertAction, AuditRecord, ParseKindError, ProcessContext, ResourceKind};
pub use sink::{AuditSink, EmitFailure, SinkStats, Subscription};
pub use writer::{AuditWriteError, AuditWriter};
