use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use audit_log::{AuditRecord, AuditSink, EmitFailure};

use crate::decision::Verdict;
use crate::event::AccessEvent;

/// Which verdicts produce alerts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditMode {
    /// Blocks and `Audit` rules only.
    #[default]
    BlockOnly,
    /// Every verdict, including plain allows.
    All,
}

/// Turns verdicts into [`AuditRecord`]s and hands them to the sink without
/// waiting.
#[derive(Clone)]
pub struct AlertEmitter {
    sink: AuditSink,
    mode: AuditMode,
    host_name: Arc<str>,
}

impl AlertEmitter {
    pub fn new(sink: AuditSink, mode: AuditMode, host_name: impl Into<Arc<str>>) -> Self {
        Self {
            sink,
            mode,
            host_name: host_name.into(),
        }
    }

    pub fn mode(&self) -> AuditMode {
        self.mode
    }

    pub fn sink(&self) -> &AuditSink {
        &self.sink
    }

    pub fn should_emit(&self, verdict: &Verdict) -> bool {
        self.mode == AuditMode::All || verdict.requires_audit()
    }

    /// The record describing `verdict` for `event`.
    pub fn record_for(&self, event: &AccessEvent, verdict: &Verdict) -> AuditRecord {
        let record = AuditRecord::new(
            verdict.policy_name(),
            verdict.alert_action(),
            event.kind(),
            event.payload_snapshot(),
        )
        .with_timestamp(event.timestamp)
        .with_host(&*self.host_name)
        .with_process((&event.process).into());

        match &verdict.rule {
            Some(rule) => record
                .with_rule(rule.id.index, rule.name.clone())
                .with_metadata(rule.severity, rule.tags.clone(), rule.message.clone()),
            None => record,
        }
    }

    /// Emit an alert for `verdict` if the audit mode calls for one.
    ///
    /// Returns whether a record was queued. A failure is logged and counted
    /// by the sink; it never changes the verdict.
    pub fn emit(&self, event: &AccessEvent, verdict: &Verdict) -> Result<bool, EmitFailure> {
        if !self.should_emit(verdict) {
            return Ok(false);
        }
        let record = self.record_for(event, verdict);
        let id = record.id;
        match self.sink.try_log(record) {
            Ok(()) => {
                trace!(%id, policy = verdict.policy_name(), "alert queued");
                Ok(true)
            }
            Err(failure) => {
                warn!(
                    error = %failure,
                    policy = verdict.policy_name(),
                    rule = ?verdict.rule_id().map(|r| r.index),
                    dropped_total = self.sink.stats().dropped(),
                    "alert dropped"
                );
                Err(failure)
            }
        }
    }
}

impl std::fmt::Debug for AlertEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertEmitter")
            .field("mode", &self.mode)
            .field("host_name", &self.host_name)
            .finish_non_exhaustive()
    }
}
