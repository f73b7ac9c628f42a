use crate::record::{AlertAction, AuditRecord, ResourceKind};

/// Selects a subset of the alert stream.
///
/// Log consumers filter on `policyName`, `action` and `resourceKind`; an
/// unset field matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub policy_name: Option<String>,
    pub action: Option<AlertAction>,
    pub resource_kind: Option<ResourceKind>,
}

impl LogFilter {
    pub fn with_policy(mut self, policy_name: impl Into<String>) -> Self {
        self.policy_name = Some(policy_name.into());
        self
    }

    pub fn with_action(mut self, action: AlertAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_kind(mut self, resource_kind: ResourceKind) -> Self {
        self.resource_kind = Some(resource_kind);
        self
    }

    pub fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(name) = &self.policy_name {
            if *name != record.policy_name {
                return false;
            }
        }
        if let Some(action) = self.action {
            if action != record.action {
                return false;
            }
        }
        if let Some(kind) = self.resource_kind {
            if kind != record.resource_kind {
                return false;
            }
        }
        true
    }
}
