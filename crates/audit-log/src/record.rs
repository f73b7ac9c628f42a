use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result string reported for blocked operations, matching what the
/// intercepted process observes.
pub const RESULT_DENIED: &str = "Permission denied";

/// Result string reported for operations that were let through.
pub const RESULT_PASSED: &str = "Passed";

/// One immutable alert describing a policy decision.
///
/// Records are never mutated after construction; the `with_*` methods are
/// builder-style and consume `self`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: uuid::Uuid,
    /// When the intercepted operation was observed.
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub host_name: String,
    /// Name of the policy owning the winning rule, or `"default"` when the
    /// verdict came from the configured default posture.
    pub policy_name: String,
    /// Declaration index of the winning rule within its policy.
    pub rule_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_name: Option<String>,
    pub action: AlertAction,
    pub resource_kind: ResourceKind,
    /// Snapshot of the kind-specific event payload.
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub result: String,
}

impl AuditRecord {
    /// Create a record stamped with a fresh UUID v4 and the current time.
    ///
    /// `result` is derived from `action`. Everything else optional starts
    /// empty and is filled in with the `with_*` builders.
    pub fn new(
        policy_name: impl Into<String>,
        action: AlertAction,
        resource_kind: ResourceKind,
        payload: serde_json::Value,
    ) -> Self {
        let result = match action {
            AlertAction::Block => RESULT_DENIED,
            AlertAction::Allow | AlertAction::Audit => RESULT_PASSED,
        };
        Self {
            id: uuid::Uuid::new_v4(),
            timestamp: Utc::now(),
            host_name: String::new(),
            policy_name: policy_name.into(),
            rule_id: None,
            rule_name: None,
            action,
            resource_kind,
            payload,
            process: None,
            severity: None,
            tags: Vec::new(),
            message: None,
            result: result.to_string(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_host(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = host_name.into();
        self
    }

    /// Attach the identity of the rule that produced the verdict.
    pub fn with_rule(mut self, rule_id: u32, rule_name: Option<String>) -> Self {
        self.rule_id = Some(rule_id);
        self.rule_name = rule_name;
        self
    }

    pub fn with_process(mut self, process: ProcessContext) -> Self {
        self.process = Some(process);
        self
    }

    /// Attach the policy author's severity, tags, and message.
    pub fn with_metadata(
        mut self,
        severity: Option<u8>,
        tags: Vec<String>,
        message: Option<String>,
    ) -> Self {
        self.severity = severity;
        self.tags = tags;
        self.message = message;
        self
    }
}

/// Originating process of the intercepted operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessContext {
    pub pid: u32,
    pub executable: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

/// The action reported in an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertAction {
    Allow,
    Audit,
    Block,
}

impl AlertAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertAction::Allow => "Allow",
            AlertAction::Audit => "Audit",
            AlertAction::Block => "Block",
        }
    }
}

impl fmt::Display for AlertAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertAction {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "allow" => Ok(AlertAction::Allow),
            "audit" => Ok(AlertAction::Audit),
            "block" => Ok(AlertAction::Block),
            _ => Err(ParseKindError {
                what: "action",
                value: s.to_string(),
            }),
        }
    }
}

/// The class of host resource an operation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    File,
    Network,
    Process,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [ResourceKind::File, ResourceKind::Network, ResourceKind::Process];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::File => "File",
            ResourceKind::Network => "Network",
            ResourceKind::Process => "Process",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(ResourceKind::File),
            "network" => Ok(ResourceKind::Network),
            "process" => Ok(ResourceKind::Process),
            _ => Err(ParseKindError {
                what: "resource kind",
                value: s.to_string(),
            }),
        }
    }
}

/// Returned when a string does not name a known action or resource kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported {what}: '{value}'")]
pub struct ParseKindError {
    pub what: &'static str,
    pub value: String,
}
