use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use audit_log::record::RESULT_DENIED;
use audit_log::AlertAction;

use crate::compiler::{CompiledRule, RuleId};

/// Policy name reported for verdicts that no rule produced.
pub const DEFAULT_POLICY_NAME: &str = "default";

/// The action a rule prescribes when it wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleAction {
    /// Let the operation proceed.
    Allow,
    /// Let the operation proceed and always record it.
    Audit,
    /// Deny the operation.
    Block,
}

impl RuleAction {
    /// Deny-overrides-allow ordering; higher wins at equal specificity.
    pub fn rank(self) -> u8 {
        match self {
            RuleAction::Allow => 0,
            RuleAction::Audit => 1,
            RuleAction::Block => 2,
        }
    }

    pub fn resolved(self) -> ResolvedAction {
        match self {
            RuleAction::Block => ResolvedAction::Block,
            RuleAction::Allow | RuleAction::Audit => ResolvedAction::Allow,
        }
    }
}

impl From<RuleAction> for AlertAction {
    fn from(action: RuleAction) -> Self {
        match action {
            RuleAction::Allow => AlertAction::Allow,
            RuleAction::Audit => AlertAction::Audit,
            RuleAction::Block => AlertAction::Block,
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&AlertAction::from(*self), f)
    }
}

impl FromStr for RuleAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "allow" => Ok(RuleAction::Allow),
            "audit" => Ok(RuleAction::Audit),
            "block" => Ok(RuleAction::Block),
            _ => Err(s.to_string()),
        }
    }
}

/// What the interception point does with the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolvedAction {
    Allow,
    Block,
}

impl From<ResolvedAction> for AlertAction {
    fn from(action: ResolvedAction) -> Self {
        match action {
            ResolvedAction::Allow => AlertAction::Allow,
            ResolvedAction::Block => AlertAction::Block,
        }
    }
}

/// Outcome for events no rule matches. There is deliberately no `Default`
/// impl: the posture must always be configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultPosture {
    Allow,
    Block,
}

impl DefaultPosture {
    pub fn resolved(self) -> ResolvedAction {
        match self {
            DefaultPosture::Allow => ResolvedAction::Allow,
            DefaultPosture::Block => ResolvedAction::Block,
        }
    }
}

impl FromStr for DefaultPosture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "allow" => Ok(DefaultPosture::Allow),
            "block" => Ok(DefaultPosture::Block),
            _ => Err(format!("invalid default posture '{s}': expected allow or block")),
        }
    }
}

/// The decision for one access event.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub action: ResolvedAction,
    /// The winning rule; `None` when the default posture decided.
    pub rule: Option<Arc<CompiledRule>>,
    /// Set when the winning rule is an `Audit` rule.
    pub audited: bool,
}

impl Verdict {
    pub fn from_rule(rule: Arc<CompiledRule>) -> Self {
        Self {
            action: rule.action.resolved(),
            audited: rule.action == RuleAction::Audit,
            rule: Some(rule),
        }
    }

    pub fn from_posture(posture: DefaultPosture) -> Self {
        Self {
            action: posture.resolved(),
            rule: None,
            audited: false,
        }
    }

    pub fn is_block(&self) -> bool {
        self.action == ResolvedAction::Block
    }

    pub fn rule_id(&self) -> Option<&RuleId> {
        self.rule.as_ref().map(|r| &r.id)
    }

    pub fn policy_name(&self) -> &str {
        self.rule
            .as_ref()
            .map_or(DEFAULT_POLICY_NAME, |r| &*r.id.policy)
    }

    /// Action reported in alerts: `Audit` for audit rules, otherwise the
    /// resolved action.
    pub fn alert_action(&self) -> AlertAction {
        if self.audited {
            AlertAction::Audit
        } else {
            self.action.into()
        }
    }

    /// Whether an alert is required independent of the audit mode.
    pub fn requires_audit(&self) -> bool {
        self.is_block() || self.audited
    }

    /// The result the intercepted operation observes.
    pub fn as_io_result(&self) -> io::Result<()> {
        match self.action {
            ResolvedAction::Allow => Ok(()),
            ResolvedAction::Block => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                RESULT_DENIED,
            )),
        }
    }
}

/// Two verdicts are equal when they resolve the same way for the same rule.
impl PartialEq for Verdict {
    fn eq(&self, other: &Self) -> bool {
        self.action == other.action
            && self.audited == other.audited
            && self.rule_id() == other.rule_id()
    }
}

impl Eq for Verdict {}
