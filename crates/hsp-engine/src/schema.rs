use serde::{Deserialize, Serialize};

/// A host security policy document as written by an administrator.
///
/// This is the loosely-typed wire form: kinds, actions and matcher fields are
/// plain strings here and are validated by [`crate::compile`], which rejects
/// the whole document on the first malformed rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDocument {
    /// Unique policy name; alerts carry it as `policyName`.
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Default severity (1..=10) for rules that do not set their own.
    #[serde(default)]
    pub severity: Option<u8>,
    /// Tags attached to every alert raised by this policy.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Default alert message for rules that do not set their own.
    #[serde(default)]
    pub message: Option<String>,
    /// Default action for rules that do not set their own.
    #[serde(default)]
    pub action: Option<String>,
    /// Ordered rules; declaration order is the final precedence tie-break.
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

/// One rule inside a [`PolicyDocument`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    #[serde(default)]
    pub name: Option<String>,
    /// `File`, `Network` or `Process` (case-insensitive).
    pub resource_kind: String,
    #[serde(default)]
    pub matcher: MatcherSpec,
    /// `Allow`, `Audit` or `Block` (case-insensitive).
    #[serde(default)]
    pub action: Option<String>,
    /// Lower numbers take precedence among otherwise-equal rules.
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub severity: Option<u8>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Restrict the rule to events raised by these executables.
    #[serde(default)]
    pub from_source: Vec<String>,
}

/// Union of every matcher field across resource kinds.
///
/// Which fields are allowed depends on the rule's `resourceKind`; fields of
/// another kind are a compile error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MatcherSpec {
    // File
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<String>,

    // File and Process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    #[serde(default)]
    pub recursive: bool,

    // Network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    // Process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args_pattern: Option<String>,
}
