use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use audit_log::{ParseKindError, ResourceKind};

use crate::decision::RuleAction;
use crate::event::{AccessEvent, FileOp};
use crate::matcher::{
    validate_absolute, FileMatcher, Matcher, MatcherError, NetworkMatcher, ProcessMatcher,
    Specificity,
};
use crate::schema::{MatcherSpec, PolicyDocument, RuleSpec};

/// Priority given to rules that do not declare one.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Longest accepted policy name.
const MAX_NAME_LEN: usize = 253;

/// Why a policy document was rejected. The document is rejected as a whole.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("invalid policy name '{0}': expected lowercase alphanumerics, '-' or '.'")]
    InvalidName(String),

    #[error("policy '{0}' has no rules")]
    NoRules(String),

    #[error("policy '{policy}' rule {index}: {source}")]
    InvalidRule {
        policy: String,
        index: usize,
        source: RuleError,
    },

    #[error(
        "policy '{policy}': rules {first} and {second} match the same operations \
         but disagree ({first_action} vs {second_action})"
    )]
    Conflict {
        policy: String,
        first: usize,
        second: usize,
        first_action: RuleAction,
        second_action: RuleAction,
    },
}

/// What is wrong with a single rule.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error(transparent)]
    Kind(#[from] ParseKindError),

    #[error("rule has no action and the policy declares no default action")]
    MissingAction,

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("severity {0} is outside 1..=10")]
    Severity(u8),

    #[error("field '{field}' does not apply to {kind} rules")]
    ForeignField {
        field: &'static str,
        kind: ResourceKind,
    },

    #[error("{0}")]
    Shape(&'static str),

    #[error("fromSource entry: {0}")]
    FromSource(MatcherError),

    #[error(transparent)]
    Matcher(#[from] MatcherError),
}

/// Identity of a compiled rule: owning policy plus declaration index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId {
    pub policy: Arc<str>,
    pub index: u32,
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.policy, self.index)
    }
}

/// A validated rule ready for the index.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub id: RuleId,
    pub name: Option<String>,
    pub matcher: Matcher,
    pub action: RuleAction,
    pub priority: i32,
    pub severity: Option<u8>,
    pub tags: Vec<String>,
    pub message: Option<String>,
    /// Sorted and deduplicated; empty means any originating process.
    pub from_source: Vec<String>,
}

impl CompiledRule {
    pub fn kind(&self) -> ResourceKind {
        self.matcher.kind()
    }

    pub fn matches(&self, event: &AccessEvent) -> bool {
        if !self.from_source.is_empty()
            && self
                .from_source
                .binary_search(&event.process.executable)
                .is_err()
        {
            return false;
        }
        self.matcher.matches(&event.payload)
    }

    /// Matcher specificity, with `fromSource`-scoped rules above unscoped
    /// ones at equal matcher specificity.
    pub fn specificity(&self) -> (Specificity, bool) {
        (self.matcher.specificity(), !self.from_source.is_empty())
    }

    /// Total order in which competing rules are consulted; `Less` means
    /// `self` wins.
    ///
    /// More specific first; at equal specificity Block, then Audit, then
    /// Allow; then lower priority; then higher severity, with unrated rules
    /// last; then policy name and declaration order.
    pub fn precedence_cmp(&self, other: &Self) -> Ordering {
        other
            .specificity()
            .cmp(&self.specificity())
            .then_with(|| other.action.rank().cmp(&self.action.rank()))
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| other.severity.cmp(&self.severity))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// The compiled, immutable form of one policy document.
#[derive(Debug, Clone)]
pub struct RuleSet {
    policy: Arc<str>,
    rules: Vec<Arc<CompiledRule>>,
}

impl RuleSet {
    pub fn policy(&self) -> &str {
        &self.policy
    }

    pub fn rules(&self) -> &[Arc<CompiledRule>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Resource kinds this policy governs, in canonical order.
    pub fn kinds(&self) -> Vec<ResourceKind> {
        ResourceKind::ALL
            .into_iter()
            .filter(|k| self.rules.iter().any(|r| r.kind() == *k))
            .collect()
    }
}

/// Compile a policy document into a [`RuleSet`].
///
/// Pure: the document is only read. Any malformed rule, and any pair of
/// rules that match identically but disagree on the action, rejects the
/// whole document.
pub fn compile(doc: &PolicyDocument) -> Result<RuleSet, CompileError> {
    if !valid_policy_name(&doc.name) {
        return Err(CompileError::InvalidName(doc.name.clone()));
    }
    if doc.rules.is_empty() {
        return Err(CompileError::NoRules(doc.name.clone()));
    }

    let policy: Arc<str> = Arc::from(doc.name.as_str());
    let mut rules = Vec::with_capacity(doc.rules.len());
    // canonical matcher + sources -> (first index, action)
    let mut seen: HashMap<(String, Vec<String>), (usize, RuleAction)> = HashMap::new();

    for (index, spec) in doc.rules.iter().enumerate() {
        let rule = compile_rule(doc, &policy, index, spec).map_err(|source| {
            CompileError::InvalidRule {
                policy: doc.name.clone(),
                index,
                source,
            }
        })?;

        let key = (rule.matcher.to_string(), rule.from_source.clone());
        match seen.get(&key) {
            Some(&(first, first_action)) if first_action != rule.action => {
                return Err(CompileError::Conflict {
                    policy: doc.name.clone(),
                    first,
                    second: index,
                    first_action,
                    second_action: rule.action,
                });
            }
            Some(&(first, _)) => {
                warn!(
                    policy = %doc.name,
                    first,
                    duplicate = index,
                    matcher = %key.0,
                    "duplicate rule in policy"
                );
            }
            None => {
                seen.insert(key, (index, rule.action));
            }
        }

        rules.push(Arc::new(rule));
    }

    debug!(policy = %doc.name, rules = rules.len(), "compiled policy");
    Ok(RuleSet { policy, rules })
}

fn compile_rule(
    doc: &PolicyDocument,
    policy: &Arc<str>,
    index: usize,
    spec: &RuleSpec,
) -> Result<CompiledRule, RuleError> {
    let kind: ResourceKind = spec.resource_kind.parse()?;
    let matcher = build_matcher(kind, &spec.matcher)?;

    let action = spec
        .action
        .as_deref()
        .or(doc.action.as_deref())
        .ok_or(RuleError::MissingAction)?;
    let action: RuleAction = action
        .parse()
        .map_err(|_| RuleError::UnknownAction(action.to_string()))?;

    let severity = spec.severity.or(doc.severity);
    if let Some(s) = severity {
        if !(1..=10).contains(&s) {
            return Err(RuleError::Severity(s));
        }
    }

    let mut from_source = spec.from_source.clone();
    for source in &from_source {
        validate_absolute(source).map_err(RuleError::FromSource)?;
    }
    from_source.sort();
    from_source.dedup();

    let mut tags = doc.tags.clone();
    for tag in &spec.tags {
        if !tags.contains(tag) {
            tags.push(tag.clone());
        }
    }

    Ok(CompiledRule {
        id: RuleId {
            policy: Arc::clone(policy),
            index: index as u32,
        },
        name: spec.name.clone(),
        matcher,
        action,
        priority: spec.priority.unwrap_or(DEFAULT_PRIORITY),
        severity,
        tags,
        message: spec.message.clone().or_else(|| doc.message.clone()),
        from_source,
    })
}

/// Turn the loose matcher fields into the typed matcher for `kind`.
fn build_matcher(kind: ResourceKind, m: &MatcherSpec) -> Result<Matcher, RuleError> {
    let foreign = |field: &'static str| RuleError::ForeignField { field, kind };

    match kind {
        ResourceKind::File => {
            reject_set(&m.protocol, "protocol").map_err(foreign)?;
            reject_set(&m.destination, "destination").map_err(foreign)?;
            reject_set(&m.port, "port").map_err(foreign)?;
            reject_set(&m.executable, "executable").map_err(foreign)?;
            reject_set(&m.args, "args").map_err(foreign)?;
            reject_set(&m.args_pattern, "argsPattern").map_err(foreign)?;

            let matcher = match (&m.path, &m.dir, &m.pattern) {
                (Some(path), None, None) => FileMatcher::exact(path)?,
                (None, Some(dir), None) => FileMatcher::directory(dir, m.recursive)?,
                (None, None, Some(pattern)) => FileMatcher::pattern(pattern)?,
                _ => {
                    return Err(RuleError::Shape(
                        "file rules need exactly one of 'path', 'dir' or 'pattern'",
                    ))
                }
            };
            if m.recursive && m.dir.is_none() {
                return Err(RuleError::Shape("'recursive' only applies to 'dir'"));
            }
            let operations = m
                .operations
                .iter()
                .map(|op| {
                    op.parse::<FileOp>()
                        .map_err(MatcherError::UnknownOperation)
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Matcher::File(matcher.with_operations(operations)))
        }
        ResourceKind::Network => {
            reject_set(&m.path, "path").map_err(foreign)?;
            reject_set(&m.pattern, "pattern").map_err(foreign)?;
            reject_set(&m.dir, "dir").map_err(foreign)?;
            reject_set(&m.executable, "executable").map_err(foreign)?;
            reject_set(&m.args, "args").map_err(foreign)?;
            reject_set(&m.args_pattern, "argsPattern").map_err(foreign)?;
            if !m.operations.is_empty() {
                return Err(foreign("operations"));
            }
            if m.recursive {
                return Err(foreign("recursive"));
            }

            let protocol = m
                .protocol
                .as_deref()
                .ok_or(RuleError::Shape("network rules need a 'protocol'"))?;
            Ok(Matcher::Network(NetworkMatcher::new(
                protocol,
                m.destination.as_deref(),
                m.port,
            )?))
        }
        ResourceKind::Process => {
            reject_set(&m.path, "path").map_err(foreign)?;
            reject_set(&m.pattern, "pattern").map_err(foreign)?;
            reject_set(&m.protocol, "protocol").map_err(foreign)?;
            reject_set(&m.destination, "destination").map_err(foreign)?;
            reject_set(&m.port, "port").map_err(foreign)?;
            if !m.operations.is_empty() {
                return Err(foreign("operations"));
            }

            let matcher = match (&m.executable, &m.dir) {
                (Some(exe), None) => ProcessMatcher::executable(exe)?,
                (None, Some(dir)) => ProcessMatcher::directory(dir, m.recursive)?,
                _ => {
                    return Err(RuleError::Shape(
                        "process rules need exactly one of 'executable' or 'dir'",
                    ))
                }
            };
            if m.recursive && m.dir.is_none() {
                return Err(RuleError::Shape("'recursive' only applies to 'dir'"));
            }
            let matcher = match (&m.args, &m.args_pattern) {
                (Some(args), None) => matcher.with_args(args.clone()),
                (None, Some(pattern)) => matcher.with_args_pattern(pattern)?,
                (None, None) => matcher,
                (Some(_), Some(_)) => {
                    return Err(RuleError::Shape(
                        "'args' and 'argsPattern' are mutually exclusive",
                    ))
                }
            };
            Ok(Matcher::Process(matcher))
        }
    }
}

fn reject_set<T>(value: &Option<T>, field: &'static str) -> Result<(), &'static str> {
    match value {
        Some(_) => Err(field),
        None => Ok(()),
    }
}

/// DNS-style names: lowercase alphanumerics, '-' and '.', starting and
/// ending with an alphanumeric.
fn valid_policy_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            name.len() <= MAX_NAME_LEN
                && first.is_ascii_alphanumeric()
                && last.is_ascii_alphanumeric()
                && bytes
                    .iter()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-' || *b == b'.')
        }
        _ => false,
    }
}
