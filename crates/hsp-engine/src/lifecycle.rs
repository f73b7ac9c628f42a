//! Policy lifecycle management.
//!
//! [`PolicyLifecycle`] owns the per-name state table and is the only writer
//! of the [`RuleIndex`]. It is normally driven through a [`LifecycleHandle`]:
//! callers enqueue commands on a channel and a single manager task applies
//! them one at a time, so policy changes are serialized against each other
//! while decisions keep reading the index concurrently.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use audit_log::ResourceKind;

use crate::compiler::{compile, CompileError};
use crate::index::{IndexError, RuleIndex};
use crate::schema::PolicyDocument;

/// Where a policy name stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PolicyState {
    Absent,
    /// Being compiled and inserted; never visible to decisions.
    Pending,
    Active,
}

impl fmt::Display for PolicyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PolicyState::Absent => "Absent",
            PolicyState::Pending => "Pending",
            PolicyState::Active => "Active",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Replaced,
}

/// Status line for one known policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    pub name: String,
    pub state: PolicyState,
    pub rules: usize,
    pub kinds: Vec<ResourceKind>,
    pub activated_at: Option<DateTime<Utc>>,
    /// Index generation that made the current version live.
    pub generation: u64,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("policy '{0}' does not exist")]
    NotFound(String),

    #[error("policy lifecycle manager is not running")]
    ManagerStopped,
}

impl LifecycleError {
    /// The index can no longer be trusted; the daemon must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LifecycleError::Index(IndexError::Consistency { .. }))
    }
}

#[derive(Debug, Clone)]
struct PolicyEntry {
    state: PolicyState,
    rules: usize,
    kinds: Vec<ResourceKind>,
    activated_at: Option<DateTime<Utc>>,
    generation: u64,
}

impl PolicyEntry {
    fn pending() -> Self {
        Self {
            state: PolicyState::Pending,
            rules: 0,
            kinds: Vec::new(),
            activated_at: None,
            generation: 0,
        }
    }
}

/// Owner of the policy table and sole writer of the rule index.
#[derive(Debug)]
pub struct PolicyLifecycle {
    index: Arc<RuleIndex>,
    table: BTreeMap<String, PolicyEntry>,
}

impl PolicyLifecycle {
    pub fn new(index: Arc<RuleIndex>) -> Self {
        Self {
            index,
            table: BTreeMap::new(),
        }
    }

    pub fn index(&self) -> &Arc<RuleIndex> {
        &self.index
    }

    pub fn state(&self, name: &str) -> PolicyState {
        self.table
            .get(name)
            .map_or(PolicyState::Absent, |e| e.state)
    }

    /// Create `doc`, or replace the active policy of the same name.
    ///
    /// If compiling or inserting fails, a new policy goes back to `Absent`
    /// and a replaced policy keeps its previous version active.
    pub fn apply(&mut self, doc: &PolicyDocument) -> Result<ApplyOutcome, LifecycleError> {
        let name = doc.name.clone();
        let previous = self.table.get(&name).cloned();
        self.table
            .entry(name.clone())
            .and_modify(|e| e.state = PolicyState::Pending)
            .or_insert_with(PolicyEntry::pending);

        match self.install(doc, previous.is_some()) {
            Ok(entry) => {
                let outcome = if previous.is_some() {
                    ApplyOutcome::Replaced
                } else {
                    ApplyOutcome::Created
                };
                info!(
                    policy = %name,
                    rules = entry.rules,
                    generation = entry.generation,
                    outcome = ?outcome,
                    "policy active"
                );
                self.table.insert(name, entry);
                Ok(outcome)
            }
            Err(err) => {
                match previous {
                    Some(prev) => {
                        warn!(policy = %name, error = %err, "policy update rejected; previous version stays active");
                        self.table.insert(name, prev);
                    }
                    None => {
                        warn!(policy = %name, error = %err, "policy rejected");
                        self.table.remove(&name);
                    }
                }
                Err(err)
            }
        }
    }

    fn install(&self, doc: &PolicyDocument, replace: bool) -> Result<PolicyEntry, LifecycleError> {
        let set = compile(doc)?;
        let rules = set.len();
        let kinds = set.kinds();
        let generation = if replace {
            self.index.replace_policy(set)?
        } else {
            self.index.add_policy(set)?
        };
        Ok(PolicyEntry {
            state: PolicyState::Active,
            rules,
            kinds,
            activated_at: Some(Utc::now()),
            generation,
        })
    }

    /// Remove the active policy `name` and all of its rules.
    pub fn delete(&mut self, name: &str) -> Result<(), LifecycleError> {
        if !self.table.contains_key(name) {
            return Err(LifecycleError::NotFound(name.to_string()));
        }
        self.index.remove_policy(name)?;
        self.table.remove(name);
        info!(policy = %name, "policy removed");
        Ok(())
    }

    /// Remove every policy. Returns the names removed; stops at the first
    /// index failure.
    pub fn delete_all(&mut self) -> Result<Vec<String>, LifecycleError> {
        let names: Vec<String> = self.table.keys().cloned().collect();
        for name in &names {
            self.delete(name)?;
        }
        Ok(names)
    }

    pub fn status(&self) -> Vec<PolicyStatus> {
        self.table
            .iter()
            .map(|(name, e)| PolicyStatus {
                name: name.clone(),
                state: e.state,
                rules: e.rules,
                kinds: e.kinds.clone(),
                activated_at: e.activated_at,
                generation: e.generation,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Message-passing front end
// ---------------------------------------------------------------------------

type Reply<T> = oneshot::Sender<Result<T, LifecycleError>>;

/// A request for the manager task.
#[derive(Debug)]
pub enum PolicyCommand {
    Apply {
        doc: Box<PolicyDocument>,
        reply: Reply<ApplyOutcome>,
    },
    Delete {
        name: String,
        reply: Reply<()>,
    },
    DeleteAll {
        reply: Reply<Vec<String>>,
    },
    Status {
        reply: oneshot::Sender<Vec<PolicyStatus>>,
    },
}

/// Cloneable sender side of the lifecycle manager.
#[derive(Debug, Clone)]
pub struct LifecycleHandle {
    tx: mpsc::Sender<PolicyCommand>,
}

/// Start the manager task. It runs until every handle is dropped, or until
/// the index reports an inconsistency.
pub fn spawn(
    mut lifecycle: PolicyLifecycle,
    buffer: usize,
) -> (LifecycleHandle, JoinHandle<PolicyLifecycle>) {
    let (tx, mut rx) = mpsc::channel::<PolicyCommand>(buffer.max(1));

    let task = tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            let fatal = match cmd {
                PolicyCommand::Apply { doc, reply } => {
                    let result = lifecycle.apply(&doc);
                    respond(reply, result)
                }
                PolicyCommand::Delete { name, reply } => {
                    let result = lifecycle.delete(&name);
                    respond(reply, result)
                }
                PolicyCommand::DeleteAll { reply } => {
                    let result = lifecycle.delete_all();
                    respond(reply, result)
                }
                PolicyCommand::Status { reply } => {
                    let _ = reply.send(lifecycle.status());
                    false
                }
            };
            if fatal {
                error!("rule index is inconsistent; lifecycle manager stopping");
                break;
            }
        }
        lifecycle
    });

    (LifecycleHandle { tx }, task)
}

/// Send `result` back; returns whether it was fatal.
fn respond<T>(reply: Reply<T>, result: Result<T, LifecycleError>) -> bool {
    let fatal = matches!(&result, Err(e) if e.is_fatal());
    // The caller may have stopped waiting; the change is applied either way.
    let _ = reply.send(result);
    fatal
}

impl LifecycleHandle {
    pub async fn apply(&self, doc: PolicyDocument) -> Result<ApplyOutcome, LifecycleError> {
        let (reply, rx) = oneshot::channel();
        self.send(PolicyCommand::Apply {
            doc: Box::new(doc),
            reply,
        })
        .await?;
        rx.await.map_err(|_| LifecycleError::ManagerStopped)?
    }

    pub async fn delete(&self, name: impl Into<String>) -> Result<(), LifecycleError> {
        let (reply, rx) = oneshot::channel();
        self.send(PolicyCommand::Delete {
            name: name.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| LifecycleError::ManagerStopped)?
    }

    pub async fn delete_all(&self) -> Result<Vec<String>, LifecycleError> {
        let (reply, rx) = oneshot::channel();
        self.send(PolicyCommand::DeleteAll { reply }).await?;
        rx.await.map_err(|_| LifecycleError::ManagerStopped)?
    }

    pub async fn status(&self) -> Result<Vec<PolicyStatus>, LifecycleError> {
        let (reply, rx) = oneshot::channel();
        self.send(PolicyCommand::Status { reply }).await?;
        rx.await.map_err(|_| LifecycleError::ManagerStopped)
    }

    async fn send(&self, cmd: PolicyCommand) -> Result<(), LifecycleError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| LifecycleError::ManagerStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::DefaultPosture;
    use crate::evaluator::DecisionEngine;
    use crate::event::{AccessEvent, FileOp};
    use crate::loader::load_policy_from_str;

    fn doc(yaml: &str) -> PolicyDocument {
        load_policy_from_str(yaml).unwrap()
    }

    fn shadow(action: &str) -> PolicyDocument {
        doc(&format!(
            "name: shadow\nrules:\n  - resourceKind: File\n    matcher: {{ path: /etc/shadow }}\n    action: {action}\n"
        ))
    }

    const BROKEN: &str = r#"
name: shadow
rules:
  - resourceKind: File
    matcher: { path: relative/shadow }
    action: Block
"#;

    fn shadow_rule_action(index: &RuleIndex) -> Option<String> {
        let event = AccessEvent::file("/etc/shadow", FileOp::Read);
        index
            .lookup(ResourceKind::File, &event)
            .first()
            .map(|r| r.action.to_string())
    }

    #[test]
    fn create_replace_delete() {
        let index = Arc::new(RuleIndex::new());
        let mut lc = PolicyLifecycle::new(Arc::clone(&index));
        assert_eq!(lc.state("shadow"), PolicyState::Absent);

        assert_eq!(lc.apply(&shadow("Block")).unwrap(), ApplyOutcome::Created);
        assert_eq!(lc.state("shadow"), PolicyState::Active);
        assert_eq!(shadow_rule_action(&index).as_deref(), Some("Block"));

        assert_eq!(lc.apply(&shadow("Allow")).unwrap(), ApplyOutcome::Replaced);
        assert_eq!(shadow_rule_action(&index).as_deref(), Some("Allow"));
        assert_eq!(index.snapshot().len(), 1);

        lc.delete("shadow").unwrap();
        assert_eq!(lc.state("shadow"), PolicyState::Absent);
        assert!(shadow_rule_action(&index).is_none());
        assert!(matches!(
            lc.delete("shadow"),
            Err(LifecycleError::NotFound(_))
        ));
    }

    #[test]
    fn failed_create_reverts_to_absent() {
        let index = Arc::new(RuleIndex::new());
        let mut lc = PolicyLifecycle::new(Arc::clone(&index));

        let err = lc.apply(&doc(BROKEN)).unwrap_err();
        assert!(matches!(err, LifecycleError::Compile(_)));
        assert!(!err.is_fatal());
        assert_eq!(lc.state("shadow"), PolicyState::Absent);
        assert!(index.snapshot().is_empty());
        assert!(lc.status().is_empty());
    }

    #[test]
    fn failed_replace_keeps_previous_version() {
        let index = Arc::new(RuleIndex::new());
        let mut lc = PolicyLifecycle::new(Arc::clone(&index));
        lc.apply(&shadow("Block")).unwrap();
        let generation = index.snapshot().generation();

        assert!(lc.apply(&doc(BROKEN)).is_err());
        assert_eq!(lc.state("shadow"), PolicyState::Active);
        assert_eq!(shadow_rule_action(&index).as_deref(), Some("Block"));
        assert_eq!(index.snapshot().generation(), generation);
    }

    #[test]
    fn status_reports_rules_and_kinds() {
        let mut lc = PolicyLifecycle::new(Arc::new(RuleIndex::new()));
        lc.apply(&doc(
            r#"
name: mixed
action: Block
rules:
  - resourceKind: Process
    matcher: { executable: /bin/ping }
  - resourceKind: File
    matcher: { path: /etc/shadow }
"#,
        ))
        .unwrap();

        let status = lc.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].name, "mixed");
        assert_eq!(status[0].state, PolicyState::Active);
        assert_eq!(status[0].rules, 2);
        assert_eq!(
            status[0].kinds,
            vec![ResourceKind::File, ResourceKind::Process]
        );
        assert!(status[0].activated_at.is_some());
        assert_eq!(status[0].generation, 1);
    }

    #[tokio::test]
    async fn handle_serializes_commands() {
        let index = Arc::new(RuleIndex::new());
        let (handle, task) = spawn(PolicyLifecycle::new(Arc::clone(&index)), 8);

        assert_eq!(
            handle.apply(shadow("Block")).await.unwrap(),
            ApplyOutcome::Created
        );
        assert_eq!(
            handle.apply(shadow("Audit")).await.unwrap(),
            ApplyOutcome::Replaced
        );
        assert_eq!(shadow_rule_action(&index).as_deref(), Some("Audit"));

        let status = handle.status().await.unwrap();
        assert_eq!(status[0].state, PolicyState::Active);

        assert!(matches!(
            handle.delete("ghost").await,
            Err(LifecycleError::NotFound(_))
        ));

        assert_eq!(handle.delete_all().await.unwrap(), vec!["shadow"]);
        assert!(index.snapshot().is_empty());

        drop(handle);
        let lifecycle = task.await.unwrap();
        assert!(lifecycle.status().is_empty());
    }

    #[tokio::test]
    async fn stopped_manager_is_reported() {
        let (handle, task) = spawn(PolicyLifecycle::new(Arc::new(RuleIndex::new())), 1);
        task.abort();
        let _ = task.await;
        assert!(matches!(
            handle.status().await,
            Err(LifecycleError::ManagerStopped)
        ));
    }

    #[tokio::test]
    async fn delete_all_falls_back_to_default_posture() {
        let index = Arc::new(RuleIndex::new());
        let (handle, _task) = spawn(PolicyLifecycle::new(Arc::clone(&index)), 8);
        handle.apply(shadow("Allow")).await.unwrap();
        handle
            .apply(doc(
                r#"
name: ping
rules:
  - resourceKind: Process
    matcher: { executable: /bin/ping }
    action: Allow
"#,
            ))
            .await
            .unwrap();

        let engine = DecisionEngine::new(Arc::clone(&index), DefaultPosture::Block);
        let read_shadow = AccessEvent::file("/etc/shadow", FileOp::Read);
        let ping = AccessEvent::exec("/bin/ping", ["localhost"]);
        assert!(!engine.decide(&read_shadow).is_block());
        assert!(!engine.decide(&ping).is_block());

        assert_eq!(handle.delete_all().await.unwrap(), vec!["ping", "shadow"]);

        for event in [&read_shadow, &ping] {
            let verdict = engine.decide(event);
            assert!(verdict.is_block());
            assert!(verdict.rule_id().is_none());
            assert_eq!(verdict.policy_name(), "default");
        }
        assert!(handle.status().await.unwrap().is_empty());
    }
}
