//! The live rule set, grouped by resource kind.
//!
//! The index is a copy-on-write snapshot. Readers take an `Arc` of the
//! current [`IndexSnapshot`] and work against it without holding any lock;
//! writers are serialized by a separate mutex, build a complete replacement
//! snapshot, and swap it in under a short write lock. A lookup that races a
//! policy change therefore sees either the whole old rule set or the whole
//! new one.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, error};

use audit_log::ResourceKind;

use crate::compiler::{CompiledRule, RuleSet};
use crate::event::AccessEvent;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("policy '{0}' is already loaded")]
    DuplicatePolicy(String),

    #[error("policy '{0}' is not loaded")]
    PolicyNotFound(String),

    #[error("rule index inconsistent for policy '{policy}': {detail}")]
    Consistency { policy: String, detail: String },
}

fn slot(kind: ResourceKind) -> usize {
    match kind {
        ResourceKind::File => 0,
        ResourceKind::Network => 1,
        ResourceKind::Process => 2,
    }
}

/// An immutable view of every loaded rule.
#[derive(Debug, Default)]
pub struct IndexSnapshot {
    generation: u64,
    /// Policy name -> number of rules it contributed.
    policies: BTreeMap<Arc<str>, usize>,
    /// Per-kind rules, presorted by precedence.
    by_kind: [Vec<Arc<CompiledRule>>; 3],
}

impl IndexSnapshot {
    /// Incremented by every successful write.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn contains(&self, policy: &str) -> bool {
        self.policies.contains_key(policy)
    }

    pub fn policy_names(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(|k| &**k)
    }

    pub fn rule_count(&self, policy: &str) -> Option<usize> {
        self.policies.get(policy).copied()
    }

    pub fn len(&self) -> usize {
        self.by_kind.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rules(&self, kind: ResourceKind) -> &[Arc<CompiledRule>] {
        &self.by_kind[slot(kind)]
    }

    /// Matching rules of `kind`, in precedence order.
    pub fn matches<'a>(
        &'a self,
        kind: ResourceKind,
        event: &'a AccessEvent,
    ) -> impl Iterator<Item = &'a Arc<CompiledRule>> + 'a {
        self.rules(kind).iter().filter(move |r| r.matches(event))
    }

    /// The winning rule for `event`, if any rule matches.
    pub fn first_match(&self, event: &AccessEvent) -> Option<&Arc<CompiledRule>> {
        self.rules(event.kind()).iter().find(|r| r.matches(event))
    }

    fn with_policy(&self, set: &RuleSet) -> Self {
        let mut by_kind = self.by_kind.clone();
        for rule in set.rules() {
            by_kind[slot(rule.kind())].push(Arc::clone(rule));
        }
        for rules in &mut by_kind {
            rules.sort_by(|a, b| a.precedence_cmp(b));
        }
        let mut policies = self.policies.clone();
        policies.insert(Arc::from(set.policy()), set.len());
        Self {
            generation: self.generation + 1,
            policies,
            by_kind,
        }
    }

    fn without_policy(&self, policy: &str) -> Result<Self, IndexError> {
        let expected = self.rule_count(policy).unwrap_or(0);
        let mut removed = 0;
        let by_kind = self.by_kind.clone().map(|rules| {
            let before = rules.len();
            let kept: Vec<_> = rules
                .into_iter()
                .filter(|r| &*r.id.policy != policy)
                .collect();
            removed += before - kept.len();
            kept
        });
        if removed != expected {
            return Err(IndexError::Consistency {
                policy: policy.to_string(),
                detail: format!("expected {expected} rules, found {removed}"),
            });
        }
        let mut policies = self.policies.clone();
        policies.remove(policy);
        Ok(Self {
            generation: self.generation + 1,
            policies,
            by_kind,
        })
    }
}

/// Concurrent, atomically updated rule store.
#[derive(Debug, Default)]
pub struct RuleIndex {
    current: RwLock<Arc<IndexSnapshot>>,
    writer: Mutex<()>,
}

impl RuleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot. Holding it keeps its rules alive even if the
    /// policy is removed meanwhile.
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Insert every rule of `set` as one unit.
    pub fn add_policy(&self, set: RuleSet) -> Result<u64, IndexError> {
        let _guard = self.writer.lock();
        let base = self.snapshot();
        if base.contains(set.policy()) {
            return Err(IndexError::DuplicatePolicy(set.policy().to_string()));
        }
        let next = base.with_policy(&set);
        Ok(self.publish(next, set.policy(), "added"))
    }

    /// Remove every rule owned by `policy` as one unit.
    pub fn remove_policy(&self, policy: &str) -> Result<u64, IndexError> {
        let _guard = self.writer.lock();
        let base = self.snapshot();
        if !base.contains(policy) {
            return Err(IndexError::PolicyNotFound(policy.to_string()));
        }
        let next = base
            .without_policy(policy)
            .inspect_err(|e| error!(error = %e, "refusing to publish torn index"))?;
        Ok(self.publish(next, policy, "removed"))
    }

    /// Swap an already-loaded policy for a new version in a single step.
    pub fn replace_policy(&self, set: RuleSet) -> Result<u64, IndexError> {
        let _guard = self.writer.lock();
        let base = self.snapshot();
        if !base.contains(set.policy()) {
            return Err(IndexError::PolicyNotFound(set.policy().to_string()));
        }
        let next = base
            .without_policy(set.policy())
            .inspect_err(|e| error!(error = %e, "refusing to publish torn index"))?
            .with_policy(&set);
        // without_policy and with_policy each bump the generation once
        let next = IndexSnapshot {
            generation: base.generation + 1,
            ..next
        };
        Ok(self.publish(next, set.policy(), "replaced"))
    }

    /// Matching rules of `kind` for `event`, in precedence order.
    pub fn lookup(&self, kind: ResourceKind, event: &AccessEvent) -> Vec<Arc<CompiledRule>> {
        self.snapshot().matches(kind, event).cloned().collect()
    }

    pub fn policy_names(&self) -> Vec<String> {
        self.snapshot().policy_names().map(str::to_string).collect()
    }

    fn publish(&self, next: IndexSnapshot, policy: &str, op: &'static str) -> u64 {
        let generation = next.generation;
        let rules = next.len();
        *self.current.write() = Arc::new(next);
        debug!(policy, op, generation, rules, "rule index updated");
        generation
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    use super::*;
    use crate::compiler::compile;
    use crate::decision::RuleAction;
    use crate::event::FileOp;
    use crate::loader::load_policy_from_str;

    fn rule_set(yaml: &str) -> RuleSet {
        compile(&load_policy_from_str(yaml).unwrap()).unwrap()
    }

    fn shadow_policy(action: &str) -> RuleSet {
        rule_set(&format!(
            "name: shadow\nrules:\n  - resourceKind: File\n    matcher: {{ path: /etc/shadow }}\n    action: {action}\n"
        ))
    }

    fn etc_policy() -> RuleSet {
        rule_set(
            r#"
name: etc
rules:
  - resourceKind: File
    matcher: { pattern: "/etc/*" }
    action: Allow
  - resourceKind: Network
    matcher: { protocol: udp }
    action: Block
  - resourceKind: Process
    matcher: { dir: /usr/bin }
    action: Allow
"#,
        )
    }

    #[test]
    fn add_groups_rules_by_kind() {
        let index = RuleIndex::new();
        assert_eq!(index.add_policy(etc_policy()).unwrap(), 1);

        let snap = index.snapshot();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap.rule_count("etc"), Some(3));
        for kind in ResourceKind::ALL {
            assert_eq!(snap.rules(kind).len(), 1, "{kind}");
        }
    }

    #[test]
    fn duplicate_add_is_rejected_without_change() {
        let index = RuleIndex::new();
        index.add_policy(shadow_policy("Block")).unwrap();
        let err = index.add_policy(shadow_policy("Allow")).unwrap_err();
        assert!(matches!(err, IndexError::DuplicatePolicy(name) if name == "shadow"));

        let snap = index.snapshot();
        assert_eq!(snap.generation(), 1);
        assert_eq!(snap.rules(ResourceKind::File)[0].action, RuleAction::Block);
    }

    #[test]
    fn remove_unknown_policy_fails() {
        let index = RuleIndex::new();
        assert!(matches!(
            index.remove_policy("ghost"),
            Err(IndexError::PolicyNotFound(_))
        ));
    }

    #[test]
    fn lookup_orders_by_precedence_across_policies() {
        let index = RuleIndex::new();
        index.add_policy(etc_policy()).unwrap();
        index.add_policy(shadow_policy("Block")).unwrap();

        let event = AccessEvent::file("/etc/shadow", FileOp::Read);
        let hits = index.lookup(ResourceKind::File, &event);
        let owners: Vec<&str> = hits.iter().map(|r| &*r.id.policy).collect();
        assert_eq!(owners, vec!["shadow", "etc"]);

        let other = AccessEvent::file("/etc/hosts", FileOp::Read);
        assert_eq!(index.lookup(ResourceKind::File, &other).len(), 1);
        assert!(index.lookup(ResourceKind::Network, &other).is_empty());
    }

    #[test]
    fn remove_takes_every_rule_of_the_policy() {
        let index = RuleIndex::new();
        index.add_policy(etc_policy()).unwrap();
        index.add_policy(shadow_policy("Block")).unwrap();
        assert_eq!(index.remove_policy("etc").unwrap(), 3);

        let snap = index.snapshot();
        assert_eq!(snap.len(), 1);
        assert!(!snap.contains("etc"));
        assert_eq!(index.policy_names(), vec!["shadow"]);
    }

    #[test]
    fn replace_swaps_versions_in_one_generation() {
        let index = RuleIndex::new();
        index.add_policy(shadow_policy("Block")).unwrap();
        let before = index.snapshot();

        assert_eq!(index.replace_policy(shadow_policy("Allow")).unwrap(), 2);
        let after = index.snapshot();
        assert_eq!(after.rules(ResourceKind::File)[0].action, RuleAction::Allow);

        // The old snapshot is untouched.
        assert_eq!(before.rules(ResourceKind::File)[0].action, RuleAction::Block);

        assert!(matches!(
            index.replace_policy(etc_policy()),
            Err(IndexError::PolicyNotFound(_))
        ));
    }

    #[test]
    fn first_match_outlives_the_event() {
        let index = RuleIndex::new();
        index.add_policy(shadow_policy("Block")).unwrap();
        let snap = index.snapshot();

        let winner = {
            let event = AccessEvent::file("/etc/shadow", FileOp::Read);
            snap.first_match(&event)
        };
        assert_eq!(winner.map(|r| r.action), Some(RuleAction::Block));
    }

    #[test]
    fn concurrent_lookups_never_see_partial_policy() {
        let index = Arc::new(RuleIndex::new());
        let stop = Arc::new(AtomicBool::new(false));
        let multi = rule_set(
            r#"
name: multi
rules:
  - resourceKind: File
    matcher: { path: /etc/shadow }
    action: Block
  - resourceKind: File
    matcher: { dir: /etc }
    action: Block
  - resourceKind: File
    matcher: { pattern: "/etc/sha*" }
    action: Block
"#,
        );

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let index = Arc::clone(&index);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    let event = AccessEvent::file("/etc/shadow", FileOp::Read);
                    let mut observed = 0usize;
                    loop {
                        let n = index.lookup(ResourceKind::File, &event).len();
                        assert!(n == 0 || n == 3, "torn read: {n} rules");
                        observed += 1;
                        if stop.load(Ordering::Relaxed) {
                            return observed;
                        }
                    }
                })
            })
            .collect();

        for _ in 0..200 {
            index.add_policy(multi.clone()).unwrap();
            index.remove_policy("multi").unwrap();
        }
        stop.store(true, Ordering::Relaxed);

        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
        assert_eq!(index.snapshot().generation(), 400);
        assert!(index.snapshot().is_empty());
    }

    #[test]
    fn concurrent_lookups_see_whole_versions_during_replace() {
        let blocking = rule_set(
            r#"
name: multi
rules:
  - resourceKind: File
    matcher: { path: /etc/shadow }
    action: Block
  - resourceKind: File
    matcher: { dir: /etc }
    action: Block
  - resourceKind: File
    matcher: { pattern: "/etc/sha*" }
    action: Block
"#,
        );
        let allowing = rule_set(
            r#"
name: multi
rules:
  - resourceKind: File
    matcher: { path: /etc/shadow }
    action: Allow
  - resourceKind: File
    matcher: { dir: /etc }
    action: Allow
"#,
        );

        let index = Arc::new(RuleIndex::new());
        index.add_policy(blocking.clone()).unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let index = Arc::clone(&index);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    let event = AccessEvent::file("/etc/shadow", FileOp::Read);
                    let mut observed = 0usize;
                    loop {
                        let hits = index.lookup(ResourceKind::File, &event);
                        let actions: Vec<RuleAction> = hits.iter().map(|r| r.action).collect();
                        let whole_old = actions == [RuleAction::Block; 3];
                        let whole_new = actions == [RuleAction::Allow; 2];
                        assert!(whole_old || whole_new, "torn replace: {actions:?}");
                        observed += 1;
                        if stop.load(Ordering::Relaxed) {
                            return observed;
                        }
                    }
                })
            })
            .collect();

        for i in 0..200 {
            let next = if i % 2 == 0 { &allowing } else { &blocking };
            index.replace_policy(next.clone()).unwrap();
        }
        stop.store(true, Ordering::Relaxed);

        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
        let snap = index.snapshot();
        assert_eq!(snap.generation(), 201);
        assert_eq!(snap.rule_count("multi"), Some(3));
    }
}
