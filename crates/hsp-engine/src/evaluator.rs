use std::sync::Arc;

use tracing::trace;

use crate::decision::{DefaultPosture, Verdict};
use crate::event::AccessEvent;
use crate::index::{IndexSnapshot, RuleIndex};

/// Computes verdicts against the live [`RuleIndex`].
///
/// The engine holds no lock while deciding: each call clones the current
/// snapshot and reads it, so any number of interception points can decide
/// concurrently while policies change underneath.
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    index: Arc<RuleIndex>,
    posture: DefaultPosture,
}

impl DecisionEngine {
    pub fn new(index: Arc<RuleIndex>, posture: DefaultPosture) -> Self {
        Self { index, posture }
    }

    pub fn posture(&self) -> DefaultPosture {
        self.posture
    }

    pub fn index(&self) -> &Arc<RuleIndex> {
        &self.index
    }

    /// Decide `event` against the current rule set.
    pub fn decide(&self, event: &AccessEvent) -> Verdict {
        let snapshot = self.index.snapshot();
        self.decide_with(&snapshot, event)
    }

    /// Decide `event` against a specific snapshot.
    ///
    /// The per-kind rule lists are presorted by precedence, so the first
    /// matching rule is the winner.
    pub fn decide_with(&self, snapshot: &IndexSnapshot, event: &AccessEvent) -> Verdict {
        match snapshot.first_match(event) {
            Some(rule) => {
                trace!(
                    rule = %rule.id,
                    action = %rule.action,
                    generation = snapshot.generation(),
                    "rule matched event"
                );
                Verdict::from_rule(Arc::clone(rule))
            }
            None => {
                trace!(
                    kind = %event.kind(),
                    posture = ?self.posture,
                    "no rule matched, applying default posture"
                );
                Verdict::from_posture(self.posture)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::decision::ResolvedAction;
    use crate::event::{FileOp, Protocol};
    use crate::loader::load_policy_from_str;

    fn engine(posture: DefaultPosture, policies: &[&str]) -> DecisionEngine {
        let index = Arc::new(RuleIndex::new());
        for yaml in policies {
            let set = compile(&load_policy_from_str(yaml).unwrap()).unwrap();
            index.add_policy(set).unwrap();
        }
        DecisionEngine::new(index, posture)
    }

    const FILE_POLICY: &str = r#"
name: test-hsp-policy-file-access
rules:
  - resourceKind: File
    matcher: { path: /etc/shadow }
    action: Block
  - resourceKind: File
    matcher: { path: /etc/hosts }
    action: Allow
"#;

    const NETWORK_POLICY: &str = r#"
name: test-hsp-policy-network-access
rules:
  - resourceKind: Network
    matcher: { protocol: http }
    action: Block
  - resourceKind: Network
    matcher: { protocol: http, destination: allowed-site.com }
    action: Allow
"#;

    const PROCESS_POLICY: &str = r#"
name: test-hsp-policy-process-execution
rules:
  - resourceKind: Process
    matcher: { executable: /bin/ping }
    action: Block
  - resourceKind: Process
    matcher: { executable: /bin/ls }
    action: Allow
"#;

    #[test]
    fn file_access_scenario() {
        let e = engine(DefaultPosture::Allow, &[FILE_POLICY]);

        let v = e.decide(&AccessEvent::file("/etc/shadow", FileOp::Read));
        assert_eq!(v.action, ResolvedAction::Block);
        assert_eq!(v.policy_name(), "test-hsp-policy-file-access");
        assert_eq!(v.rule_id().map(|id| id.index), Some(0));
        assert!(v.as_io_result().is_err());

        let v = e.decide(&AccessEvent::file("/etc/hosts", FileOp::Read));
        assert_eq!(v.action, ResolvedAction::Allow);
        assert_eq!(v.rule_id().map(|id| id.index), Some(1));
    }

    #[test]
    fn network_access_scenario() {
        let e = engine(DefaultPosture::Allow, &[NETWORK_POLICY]);

        let v = e.decide(&AccessEvent::network(Protocol::Http, "example.com", Some(80)));
        assert!(v.is_block());
        assert_eq!(v.rule_id().map(|id| id.index), Some(0));

        let v = e.decide(&AccessEvent::network(
            Protocol::Http,
            "allowed-site.com",
            Some(80),
        ));
        assert!(!v.is_block());
        assert_eq!(v.rule_id().map(|id| id.index), Some(1));
    }

    #[test]
    fn process_exec_scenario() {
        let e = engine(DefaultPosture::Allow, &[PROCESS_POLICY]);

        let v = e.decide(&AccessEvent::exec("/bin/ping", ["-c", "1", "google.com"]));
        assert!(v.is_block());

        let v = e.decide(&AccessEvent::exec("/bin/ls", ["/"]));
        assert!(!v.is_block());
        assert_eq!(v.policy_name(), "test-hsp-policy-process-execution");
    }

    #[test]
    fn default_posture_scenario() {
        let allow = engine(DefaultPosture::Allow, &[FILE_POLICY]);
        let v = allow.decide(&AccessEvent::file("/tmp/scratch", FileOp::Write));
        assert_eq!(v, Verdict::from_posture(DefaultPosture::Allow));
        assert_eq!(v.policy_name(), "default");

        let block = engine(DefaultPosture::Block, &[FILE_POLICY]);
        let v = block.decide(&AccessEvent::file("/tmp/scratch", FileOp::Write));
        assert!(v.is_block());
        assert!(v.rule.is_none());

        // A file-only policy set has no opinion on process events.
        let v = block.decide(&AccessEvent::exec("/bin/true", Vec::<String>::new()));
        assert!(v.rule.is_none());
    }

    #[test]
    fn decisions_are_deterministic() {
        let e = engine(
            DefaultPosture::Allow,
            &[FILE_POLICY, NETWORK_POLICY, PROCESS_POLICY],
        );
        let events = [
            AccessEvent::file("/etc/shadow", FileOp::Read),
            AccessEvent::network(Protocol::Http, "allowed-site.com", None),
            AccessEvent::exec("/bin/ping", ["localhost"]),
            AccessEvent::file("/var/tmp/x", FileOp::Delete),
        ];
        let first: Vec<Verdict> = events.iter().map(|ev| e.decide(ev)).collect();
        for _ in 0..10 {
            let again: Vec<Verdict> = events.iter().map(|ev| e.decide(ev)).collect();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn block_overrides_allow_across_policies() {
        let allow = r#"
name: a-allow
rules:
  - resourceKind: File
    matcher: { path: /etc/passwd }
    action: Allow
    priority: 1
"#;
        let block = r#"
name: z-block
rules:
  - resourceKind: File
    matcher: { path: /etc/passwd }
    action: Block
"#;
        let e = engine(DefaultPosture::Allow, &[allow, block]);
        let v = e.decide(&AccessEvent::file("/etc/passwd", FileOp::Read));
        assert!(v.is_block());
        assert_eq!(v.policy_name(), "z-block");
    }

    #[test]
    fn exact_path_beats_glob() {
        let policy = r#"
name: specificity
rules:
  - resourceKind: File
    matcher: { pattern: "/etc/*" }
    action: Block
  - resourceKind: File
    matcher: { path: /etc/shadow }
    action: Allow
"#;
        let e = engine(DefaultPosture::Block, &[policy]);
        let v = e.decide(&AccessEvent::file("/etc/shadow", FileOp::Read));
        assert!(!v.is_block());
        assert_eq!(v.rule_id().map(|id| id.index), Some(1));

        let v = e.decide(&AccessEvent::file("/etc/gshadow", FileOp::Read));
        assert!(v.is_block());
        assert_eq!(v.rule_id().map(|id| id.index), Some(0));
    }

    #[test]
    fn priority_breaks_ties_between_same_action() {
        let policy = r#"
name: priorities
rules:
  - resourceKind: Process
    matcher: { dir: /usr/bin }
    action: Audit
  - resourceKind: Process
    matcher: { dir: /usr/sbin }
    action: Audit
"#;
        let other = r#"
name: more-priorities
rules:
  - resourceKind: Process
    matcher: { dir: /usr/bin }
    action: Audit
    priority: 5
"#;
        let e = engine(DefaultPosture::Allow, &[policy, other]);
        let v = e.decide(&AccessEvent::exec("/usr/bin/id", Vec::<String>::new()));
        assert!(v.audited);
        assert!(!v.is_block());
        assert_eq!(v.policy_name(), "more-priorities");
    }

    #[test]
    fn from_source_scopes_rule_to_originating_process() {
        let policy = r#"
name: shadow-readers
rules:
  - resourceKind: File
    matcher: { path: /etc/shadow }
    action: Block
  - resourceKind: File
    fromSource: [/usr/sbin/sshd]
    matcher: { path: /etc/shadow }
    action: Allow
"#;
        let e = engine(DefaultPosture::Allow, &[policy]);
        let sshd = AccessEvent::file("/etc/shadow", FileOp::Read).with_process(40, "/usr/sbin/sshd");
        let cat = AccessEvent::file("/etc/shadow", FileOp::Read).with_process(41, "/bin/cat");
        assert!(!e.decide(&sshd).is_block());
        assert!(e.decide(&cat).is_block());
    }

    #[test]
    fn canonicalized_paths_hit_block_rules() {
        let e = engine(DefaultPosture::Allow, &[FILE_POLICY, PROCESS_POLICY]);

        let shadow = AccessEvent::file("/etc//shadow/", FileOp::Read)
            .canonicalize()
            .unwrap();
        assert!(e.decide(&shadow).is_block());

        let ping = AccessEvent::exec("//bin/ping", ["localhost"])
            .canonicalize()
            .unwrap();
        assert!(e.decide(&ping).is_block());
    }

    #[test]
    fn decide_with_uses_the_given_snapshot() {
        let e = engine(DefaultPosture::Allow, &[FILE_POLICY]);
        let before = e.index().snapshot();
        e.index().remove_policy("test-hsp-policy-file-access").unwrap();

        let event = AccessEvent::file("/etc/shadow", FileOp::Read);
        assert!(e.decide_with(&before, &event).is_block());
        assert!(!e.decide(&event).is_block());
    }
}
